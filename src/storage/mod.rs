//! Storage Layer
//!
//! Filesystem-backed intermediate store shared by the pipeline stages:
//! folder lifecycle, image listing, and JSON persistence of stage records.

pub mod records;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StoreError;

/// Extensions accepted as pipeline images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif"];

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "vde", "VdePipeline")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Delete a folder's contents (or the folder itself) and recreate it empty
pub fn reset_folder(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        debug!("Clearing folder: {:?}", path);
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}

/// Create the parent directory of a file path if needed
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Write a value as indented JSON, keeping non-ASCII text as-is
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    ensure_parent(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a JSON stage file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether a path carries one of the accepted image extensions
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// List the images directly inside a folder, naturally sorted by file name
pub fn list_images(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    if !folder.exists() {
        return Ok(images);
    }

    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }

    images.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    Ok(images)
}

/// File name of a path as an owned string
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// File stem of a name ("a.b.jpg" -> "a.b")
pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Locate an image by exact name, or by its stem with any known extension
pub fn find_image_in_directory(folder: &Path, image_name: &str) -> Option<PathBuf> {
    let direct = folder.join(image_name);
    if direct.is_file() {
        return Some(direct);
    }

    let stem = file_stem(image_name);
    IMAGE_EXTENSIONS
        .iter()
        .flat_map(|ext| [ext.to_string(), ext.to_ascii_uppercase()])
        .map(|ext| folder.join(format!("{}.{}", stem, ext)))
        .find(|candidate| candidate.is_file())
}

/// Natural ordering: digit runs compare numerically, text case-insensitively
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = natural_key(a);
    let right = natural_key(b);
    left.cmp(&right)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Text(String),
    Number(u128, usize),
}

/// Split into alternating text/number parts. Always starts with a text part
/// (possibly empty) so that parts at the same index have the same kind.
fn natural_key(s: &str) -> Vec<KeyPart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            if digits.is_empty() {
                parts.push(KeyPart::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(c);
        } else {
            if !digits.is_empty() {
                parts.push(number_part(&std::mem::take(&mut digits)));
            }
            text.push(c);
        }
    }

    if !digits.is_empty() {
        parts.push(number_part(&digits));
    } else {
        parts.push(KeyPart::Text(text.to_lowercase()));
    }

    parts
}

fn number_part(digits: &str) -> KeyPart {
    // Leading zeros break ties so "01" and "1" stay distinct
    let value = digits.parse::<u128>().unwrap_or(u128::MAX);
    KeyPart::Number(value, digits.len())
}
