//! External collaborators
//!
//! Model inference and remote OCR live behind these traits. The pipeline only
//! sees the traits, so any stage whose collaborator is absent is skipped.

pub mod remote;

pub use remote::RemoteOcrClient;

use image::RgbImage;
use serde_json::Value;
use std::path::Path;

use crate::error::ItemError;
use crate::storage::records::RecognizedText;
use crate::vision::{BoundingBox, Point};

/// One object found by the vehicle detector
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleDetection {
    /// `[x1, y1, x2, y2]`, possibly outside the image
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub class_name: String,
}

/// One text span found by a local recognition engine
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub polygon: Vec<Point>,
    pub text: String,
    pub confidence: f32,
}

/// Finds vehicles in a photograph before document detection
pub trait VehicleDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<VehicleDetection>, ItemError>;
}

/// Returns coarse text boxes for an image as an opaque payload
pub trait TextDetectionService {
    fn detect_text(&self, image_path: &Path) -> Result<Value, ItemError>;
}

/// Reads the text inside each supplied box
pub trait TextRecognitionService {
    /// One group of recognized items per returned entry, already de-duplicated
    fn recognize(&self, image_path: &Path, boxes: &[BoundingBox]) -> Result<Vec<Vec<RecognizedText>>, ItemError>;
}

/// Full-image text recognition running in-process
pub trait LocalRecognizer {
    fn read_text(&self, image_path: &Path) -> Result<Vec<TextSpan>, ItemError>;
}

/// Remove repeated items, keeping the first occurrence of each in order
pub fn dedup_preserving_order<T: PartialEq + Clone>(items: &[T]) -> Vec<T> {
    let mut unique: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(item) {
            unique.push(item.clone());
        }
    }
    unique
}
