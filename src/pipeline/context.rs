//! Run-scoped state: output layout, run log and per-stage counters

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PathsConfig;
use crate::error::ItemError;
use crate::storage::reset_folder;

const BANNER: &str = "==================================================";
const RULE: &str = "--------------------------------------------------";

/// Item counters for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub successful: usize,
    pub failed: usize,
    pub not_found: usize,
}

impl StageSummary {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    /// Count one item outcome
    pub fn record<T>(&mut self, outcome: &Result<T, ItemError>) {
        match outcome {
            Ok(_) => self.successful += 1,
            Err(e) if e.is_not_found() => self.not_found += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.successful + self.failed + self.not_found
    }
}

/// Human-readable processing log for a single run.
///
/// Truncated when created; every write goes through a buffered writer that
/// is flushed on drop.
pub struct RunLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one line
    pub fn line(&self, text: impl AsRef<str>) {
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", text.as_ref()) {
            warn!("Failed to write run log: {}", e);
        }
    }

    pub fn success(&self, text: impl AsRef<str>) {
        self.line(format!("✓ {}", text.as_ref()));
    }

    pub fn failure(&self, text: impl AsRef<str>) {
        self.line(format!("✗ {}", text.as_ref()));
    }

    pub fn missing(&self, text: impl AsRef<str>) {
        self.line(format!("? {}", text.as_ref()));
    }

    /// Opening banner of a stage section
    pub fn begin_stage(&self, title: &str, heading: &str) {
        self.line(format!("\n\n{}", BANNER));
        self.line(format!("STARTING {} LOG", title));
        self.line(format!("{}\n", BANNER));
        self.line(format!("{}:", heading));
        self.line(RULE);
    }

    /// Summary block and closing banner of a stage section
    pub fn end_stage(&self, title: &str, summary: &StageSummary) {
        self.line(format!("\nTotal Successful: {}", summary.successful));
        self.line(format!("Total Unsuccessful: {}", summary.failed));
        if summary.not_found > 0 {
            self.line(format!("Total Not Found: {}", summary.not_found));
        }
        self.line(format!("Total Processed: {}", summary.total()));
        self.line(format!("\n{}", BANNER));
        self.line(format!("{} LOG END", title));
    }

    /// Error line outside any item, used when a stage aborts early
    pub fn stage_error(&self, title: &str, message: impl AsRef<str>) {
        self.line(format!("\n[{}] ERROR: {}", title, message.as_ref()));
    }

    pub fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!("Failed to flush run log: {}", e);
        }
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        self.flush();
        std::fs::read_to_string(&self.path).unwrap_or_default()
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// State owned by one pipeline run
pub struct RunContext {
    run_id: Uuid,
    paths: PathsConfig,
    log: RunLog,
}

impl RunContext {
    /// Reset the output tree and open a fresh run log
    pub fn start(paths: &PathsConfig) -> Result<Self> {
        std::fs::create_dir_all(&paths.base_path)
            .with_context(|| format!("Failed to create output folder {:?}", paths.base_path))?;

        for folder in paths.output_folders() {
            reset_folder(&folder).with_context(|| format!("Failed to reset folder {:?}", folder))?;
        }
        for file in paths.output_files() {
            if file.exists() {
                debug!("Removing stale stage file: {:?}", file);
                std::fs::remove_file(&file).with_context(|| format!("Failed to remove {:?}", file))?;
            }
        }

        let log = RunLog::create(&paths.log_file())
            .with_context(|| format!("Failed to create run log {:?}", paths.log_file()))?;
        let run_id = Uuid::new_v4();
        log.line(format!("Run ID: {}", run_id));

        Ok(Self {
            run_id,
            paths: paths.clone(),
            log,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }
}
