//! Application Configuration
//!
//! Pipeline settings stored in TOML format. Every stage folder and file is
//! derived from `paths.base_path`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Input/output locations
    pub paths: PathsConfig,
    /// Stage switches
    pub stages: StagesConfig,
    /// Remote recognition services
    pub services: ServicesConfig,
    /// Document boundary detection
    pub quad: QuadConfig,
    /// Text box padding
    pub padding: PaddingConfig,
    /// Fuzzy phrase correction
    pub correction: CorrectionConfig,
}

/// Input and output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of every stage output folder
    pub base_path: PathBuf,
    /// Folder with the raw photographs
    pub input_folder: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("output"),
            input_folder: PathBuf::from("test_images"),
        }
    }
}

impl PathsConfig {
    pub fn yolo_cropped_vehicles_folder(&self) -> PathBuf {
        self.base_path.join("yolo_cropped_vehicles")
    }

    pub fn yolo_detection_vis_folder(&self) -> PathBuf {
        self.base_path.join("yolo_detection_visuals")
    }

    pub fn edge_output_folder(&self) -> PathBuf {
        self.base_path.join("edge_detection_output")
    }

    pub fn successful_folder(&self) -> PathBuf {
        self.base_path.join("successful")
    }

    pub fn unsuccessful_folder(&self) -> PathBuf {
        self.base_path.join("unsuccessful")
    }

    pub fn visualization_folder(&self) -> PathBuf {
        self.base_path.join("visualization")
    }

    pub fn corrected_output_folder(&self) -> PathBuf {
        self.base_path.join("corrected_images")
    }

    pub fn detection_vis_folder(&self) -> PathBuf {
        self.base_path.join("detection_visuals")
    }

    pub fn log_file(&self) -> PathBuf {
        self.base_path.join("processing_log.txt")
    }

    pub fn coordinates_file(&self) -> PathBuf {
        self.base_path.join("coordinates.json")
    }

    pub fn yolo_detection_results_file(&self) -> PathBuf {
        self.base_path.join("yolo_detections.json")
    }

    pub fn detection_results_file(&self) -> PathBuf {
        self.base_path.join("detection_results.json")
    }

    pub fn processed_detection_file(&self) -> PathBuf {
        self.base_path.join("processed_detection_results.json")
    }

    pub fn api_recognition_results_folder(&self) -> PathBuf {
        self.base_path.join("text_recognition_api_results")
    }

    pub fn recognition_results_file(&self) -> PathBuf {
        self.api_recognition_results_folder().join("recognition_results.json")
    }

    pub fn easy_ocr_results_folder(&self) -> PathBuf {
        self.base_path.join("easy_ocr_results")
    }

    pub fn easy_ocr_results_file(&self) -> PathBuf {
        self.easy_ocr_results_folder().join("easy_ocr_results.json")
    }

    pub fn easy_ocr_vis_folder(&self) -> PathBuf {
        self.easy_ocr_results_folder().join("visualizations")
    }

    pub fn final_results_file(&self) -> PathBuf {
        self.base_path.join("final_results.json")
    }

    /// Folders wiped and recreated at the start of every run
    pub fn output_folders(&self) -> Vec<PathBuf> {
        vec![
            self.yolo_cropped_vehicles_folder(),
            self.yolo_detection_vis_folder(),
            self.edge_output_folder(),
            self.successful_folder(),
            self.unsuccessful_folder(),
            self.visualization_folder(),
            self.corrected_output_folder(),
            self.detection_vis_folder(),
            self.api_recognition_results_folder(),
            self.easy_ocr_results_folder(),
        ]
    }

    /// Stage files living directly under `base_path`
    pub fn output_files(&self) -> Vec<PathBuf> {
        vec![
            self.coordinates_file(),
            self.yolo_detection_results_file(),
            self.detection_results_file(),
            self.processed_detection_file(),
            self.final_results_file(),
        ]
    }
}

/// Which stages run. Relative order is fixed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub run_vehicle_detection: bool,
    pub run_edge_detection: bool,
    pub run_perspective_correction: bool,
    pub run_text_detection: bool,
    pub run_post_processing: bool,
    pub run_text_recognition: bool,
    pub run_local_ocr: bool,
    pub run_correction: bool,
    /// Maximum number of input images fed to the pre-crop stage
    pub limit: Option<usize>,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            run_vehicle_detection: true,
            run_edge_detection: true,
            run_perspective_correction: true,
            run_text_detection: true,
            run_post_processing: true,
            run_text_recognition: true,
            run_local_ocr: true,
            run_correction: true,
            limit: Some(10),
        }
    }
}

/// Remote detection and recognition services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Text box detection endpoint (empty = not configured)
    pub detection_api_url: String,
    /// Text recognition endpoint (empty = not configured)
    pub recognition_api_url: String,
    /// Sent as the `X-API-KEY` header
    pub api_key: String,
    /// Fixed sleep before every remote call
    pub request_delay_seconds: f64,
    /// Per-request timeout
    pub timeout_seconds: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            detection_api_url: String::new(),
            recognition_api_url: String::new(),
            api_key: String::new(),
            request_delay_seconds: 2.0,
            timeout_seconds: 60,
        }
    }
}

/// Document boundary detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadConfig {
    /// Gaussian sigma (a 5x5 OpenCV-style kernel corresponds to ~1.1)
    pub blur_sigma: f32,
    /// Canny hysteresis thresholds
    pub canny_low: f32,
    pub canny_high: f32,
    /// Number of largest contours considered
    pub max_contours: usize,
    /// Polygon approximation tolerance as a fraction of the perimeter
    pub approx_epsilon_ratio: f64,
    /// Draw the accepted boundary over the source image
    pub draw_audit: bool,
}

impl Default for QuadConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.1,
            canny_low: 100.0,
            canny_high: 200.0,
            max_contours: 100,
            approx_epsilon_ratio: 0.10,
            draw_audit: true,
        }
    }
}

/// What happens when refinement produces a degenerate box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Any degenerate box reverts the whole set to the coarse boxes
    #[default]
    WholeSet,
    /// Only the degenerate box reverts to its coarse box
    PerBox,
}

/// Text box padding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingConfig {
    pub horizontal_ratio: f32,
    pub vertical_ratio: f32,
    pub min_horizontal: u32,
    pub max_horizontal: u32,
    pub min_vertical: u32,
    pub max_vertical: u32,
    pub fallback: FallbackPolicy,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            horizontal_ratio: 0.50,
            vertical_ratio: 0.50,
            min_horizontal: 2,
            max_horizontal: 10,
            min_vertical: 2,
            max_vertical: 8,
            fallback: FallbackPolicy::WholeSet,
        }
    }
}

/// Fuzzy phrase correction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Minimum similarity for a candidate to count as a match
    pub matching_threshold: f64,
    /// Minimum similarity for a match to be substituted
    pub replacement_threshold: f64,
    /// Longest word window tried
    pub max_n: usize,
    /// Target phrases; empty uses the built-in district gazetteer
    pub gazetteer: Vec<String>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            matching_threshold: 0.6,
            replacement_threshold: 0.8,
            max_n: 3,
            gazetteer: Vec::new(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.paths.base_path, PathBuf::from("output"));
        assert_eq!(config.stages.limit, Some(10));
        assert!(config.stages.run_edge_detection);
        assert!((config.services.request_delay_seconds - 2.0).abs() < f64::EPSILON);

        assert_eq!(config.quad.max_contours, 100);
        assert!((config.quad.approx_epsilon_ratio - 0.10).abs() < f64::EPSILON);

        assert_eq!(config.padding.min_horizontal, 2);
        assert_eq!(config.padding.max_horizontal, 10);
        assert_eq!(config.padding.min_vertical, 2);
        assert_eq!(config.padding.max_vertical, 8);
        assert_eq!(config.padding.fallback, FallbackPolicy::WholeSet);

        assert!((config.correction.matching_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.correction.max_n, 3);
    }

    #[test]
    fn test_derived_paths() {
        let paths = PathsConfig {
            base_path: PathBuf::from("/tmp/run"),
            ..Default::default()
        };

        assert_eq!(paths.log_file(), PathBuf::from("/tmp/run/processing_log.txt"));
        assert_eq!(
            paths.recognition_results_file(),
            PathBuf::from("/tmp/run/text_recognition_api_results/recognition_results.json")
        );
        assert_eq!(
            paths.easy_ocr_vis_folder(),
            PathBuf::from("/tmp/run/easy_ocr_results/visualizations")
        );
        assert!(paths.output_folders().iter().all(|p| p.starts_with("/tmp/run")));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [padding]
            max_horizontal = 20
            fallback = "per_box"

            [stages]
            run_local_ocr = false
            "#,
        )
        .unwrap();

        assert_eq!(parsed.padding.max_horizontal, 20);
        assert_eq!(parsed.padding.min_horizontal, 2);
        assert_eq!(parsed.padding.fallback, FallbackPolicy::PerBox);
        assert!(!parsed.stages.run_local_ocr);
        assert!(parsed.stages.run_edge_detection);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.services.api_key = "secret".to_string();
        config.stages.limit = Some(3);

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.services.api_key, "secret");
        assert_eq!(loaded.stages.limit, Some(3));
        assert_eq!(loaded.quad.max_contours, config.quad.max_contours);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_saved_paths_section_has_no_weights() {
        let saved = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(!saved.contains("weights_path"));

        // Older files that still carry the key load fine
        let parsed: AppConfig = toml::from_str(
            r#"
            [paths]
            base_path = "out"
            weights_path = "weights/best.pt"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.paths.base_path, PathBuf::from("out"));
    }
}
