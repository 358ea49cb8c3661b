//! Pipeline Orchestration
//!
//! Runs the enabled stages in their fixed order over one output tree:
//! vehicle pre-crop, document boundary, perspective, text detection, box
//! refinement, text recognition, local OCR, phrase correction.

pub mod context;
pub mod stages;

pub use context::{RunContext, StageSummary};

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::correction::PhraseCorrector;
use crate::error::PipelineFailure;
use crate::services::{LocalRecognizer, TextDetectionService, TextRecognitionService, VehicleDetector};
use crate::storage::records::CombinedResults;
use crate::storage::{list_images, write_json};
use crate::vision::{BoundingBoxRefiner, PerspectiveRectifier, QuadrilateralFinder};

/// Optional external collaborators. A stage whose collaborator is `None`
/// is skipped.
#[derive(Default)]
pub struct Collaborators {
    pub vehicle_detector: Option<Box<dyn VehicleDetector>>,
    pub text_detector: Option<Box<dyn TextDetectionService>>,
    pub text_recognizer: Option<Box<dyn TextRecognitionService>>,
    pub local_recognizer: Option<Box<dyn LocalRecognizer>>,
}

/// Outcome of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub summaries: Vec<StageSummary>,
    /// Merged per-image recognition, also written to `final_results.json`
    pub results: CombinedResults,
}

/// Sequences the stages of one pipeline run
pub struct PipelineOrchestrator {
    config: AppConfig,
    collaborators: Collaborators,
    finder: QuadrilateralFinder,
    rectifier: PerspectiveRectifier,
    refiner: BoundingBoxRefiner,
    corrector: PhraseCorrector,
}

impl PipelineOrchestrator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let finder = QuadrilateralFinder::new(config.quad.clone());
        let refiner = BoundingBoxRefiner::from_config(&config.padding);
        let corrector = PhraseCorrector::new(&config.correction);

        Self {
            config,
            collaborators,
            finder,
            rectifier: PerspectiveRectifier::new(),
            refiner,
            corrector,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Execute every enabled stage. Item failures never end the run; any
    /// other fault is returned as a `PipelineFailure` carrying the run log.
    pub fn run(&self) -> Result<RunReport, PipelineFailure> {
        let ctx = RunContext::start(&self.config.paths).map_err(|e| {
            error!("Could not prepare output folders: {:#}", e);
            PipelineFailure::new(format!("Document processing failed: {:#}", e), String::new())
        })?;
        info!("Starting run {}", ctx.run_id());

        match self.run_stages(&ctx) {
            Ok((summaries, results)) => {
                ctx.log().flush();
                info!("Run {} finished", ctx.run_id());
                Ok(RunReport {
                    run_id: ctx.run_id(),
                    summaries,
                    results,
                })
            }
            Err(e) => {
                error!("Run {} failed: {:#}", ctx.run_id(), e);
                ctx.log().line(format!("\nFATAL: {:#}", e));
                Err(PipelineFailure::new(
                    format!("Document processing failed: {:#}", e),
                    ctx.log().contents(),
                ))
            }
        }
    }

    fn run_stages(&self, ctx: &RunContext) -> Result<(Vec<StageSummary>, CombinedResults)> {
        let stages_cfg = &self.config.stages;
        let paths = ctx.paths();
        let delay = Duration::from_secs_f64(self.config.services.request_delay_seconds.max(0.0));
        let mut summaries = Vec::new();

        let mut edge_inputs: Vec<PathBuf> = Vec::new();
        if stages_cfg.run_vehicle_detection {
            match self.collaborators.vehicle_detector.as_deref() {
                Some(detector) => {
                    let (summary, crops) = stages::run_vehicle_detection(ctx, detector, stages_cfg.limit)?;
                    summaries.push(summary);
                    edge_inputs = crops;
                }
                None => self.skip(ctx, stages::VEHICLE_STAGE, "no vehicle detector configured"),
            }
        }
        if edge_inputs.is_empty() {
            edge_inputs = list_images(&paths.input_folder)?;
        }

        if stages_cfg.run_edge_detection {
            summaries.push(stages::run_edge_detection(ctx, &self.finder, &edge_inputs)?);
        }

        if stages_cfg.run_perspective_correction {
            summaries.push(stages::run_perspective_correction(ctx, &self.rectifier)?);
        }

        if stages_cfg.run_text_detection {
            match self.collaborators.text_detector.as_deref() {
                Some(service) => summaries.push(stages::run_text_detection(ctx, service, delay)?),
                None => self.skip(ctx, stages::TEXT_DETECTION_STAGE, "no detection service configured"),
            }
        }

        if stages_cfg.run_post_processing {
            summaries.push(stages::run_post_processing(ctx, &self.refiner)?);
        }

        if stages_cfg.run_text_recognition {
            match self.collaborators.text_recognizer.as_deref() {
                Some(service) => summaries.push(stages::run_text_recognition(ctx, service, delay)?),
                None => self.skip(ctx, stages::RECOGNITION_STAGE, "no recognition service configured"),
            }
        }

        if stages_cfg.run_local_ocr {
            match self.collaborators.local_recognizer.as_deref() {
                Some(engine) => summaries.push(stages::run_local_ocr(ctx, engine)?),
                None => self.skip(ctx, stages::LOCAL_OCR_STAGE, "no local recognition engine configured"),
            }
        }

        let results = if stages_cfg.run_correction {
            let (summary, results) = stages::run_correction(ctx, &self.corrector)?;
            summaries.push(summary);
            results
        } else {
            stages::load_combined_results(ctx, stages::MERGE_STAGE).unwrap_or_default()
        };
        write_json(&paths.final_results_file(), &results)?;

        Ok((summaries, results))
    }

    fn skip(&self, ctx: &RunContext, stage: &str, reason: &str) {
        info!("Skipping {}: {}", stage, reason);
        ctx.log().line(format!("\n[{}] SKIPPED: {}", stage, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::error::ItemError;
    use crate::services::{TextSpan, VehicleDetection};
    use crate::storage::read_json;
    use crate::storage::records::{
        CoordinateStore, LocalOcrOutcome, LocalOcrResults, RecognitionOutcome, RecognizedText, VehicleCropRecord,
    };
    use crate::vision::BoundingBox;
    use image::{Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::TempDir;

    /// Dark background with a light document; text-like dark blocks inside
    fn document_photo() -> RgbImage {
        let mut img = RgbImage::from_pixel(220, 180, Rgb([10, 10, 10]));
        for y in 30..=150 {
            for x in 40..=180 {
                img.put_pixel(x, y, Rgb([240, 240, 240]));
            }
        }
        for y in 60..=75 {
            for x in 70..=130 {
                img.put_pixel(x, y, Rgb([30, 30, 30]));
            }
        }
        img
    }

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths = PathsConfig {
            base_path: dir.path().join("output"),
            input_folder: dir.path().join("input"),
            ..Default::default()
        };
        config.services.request_delay_seconds = 0.0;
        config
    }

    fn write_inputs(config: &AppConfig, images: &[(&str, RgbImage)]) {
        std::fs::create_dir_all(&config.paths.input_folder).unwrap();
        for (name, image) in images {
            image.save(config.paths.input_folder.join(name)).unwrap();
        }
    }

    struct FixedDetector;

    impl TextDetectionService for FixedDetector {
        fn detect_text(&self, _image_path: &Path) -> Result<Value, ItemError> {
            Ok(json!([{"horizontal_list": [[20, 110, 20, 60], [20, 110, 20, 60]], "free_list": []}]))
        }
    }

    struct EchoRecognizer;

    impl TextRecognitionService for EchoRecognizer {
        fn recognize(&self, _image_path: &Path, boxes: &[BoundingBox]) -> Result<Vec<Vec<RecognizedText>>, ItemError> {
            Ok(boxes.iter().map(|_| vec![RecognizedText::new("ঢাকা মেট্রে গ-১২")]).collect())
        }
    }

    struct BrokenEngine;

    impl LocalRecognizer for BrokenEngine {
        fn read_text(&self, _image_path: &Path) -> Result<Vec<TextSpan>, ItemError> {
            Err(ItemError::Engine("model not loaded".to_string()))
        }
    }

    struct NothingFound;

    impl VehicleDetector for NothingFound {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<VehicleDetection>, ItemError> {
            Ok(Vec::new())
        }
    }

    /// One box hanging off the top-left corner, one entirely outside the image
    struct FixedVehicles;

    impl VehicleDetector for FixedVehicles {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<VehicleDetection>, ItemError> {
            Ok(vec![
                VehicleDetection {
                    bbox: [-10, -5, 150, 120],
                    confidence: 0.91,
                    class_name: "car".to_string(),
                },
                VehicleDetection {
                    bbox: [300, 300, 400, 400],
                    confidence: 0.40,
                    class_name: "truck".to_string(),
                },
            ])
        }
    }

    struct FixedSpans;

    impl LocalRecognizer for FixedSpans {
        fn read_text(&self, _image_path: &Path) -> Result<Vec<TextSpan>, ItemError> {
            Ok(vec![TextSpan {
                polygon: vec![(12.7, 3.2), (40.1, 5.0), (39.0, 20.9), (11.0, 18.0)],
                text: "ঢাকা মেট্রে গ-১২".to_string(),
                confidence: 0.87,
            }])
        }
    }

    /// Answers with no text after overwriting `target` with broken JSON
    struct CorruptingEngine {
        target: PathBuf,
    }

    impl LocalRecognizer for CorruptingEngine {
        fn read_text(&self, _image_path: &Path) -> Result<Vec<TextSpan>, ItemError> {
            if let Some(parent) = self.target.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&self.target, "{ broken").unwrap();
            Ok(Vec::new())
        }
    }

    fn read_log(config: &AppConfig) -> String {
        std::fs::read_to_string(config.paths.log_file()).unwrap()
    }

    #[test]
    fn test_failed_item_does_not_stop_stage() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(
            &config,
            &[
                ("a.png", document_photo()),
                ("b.png", RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]))),
                ("c.png", document_photo()),
            ],
        );

        let report = PipelineOrchestrator::new(config.clone(), Collaborators::default())
            .run()
            .unwrap();

        let edge = &report.summaries[0];
        assert_eq!(edge.stage, stages::EDGE_STAGE);
        assert_eq!((edge.successful, edge.failed), (2, 1));

        let coordinates: CoordinateStore = read_json(&config.paths.coordinates_file()).unwrap();
        assert_eq!(coordinates.keys().collect::<Vec<_>>(), vec!["a.png", "c.png"]);
        assert!(config.paths.unsuccessful_folder().join("b.png").is_file());
        assert!(config.paths.corrected_output_folder().join("corrected_a.jpg").is_file());
        assert!(config.paths.corrected_output_folder().join("corrected_c.jpg").is_file());

        let log = std::fs::read_to_string(config.paths.log_file()).unwrap();
        assert!(log.contains("Total Unsuccessful: 1"));
        assert!(log.contains("✗ Failed to detect edges for: b.png"));
        assert!(log.contains("SKIPPED: no detection service configured"));
    }

    #[test]
    fn test_rerun_leaves_only_new_artifacts() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config, &[("first.png", document_photo())]);

        PipelineOrchestrator::new(config.clone(), Collaborators::default())
            .run()
            .unwrap();
        assert!(config.paths.successful_folder().join("first.png").is_file());

        std::fs::remove_file(config.paths.input_folder.join("first.png")).unwrap();
        write_inputs(&config, &[("second.png", document_photo())]);

        PipelineOrchestrator::new(config.clone(), Collaborators::default())
            .run()
            .unwrap();

        assert!(!config.paths.successful_folder().join("first.png").exists());
        assert!(!config.paths.corrected_output_folder().join("corrected_first.jpg").exists());
        assert!(config.paths.successful_folder().join("second.png").is_file());

        let coordinates: CoordinateStore = read_json(&config.paths.coordinates_file()).unwrap();
        assert_eq!(coordinates.len(), 1);
        assert!(coordinates.contains_key("second.png"));
    }

    #[test]
    fn test_full_run_with_collaborators() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.correction.gazetteer = vec!["ঢাকা মেট্রো".to_string()];
        write_inputs(&config, &[("plate.png", document_photo())]);

        let collaborators = Collaborators {
            vehicle_detector: Some(Box::new(NothingFound)),
            text_detector: Some(Box::new(FixedDetector)),
            text_recognizer: Some(Box::new(EchoRecognizer)),
            local_recognizer: Some(Box::new(BrokenEngine)),
        };

        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        let vehicle = &report.summaries[0];
        assert_eq!((vehicle.successful, vehicle.failed), (0, 1));

        let stage_names: Vec<&str> = report.summaries.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stage_names,
            vec![
                stages::VEHICLE_STAGE,
                stages::EDGE_STAGE,
                stages::PERSPECTIVE_STAGE,
                stages::TEXT_DETECTION_STAGE,
                stages::REFINEMENT_STAGE,
                stages::RECOGNITION_STAGE,
                stages::LOCAL_OCR_STAGE,
                stages::CORRECTION_STAGE,
            ]
        );

        let record = &report.results["corrected_plate.jpg"];
        let Some(RecognitionOutcome::Recognized { bboxes, recognized_texts }) = &record.main_recognition else {
            panic!("expected recognized text, got {:?}", record.main_recognition);
        };
        // Duplicate detector boxes collapse to one request box
        assert_eq!(bboxes.len(), 1);
        assert_eq!(recognized_texts[0][0].text, "ঢাকা মেট্রো গ-১২");
        assert!(record.easy_ocr_recognition.is_some());

        let on_disk: Value = read_json(&config.paths.final_results_file()).unwrap();
        assert!(on_disk["corrected_plate.jpg"]["easy_ocr_recognition"]["error"]
            .as_str()
            .unwrap()
            .contains("model not loaded"));
        assert!(config
            .paths
            .detection_vis_folder()
            .join("corrected_plate.jpg")
            .is_file());
    }

    #[test]
    fn test_missing_stage_input_is_logged_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.stages.run_vehicle_detection = false;
        config.stages.run_edge_detection = false;
        std::fs::create_dir_all(&config.paths.input_folder).unwrap();

        let report = PipelineOrchestrator::new(config.clone(), Collaborators::default())
            .run()
            .unwrap();

        let perspective = &report.summaries[0];
        assert_eq!(perspective.stage, stages::PERSPECTIVE_STAGE);
        assert_eq!(perspective.total(), 0);
        assert!(report.results.is_empty());

        let log = std::fs::read_to_string(config.paths.log_file()).unwrap();
        assert!(log.contains("[PERSPECTIVE CORRECTION] ERROR"));
    }

    #[test]
    fn test_unwritable_output_is_structured_failure() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        // A regular file where the output folder should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        config.paths.base_path = blocker;

        let failure = PipelineOrchestrator::new(config, Collaborators::default())
            .run()
            .unwrap_err();

        assert!(failure.message.starts_with("Document processing failed"));
    }

    #[test]
    fn test_image_without_vehicles_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config, &[("a.png", document_photo())]);

        let collaborators = Collaborators {
            vehicle_detector: Some(Box::new(NothingFound)),
            ..Default::default()
        };
        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        let vehicle = &report.summaries[0];
        assert_eq!(vehicle.stage, stages::VEHICLE_STAGE);
        assert_eq!((vehicle.successful, vehicle.failed), (0, 1));

        // No crops, so edge detection falls back to the input folder
        let edge = &report.summaries[1];
        assert_eq!(edge.stage, stages::EDGE_STAGE);
        assert_eq!(edge.successful, 1);

        let log = read_log(&config);
        assert!(log.starts_with(&format!("Run ID: {}", report.run_id)));
        assert!(log.contains("✗ No vehicles detected in: a.png"));
        assert!(!log.contains("✓ No vehicles"));
    }

    #[test]
    fn test_vehicle_crops_feed_edge_detection() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config, &[("car.png", document_photo())]);

        let collaborators = Collaborators {
            vehicle_detector: Some(Box::new(FixedVehicles)),
            ..Default::default()
        };
        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        let vehicle = &report.summaries[0];
        assert_eq!((vehicle.successful, vehicle.failed), (1, 0));

        let crops = config.paths.yolo_cropped_vehicles_folder();
        let crop_path = crops.join("car_vehicle_crop_0_car.jpg");
        let crop = image::open(&crop_path).unwrap();
        assert_eq!((crop.width(), crop.height()), (150, 120));
        assert!(!crops.join("car_vehicle_crop_1_truck.jpg").exists());
        assert!(config.paths.yolo_detection_vis_folder().join("car_detected.jpg").is_file());

        let records: Vec<VehicleCropRecord> = read_json(&config.paths.yolo_detection_results_file()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_image, "car.png");
        assert_eq!(records[0].bbox, [0, 0, 150, 120]);
        assert_eq!(records[0].class_name, "car");
        assert_eq!(records[0].cropped_image_path, crop_path.to_string_lossy());

        let edge = &report.summaries[1];
        assert_eq!(edge.stage, stages::EDGE_STAGE);
        assert_eq!(edge.total(), 1);

        let log = read_log(&config);
        assert!(log.contains("✗ empty crop for box 1 in: car.png"));
        assert!(log.contains("edges for: car_vehicle_crop_0_car.jpg"));
        assert!(!log.contains("edges for: car.png"));
    }

    #[test]
    fn test_local_ocr_results_are_stored_and_corrected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.correction.gazetteer = vec!["ঢাকা মেট্রো".to_string()];
        write_inputs(&config, &[("plate.png", document_photo())]);

        let collaborators = Collaborators {
            local_recognizer: Some(Box::new(FixedSpans)),
            ..Default::default()
        };
        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        let record = &report.results["corrected_plate.jpg"];
        assert!(record.main_recognition.is_none());
        let Some(LocalOcrOutcome::Recognized { easy_ocr_results }) = &record.easy_ocr_recognition else {
            panic!("expected local text, got {:?}", record.easy_ocr_recognition);
        };
        assert_eq!(easy_ocr_results.len(), 1);
        let item = &easy_ocr_results[0];
        assert_eq!(item.bbox, [11, 3, 40, 20]);
        assert_eq!(item.raw_bbox.len(), 4);
        assert_eq!(item.raw_bbox[0], [12.7, 3.2]);
        assert_eq!(item.text, "ঢাকা মেট্রো গ-১২");
        assert!((item.confidence - 0.87).abs() < 1e-6);

        assert!(config
            .paths
            .easy_ocr_vis_folder()
            .join("corrected_plate.jpg")
            .is_file());

        // The stage file keeps the engine's raw text
        let stored: LocalOcrResults = read_json(&config.paths.easy_ocr_results_file()).unwrap();
        let Some(LocalOcrOutcome::Recognized { easy_ocr_results }) = stored.get("corrected_plate.jpg") else {
            panic!("expected stored local text");
        };
        assert_eq!(easy_ocr_results[0].text, "ঢাকা মেট্রে গ-১২");
    }

    #[test]
    fn test_perspective_counts_bad_corners_and_missing_images() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let ctx = RunContext::start(&config.paths).unwrap();

        document_photo()
            .save(config.paths.successful_folder().join("a.png"))
            .unwrap();
        let corners = vec![[40.0, 30.0], [180.0, 30.0], [180.0, 150.0], [40.0, 150.0]];
        let mut coordinates = CoordinateStore::new();
        coordinates.insert("a.png".to_string(), corners.clone());
        coordinates.insert("b.png".to_string(), vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0]]);
        coordinates.insert("gone.png".to_string(), corners);
        write_json(&config.paths.coordinates_file(), &coordinates).unwrap();

        let summary = stages::run_perspective_correction(&ctx, &PerspectiveRectifier::new()).unwrap();

        assert_eq!((summary.successful, summary.failed, summary.not_found), (1, 1, 1));
        assert!(config.paths.corrected_output_folder().join("corrected_a.jpg").is_file());

        let log = ctx.log().contents();
        assert!(log.contains("✓ Corrected perspective for: a.png"));
        assert!(log.contains("✗ Perspective correction failed for: b.png"));
        assert!(log.contains("? Image not found: gone.png"));
        assert!(log.contains("Total Not Found: 1\n"));
        assert!(log.contains("Total Processed: 3\n"));
    }

    #[test]
    fn test_malformed_stage_input_skips_stage() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let ctx = RunContext::start(&config.paths).unwrap();
        std::fs::write(config.paths.coordinates_file(), "{ broken").unwrap();

        let summary = stages::run_perspective_correction(&ctx, &PerspectiveRectifier::new()).unwrap();

        assert_eq!(summary.total(), 0);
        assert!(ctx
            .log()
            .contents()
            .contains("[PERSPECTIVE CORRECTION] ERROR: invalid JSON"));
    }

    #[test]
    fn test_malformed_recognition_file_with_correction() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config, &[("plate.png", document_photo())]);

        let collaborators = Collaborators {
            local_recognizer: Some(Box::new(CorruptingEngine {
                target: config.paths.recognition_results_file(),
            })),
            ..Default::default()
        };
        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        let correction = report.summaries.last().unwrap();
        assert_eq!(correction.stage, stages::CORRECTION_STAGE);
        assert_eq!(correction.total(), 0);
        assert!(report.results.is_empty());
        assert!(read_log(&config).contains("[N-GRAM SIMILARITY POST-PROCESSING] ERROR: invalid JSON"));
    }

    #[test]
    fn test_malformed_recognition_file_without_correction() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.stages.run_correction = false;
        write_inputs(&config, &[("plate.png", document_photo())]);

        let collaborators = Collaborators {
            local_recognizer: Some(Box::new(CorruptingEngine {
                target: config.paths.recognition_results_file(),
            })),
            ..Default::default()
        };
        let report = PipelineOrchestrator::new(config.clone(), collaborators).run().unwrap();

        assert!(report.results.is_empty());
        let on_disk: Value = read_json(&config.paths.final_results_file()).unwrap();
        assert_eq!(on_disk, json!({}));
        assert!(read_log(&config).contains("[RESULT MERGE] ERROR: invalid JSON"));
    }
}
