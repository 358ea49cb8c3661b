//! Stage implementations
//!
//! Every stage reads its input from the store, processes items one at a
//! time and writes its output back. Item failures are logged and counted;
//! a missing or unreadable input file makes the stage log and return early.
//! Any other error propagates and ends the run.

use anyhow::Result;
use image::RgbImage;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use super::context::{RunContext, StageSummary};
use crate::config::PathsConfig;
use crate::correction::PhraseCorrector;
use crate::error::{ItemError, StoreError};
use crate::services::{
    dedup_preserving_order, LocalRecognizer, TextDetectionService, TextRecognitionService, VehicleDetector,
};
use crate::storage::records::{
    CombinedResults, CoordinateStore, DetectionOutcome, DetectionResults, LocalOcrOutcome, LocalOcrResults,
    LocalOcrText, ProcessedDetections, RecognitionOutcome, RecognitionResults, VehicleCropRecord,
};
use crate::storage::{file_name, file_stem, find_image_in_directory, list_images, natural_cmp, read_json, write_json};
use crate::vision::{
    load_rgb, save_rgb, visualize, BoundingBox, BoundingBoxRefiner, PerspectiveRectifier, Quadrilateral,
    QuadrilateralFinder,
};

pub const VEHICLE_STAGE: &str = "VEHICLE DETECTION";
pub const EDGE_STAGE: &str = "EDGE DETECTION";
pub const PERSPECTIVE_STAGE: &str = "PERSPECTIVE CORRECTION";
pub const TEXT_DETECTION_STAGE: &str = "TEXT DETECTION";
pub const REFINEMENT_STAGE: &str = "BOX REFINEMENT";
pub const RECOGNITION_STAGE: &str = "TEXT RECOGNITION";
pub const LOCAL_OCR_STAGE: &str = "LOCAL OCR";
pub const CORRECTION_STAGE: &str = "N-GRAM SIMILARITY POST-PROCESSING";
pub const MERGE_STAGE: &str = "RESULT MERGE";

/// Fixed pause before a remote call
fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// Read a stage input, logging instead of failing when it is absent or broken
fn load_stage_input<T: DeserializeOwned>(ctx: &RunContext, stage: &str, path: &Path) -> Option<T> {
    match read_json(path) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{} skipped: {}", stage, e);
            ctx.log().stage_error(stage, e.to_string());
            None
        }
    }
}

fn copy_image(from: &Path, to: &Path) -> Result<(), ItemError> {
    std::fs::copy(from, to).map(|_| ()).map_err(|source| ItemError::Write {
        path: to.to_path_buf(),
        source,
    })
}

/// Keys sorted the way input folders are listed
fn natural_keys<V>(map: &std::collections::BTreeMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort_by(|a, b| natural_cmp(a, b));
    keys
}

// -- Vehicle pre-crop ---------------------------------------------------------

/// Crop detected vehicles out of the input photographs. Returns the crop
/// paths, which replace the input folder for edge detection.
pub fn run_vehicle_detection(
    ctx: &RunContext,
    detector: &dyn VehicleDetector,
    limit: Option<usize>,
) -> Result<(StageSummary, Vec<PathBuf>)> {
    let paths = ctx.paths();
    let log = ctx.log();
    let mut inputs = list_images(&paths.input_folder)?;
    if let Some(limit) = limit {
        inputs.truncate(limit);
    }
    info!("Running vehicle detection on {} images", inputs.len());

    let mut summary = StageSummary::new(VEHICLE_STAGE);
    let mut records: Vec<VehicleCropRecord> = Vec::new();

    log.begin_stage(VEHICLE_STAGE, "PROCESSING IMAGES FOR VEHICLE DETECTION");
    for path in &inputs {
        let name = file_name(path);
        let outcome = crop_vehicles(ctx, detector, path, &name);
        match &outcome {
            Ok(found) => log.success(format!("Detected {} vehicle(s) in: {}", found.len(), name)),
            Err(ItemError::NoVehicles) => log.failure(format!("No vehicles detected in: {}", name)),
            Err(e) => log.failure(format!("Vehicle detection failed for: {} - {}", name, e)),
        }
        summary.record(&outcome);
        if let Ok(found) = outcome {
            records.extend(found);
        }
    }
    log.end_stage(VEHICLE_STAGE, &summary);

    write_json(&paths.yolo_detection_results_file(), &records)?;
    let crops = records.iter().map(|r| PathBuf::from(&r.cropped_image_path)).collect();
    Ok((summary, crops))
}

fn crop_vehicles(
    ctx: &RunContext,
    detector: &dyn VehicleDetector,
    path: &Path,
    name: &str,
) -> Result<Vec<VehicleCropRecord>, ItemError> {
    let paths = ctx.paths();
    let image = load_rgb(path)?;
    let detections = detector.detect(&image)?;
    if detections.is_empty() {
        return Err(ItemError::NoVehicles);
    }
    let stem = file_stem(name);
    let (width, height) = (image.width() as i32, image.height() as i32);

    let mut visual = image.clone();
    let mut records = Vec::new();
    for (index, detection) in detections.iter().enumerate() {
        let [x1, y1, x2, y2] = detection.bbox;
        let (x1, x2) = (x1.clamp(0, width), x2.clamp(0, width));
        let (y1, y2) = (y1.clamp(0, height), y2.clamp(0, height));
        if x2 <= x1 || y2 <= y1 {
            let skipped = ItemError::EmptyCrop { index };
            warn!("{}: {}", name, skipped);
            ctx.log().failure(format!("{} in: {}", skipped, name));
            continue;
        }

        let crop = image::imageops::crop_imm(&image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)
            .to_image();
        let crop_path = paths
            .yolo_cropped_vehicles_folder()
            .join(format!("{}_vehicle_crop_{}_{}.jpg", stem, index, detection.class_name));
        save_rgb(&crop, &crop_path)?;

        visualize::draw_boxes(&mut visual, &[BoundingBox::new(x1, x2, y1, y2)], visualize::GREEN, 2);
        records.push(VehicleCropRecord {
            original_image: name.to_string(),
            cropped_image_path: crop_path.to_string_lossy().into_owned(),
            bbox: [x1, y1, x2, y2],
            confidence: detection.confidence,
            class_name: detection.class_name.clone(),
        });
    }

    if !records.is_empty() {
        let visual_path = paths.yolo_detection_vis_folder().join(format!("{}_detected.jpg", stem));
        save_rgb(&visual, &visual_path)?;
    }
    Ok(records)
}

// -- Document boundary --------------------------------------------------------

/// Find the document quadrilateral in every input image and record its corners
pub fn run_edge_detection(ctx: &RunContext, finder: &QuadrilateralFinder, inputs: &[PathBuf]) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    info!("Running edge detection on {} images", inputs.len());

    let mut summary = StageSummary::new(EDGE_STAGE);
    let mut coordinates = CoordinateStore::new();
    let mut successes = Vec::new();
    let mut failures = Vec::new();

    for path in inputs {
        let name = file_name(path);
        let outcome = detect_boundary(paths, finder, path, &name);
        match &outcome {
            Ok(quad) => {
                coordinates.insert(name.clone(), quad.to_pairs());
                successes.push(format!("Detected edges for: {}", name));
            }
            Err(e) => {
                failures.push(format!("Failed to detect edges for: {} - {}", name, e));
                if let Err(copy_err) = copy_image(path, &paths.unsuccessful_folder().join(&name)) {
                    warn!("Could not keep failed image {}: {}", name, copy_err);
                }
            }
        }
        summary.record(&outcome);
    }

    log.begin_stage(EDGE_STAGE, "PROCESSING IMAGES FOR EDGE DETECTION");
    successes.iter().for_each(|entry| log.success(entry));
    failures.iter().for_each(|entry| log.failure(entry));
    log.end_stage(EDGE_STAGE, &summary);

    write_json(&paths.coordinates_file(), &coordinates)?;
    Ok(summary)
}

fn detect_boundary(
    paths: &PathsConfig,
    finder: &QuadrilateralFinder,
    path: &Path,
    name: &str,
) -> Result<Quadrilateral, ItemError> {
    let audit_path = paths.edge_output_folder().join(name);
    let quad = finder.detect_file(path, Some(&audit_path))?;

    copy_image(path, &paths.successful_folder().join(name))?;

    let mut markers = load_rgb(path)?;
    visualize::draw_corner_markers(&mut markers, &quad, visualize::label_font());
    save_rgb(&markers, &paths.visualization_folder().join(name))?;

    Ok(quad)
}

// -- Perspective ----------------------------------------------------------------

/// Rectify every image that has stored corners
pub fn run_perspective_correction(ctx: &RunContext, rectifier: &PerspectiveRectifier) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    let mut summary = StageSummary::new(PERSPECTIVE_STAGE);

    let Some(coordinates) = load_stage_input::<CoordinateStore>(ctx, PERSPECTIVE_STAGE, &paths.coordinates_file())
    else {
        return Ok(summary);
    };
    info!("Correcting perspective for {} images", coordinates.len());

    log.begin_stage(PERSPECTIVE_STAGE, "APPLYING PERSPECTIVE CORRECTION");
    for name in natural_keys(&coordinates) {
        let outcome = rectify_one(paths, rectifier, &name, &coordinates[&name]);
        match &outcome {
            Ok(out) => log.success(format!("Corrected perspective for: {} -> {}", name, file_name(out))),
            Err(e) if e.is_not_found() => log.missing(format!("Image not found: {}", name)),
            Err(e) => log.failure(format!("Perspective correction failed for: {} - {}", name, e)),
        }
        summary.record(&outcome);
    }
    log.end_stage(PERSPECTIVE_STAGE, &summary);

    Ok(summary)
}

fn rectify_one(
    paths: &PathsConfig,
    rectifier: &PerspectiveRectifier,
    name: &str,
    corners: &[[f64; 2]],
) -> Result<PathBuf, ItemError> {
    let quad = Quadrilateral::from_pairs(corners).ok_or_else(|| {
        ItemError::DegenerateQuadrilateral(format!("expected 4 corner points, got {}", corners.len()))
    })?;
    let source = find_image_in_directory(&paths.successful_folder(), name)
        .ok_or_else(|| ItemError::ImageNotFound(name.to_string()))?;

    let image = load_rgb(&source)?;
    let corrected = rectifier.rectify(&image, &quad)?;

    let output = paths
        .corrected_output_folder()
        .join(format!("corrected_{}.jpg", file_stem(name)));
    save_rgb(&corrected, &output)?;
    Ok(output)
}

// -- Remote text detection ------------------------------------------------------

/// Ask the detection service for coarse text boxes on every rectified image
pub fn run_text_detection(
    ctx: &RunContext,
    service: &dyn TextDetectionService,
    delay: Duration,
) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    let images = list_images(&paths.corrected_output_folder())?;
    info!("Detecting text in {} images", images.len());

    let mut summary = StageSummary::new(TEXT_DETECTION_STAGE);
    let mut results = DetectionResults::new();

    log.begin_stage(TEXT_DETECTION_STAGE, "PROCESSING IMAGES FOR TEXT DETECTION");
    for path in &images {
        let name = file_name(path);
        pause(delay);
        let outcome = service.detect_text(path);
        match &outcome {
            Ok(payload) => {
                log.success(format!("Detected text for: {}", name));
                results.insert(name, DetectionOutcome::Detected(payload.clone()));
            }
            Err(e) => {
                log.failure(format!("Detection failed for image: {} - {}", name, e));
                results.insert(name, DetectionOutcome::Failed { error: e.to_string() });
            }
        }
        summary.record(&outcome);
    }
    log.end_stage(TEXT_DETECTION_STAGE, &summary);

    write_json(&paths.detection_results_file(), &results)?;
    Ok(summary)
}

// -- Box refinement ---------------------------------------------------------------

/// Tighten the detector's boxes on each rectified image
pub fn run_post_processing(ctx: &RunContext, refiner: &BoundingBoxRefiner) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    let mut summary = StageSummary::new(REFINEMENT_STAGE);

    let Some(detections) =
        load_stage_input::<DetectionResults>(ctx, REFINEMENT_STAGE, &paths.detection_results_file())
    else {
        return Ok(summary);
    };

    let mut processed = ProcessedDetections::new();
    log.begin_stage(REFINEMENT_STAGE, "REFINING DETECTED TEXT BOXES");
    for name in natural_keys(&detections) {
        let coarse = detections[&name].horizontal_boxes();
        let outcome = refine_one(paths, refiner, &name, &coarse);
        match &outcome {
            Ok((boxes, false)) => log.success(format!("Refined {} boxes for: {}", boxes.len(), name)),
            Ok((boxes, true)) => log.success(format!(
                "Kept {} detector boxes for: {} (refinement degenerate)",
                boxes.len(),
                name
            )),
            Err(e) if e.is_not_found() => log.missing(format!("Image not found for refinement: {}", name)),
            Err(e) => log.failure(format!("Refinement failed for: {} - {}", name, e)),
        }
        summary.record(&outcome);

        let boxes = match outcome {
            Ok((boxes, _)) => boxes,
            // Without the image the coarse boxes are the best available
            Err(_) => coarse,
        };
        processed.insert(name, boxes);
    }
    log.end_stage(REFINEMENT_STAGE, &summary);

    write_json(&paths.processed_detection_file(), &processed)?;
    Ok(summary)
}

fn refine_one(
    paths: &PathsConfig,
    refiner: &BoundingBoxRefiner,
    name: &str,
    coarse: &[BoundingBox],
) -> Result<(Vec<BoundingBox>, bool), ItemError> {
    let source = find_image_in_directory(&paths.corrected_output_folder(), name)
        .ok_or_else(|| ItemError::ImageNotFound(name.to_string()))?;
    let mut image: RgbImage = load_rgb(&source)?;

    let refined = refiner.refine_set(&image, coarse);
    visualize::draw_boxes(&mut image, &refined.boxes, visualize::RED, 2);
    save_rgb(&image, &paths.detection_vis_folder().join(name))?;

    Ok((refined.boxes, refined.reverted))
}

// -- Remote text recognition --------------------------------------------------------

/// Send each image's refined boxes to the recognition service
pub fn run_text_recognition(
    ctx: &RunContext,
    service: &dyn TextRecognitionService,
    delay: Duration,
) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    let mut summary = StageSummary::new(RECOGNITION_STAGE);

    let Some(boxes_by_image) =
        load_stage_input::<ProcessedDetections>(ctx, RECOGNITION_STAGE, &paths.processed_detection_file())
    else {
        return Ok(summary);
    };

    let mut results = RecognitionResults::new();
    log.begin_stage(RECOGNITION_STAGE, "PROCESSING IMAGES FOR TEXT RECOGNITION");
    for name in natural_keys(&boxes_by_image) {
        let boxes = dedup_preserving_order(&boxes_by_image[&name]);
        let image_path = paths.corrected_output_folder().join(&name);
        if !image_path.is_file() {
            let missing: Result<(), ItemError> = Err(ItemError::ImageNotFound(name.clone()));
            log.missing(format!("Image not found for recognition: {}", name));
            summary.record(&missing);
            continue;
        }

        pause(delay);
        let outcome = service.recognize(&image_path, &boxes);
        match &outcome {
            Ok(texts) => {
                log.success(format!("Recognized text for: {}", name));
                results.insert(
                    name.clone(),
                    RecognitionOutcome::Recognized {
                        bboxes: boxes.clone(),
                        recognized_texts: texts.clone(),
                    },
                );
            }
            Err(e) => {
                log.failure(format!("Recognition failed for image: {} - {}", name, e));
                results.insert(name.clone(), RecognitionOutcome::Failed { error: e.to_string() });
            }
        }
        summary.record(&outcome);
    }
    log.end_stage(RECOGNITION_STAGE, &summary);

    write_json(&paths.recognition_results_file(), &results)?;
    Ok(summary)
}

// -- Local recognition ---------------------------------------------------------------

/// Run the local engine over every rectified image
pub fn run_local_ocr(ctx: &RunContext, engine: &dyn LocalRecognizer) -> Result<StageSummary> {
    let paths = ctx.paths();
    let log = ctx.log();
    let images = list_images(&paths.corrected_output_folder())?;
    info!("Running local OCR on {} images", images.len());

    let mut summary = StageSummary::new(LOCAL_OCR_STAGE);
    let mut results = LocalOcrResults::new();

    log.begin_stage(LOCAL_OCR_STAGE, "PROCESSING IMAGES FOR LOCAL OCR");
    for path in &images {
        let name = file_name(path);
        let outcome = read_local(paths, engine, path, &name);
        match &outcome {
            Ok(spans) => {
                log.success(format!("Local OCR processed: {}", name));
                results.insert(
                    name.clone(),
                    LocalOcrOutcome::Recognized {
                        easy_ocr_results: spans.clone(),
                    },
                );
            }
            Err(e) => {
                log.failure(format!("Local OCR failed for image: {} - {}", name, e));
                results.insert(name.clone(), LocalOcrOutcome::Failed { error: e.to_string() });
            }
        }
        summary.record(&outcome);
    }
    log.end_stage(LOCAL_OCR_STAGE, &summary);

    write_json(&paths.easy_ocr_results_file(), &results)?;
    Ok(summary)
}

fn read_local(
    paths: &PathsConfig,
    engine: &dyn LocalRecognizer,
    path: &Path,
    name: &str,
) -> Result<Vec<LocalOcrText>, ItemError> {
    let spans = engine.read_text(path)?;

    let mut visual = load_rgb(path)?;
    let mut texts = Vec::with_capacity(spans.len());
    for span in spans {
        visualize::draw_polygon(&mut visual, &span.polygon, visualize::GREEN, 2);
        texts.push(LocalOcrText {
            bbox: polygon_bounds(&span.polygon),
            raw_bbox: span.polygon.iter().map(|&(x, y)| [x, y]).collect(),
            text: span.text,
            confidence: span.confidence,
        });
    }
    save_rgb(&visual, &paths.easy_ocr_vis_folder().join(name))?;

    Ok(texts)
}

/// `[x_min, y_min, x_max, y_max]` of a polygon, truncated to whole pixels
fn polygon_bounds(polygon: &[(f32, f32)]) -> [i32; 4] {
    if polygon.is_empty() {
        return [0; 4];
    }
    let (mut x_min, mut y_min) = (f32::INFINITY, f32::INFINITY);
    let (mut x_max, mut y_max) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    for &(x, y) in polygon {
        x_min = x_min.min(x);
        y_min = y_min.min(y);
        x_max = x_max.max(x);
        y_max = y_max.max(y);
    }
    [x_min as i32, y_min as i32, x_max as i32, y_max as i32]
}

// -- Merge and correction -------------------------------------------------------------

/// Combine both recognition sources per image, without correction
fn merge_recognition_sources(ctx: &RunContext) -> Result<CombinedResults, StoreError> {
    let paths = ctx.paths();
    let mut combined = CombinedResults::new();

    match read_json::<RecognitionResults>(&paths.recognition_results_file()) {
        Ok(main) => {
            for (name, outcome) in main {
                combined.entry(name).or_default().main_recognition = Some(outcome);
            }
        }
        Err(StoreError::Missing(_)) => {}
        Err(e) => return Err(e),
    }

    match read_json::<LocalOcrResults>(&paths.easy_ocr_results_file()) {
        Ok(local) => {
            for (name, outcome) in local {
                combined.entry(name).or_default().easy_ocr_recognition = Some(outcome);
            }
        }
        Err(StoreError::Missing(_)) => {}
        Err(e) => return Err(e),
    }

    Ok(combined)
}

/// Merged recognition sources, or `None` after logging when a source file
/// cannot be read
pub fn load_combined_results(ctx: &RunContext, stage: &str) -> Option<CombinedResults> {
    match merge_recognition_sources(ctx) {
        Ok(combined) => Some(combined),
        Err(e) => {
            error!("{} skipped: {}", stage, e);
            ctx.log().stage_error(stage, e.to_string());
            None
        }
    }
}

/// Merge both recognition sources and apply fuzzy phrase correction
pub fn run_correction(ctx: &RunContext, corrector: &PhraseCorrector) -> Result<(StageSummary, CombinedResults)> {
    let log = ctx.log();
    let mut summary = StageSummary::new(CORRECTION_STAGE);

    let Some(mut combined) = load_combined_results(ctx, CORRECTION_STAGE) else {
        return Ok((summary, CombinedResults::new()));
    };

    log.begin_stage(CORRECTION_STAGE, "ENRICHING RECOGNITION RESULTS WITH N-GRAM MATCHES");
    for name in natural_keys(&combined) {
        let Some(record) = combined.get_mut(&name) else {
            continue;
        };
        let report = corrector.correct_record(record);
        if report.main_processed {
            log.success(format!("N-gram processed main recognition for: {}", name));
        }
        if report.local_processed {
            log.success(format!("N-gram processed local recognition for: {}", name));
        }
        if report.substitutions > 0 {
            info!("{}: {} phrase(s) corrected", name, report.substitutions);
        }
        summary.successful += 1;
    }
    log.end_stage(CORRECTION_STAGE, &summary);

    Ok((summary, combined))
}
