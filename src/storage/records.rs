//! Intermediate stage records
//!
//! JSON shapes exchanged between stages through the store, keyed by image
//! file name. Failure entries carry an `error` string in place of the payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::vision::BoundingBox;

/// Corner points per image, in contour order
pub type CoordinateStore = BTreeMap<String, Vec<[f64; 2]>>;

/// Refined text boxes per image, `[x_min, x_max, y_min, y_max]` each
pub type ProcessedDetections = BTreeMap<String, Vec<BoundingBox>>;

pub type DetectionResults = BTreeMap<String, DetectionOutcome>;
pub type RecognitionResults = BTreeMap<String, RecognitionOutcome>;
pub type LocalOcrResults = BTreeMap<String, LocalOcrOutcome>;
pub type CombinedResults = BTreeMap<String, CombinedRecord>;

/// One vehicle cropped out of an input photograph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleCropRecord {
    pub original_image: String,
    pub cropped_image_path: String,
    /// `[x1, y1, x2, y2]` in the source image
    pub bbox: [i32; 4],
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_name: String,
}

/// Text detection result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetectionOutcome {
    Failed { error: String },
    /// Raw payload as returned by the detection service
    Detected(Value),
}

impl DetectionOutcome {
    /// Coarse boxes from the first entry's `horizontal_list`.
    ///
    /// Coordinates may arrive as floats and are truncated. Malformed boxes
    /// are skipped.
    pub fn horizontal_boxes(&self) -> Vec<BoundingBox> {
        let DetectionOutcome::Detected(payload) = self else {
            return Vec::new();
        };

        let first = match payload {
            Value::Array(entries) => entries.first(),
            Value::Object(_) => Some(payload),
            _ => None,
        };
        let Some(list) = first
            .and_then(|entry| entry.get("horizontal_list"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        list.iter().filter_map(parse_box).collect()
    }
}

fn parse_box(value: &Value) -> Option<BoundingBox> {
    let coords = value.as_array()?;
    if coords.len() != 4 {
        return None;
    }
    let mut out = [0i32; 4];
    for (slot, v) in out.iter_mut().zip(coords) {
        *slot = v.as_f64()?.trunc() as i32;
    }
    Some(BoundingBox::from(out))
}

/// One recognized text item. Fields other than `text` are passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecognizedText {
    #[cfg(test)]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: Map::new(),
        }
    }
}

/// Text recognition result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecognitionOutcome {
    Failed {
        error: String,
    },
    Recognized {
        bboxes: Vec<BoundingBox>,
        recognized_texts: Vec<Vec<RecognizedText>>,
    },
}

/// A text span found by the local recognition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalOcrText {
    /// `[x_min, y_min, x_max, y_max]`
    pub bbox: [i32; 4],
    /// Polygon as reported by the engine
    pub raw_bbox: Vec<[f32; 2]>,
    pub text: String,
    pub confidence: f32,
}

/// Local recognition result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalOcrOutcome {
    Failed { error: String },
    Recognized { easy_ocr_results: Vec<LocalOcrText> },
}

/// Everything known about one image after the last stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_recognition: Option<RecognitionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub easy_ocr_recognition: Option<LocalOcrOutcome>,
}
