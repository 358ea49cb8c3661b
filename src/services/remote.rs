//! HTTP client for the remote text detection and recognition services
//!
//! Both endpoints take a GET request with a JSON body holding the image as a
//! base64 JPEG data URL. Calls are blocking; the async client runs on a
//! private runtime.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use serde_json::{json, Value};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{dedup_preserving_order, TextDetectionService, TextRecognitionService};
use crate::config::ServicesConfig;
use crate::error::ItemError;
use crate::storage::records::RecognizedText;
use crate::vision::{load_rgb, BoundingBox};

/// Blocking client for both remote OCR endpoints
pub struct RemoteOcrClient {
    runtime: Runtime,
    client: reqwest::Client,
    detection_url: String,
    recognition_url: String,
    api_key: String,
}

impl RemoteOcrClient {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        let runtime = Runtime::new().context("Failed to create tokio runtime")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            runtime,
            client,
            detection_url: config.detection_api_url.clone(),
            recognition_url: config.recognition_api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn has_detection(&self) -> bool {
        !self.detection_url.is_empty()
    }

    pub fn has_recognition(&self) -> bool {
        !self.recognition_url.is_empty()
    }

    fn call(&self, url: &str, payload: &Value) -> Result<Value, ItemError> {
        if url.is_empty() {
            return Err(ItemError::RemoteCall("endpoint not configured".to_string()));
        }

        debug!("Calling remote OCR endpoint {}", url);
        self.runtime.block_on(async {
            let response = self
                .client
                .get(url)
                .header("X-API-KEY", &self.api_key)
                .json(payload)
                .send()
                .await
                .map_err(|e| ItemError::RemoteCall(e.to_string()))?;

            let response = response
                .error_for_status()
                .map_err(|e| ItemError::RemoteCall(e.to_string()))?;

            response
                .json::<Value>()
                .await
                .map_err(|e| ItemError::RemoteCall(format!("invalid response body: {}", e)))
        })
    }
}

impl TextDetectionService for RemoteOcrClient {
    fn detect_text(&self, image_path: &Path) -> Result<Value, ItemError> {
        let payload = json!({ "img": encode_image_data_url(image_path)? });
        self.call(&self.detection_url, &payload)
    }
}

impl TextRecognitionService for RemoteOcrClient {
    fn recognize(&self, image_path: &Path, boxes: &[BoundingBox]) -> Result<Vec<Vec<RecognizedText>>, ItemError> {
        let payload = recognition_payload(encode_image_data_url(image_path)?, boxes);
        let response = self.call(&self.recognition_url, &payload)?;
        parse_recognition_response(response)
    }
}

/// Re-encode an image as JPEG and wrap it in a data URL
pub fn encode_image_data_url(path: &Path) -> Result<String, ItemError> {
    let image = load_rgb(path)?;
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(buffer.into_inner())))
}

/// Request body for recognition. Boxes go out as `[x_min, y_min, x_max, y_max]`.
fn recognition_payload(image: String, boxes: &[BoundingBox]) -> Value {
    let bboxes: Vec<[i32; 4]> = dedup_preserving_order(boxes)
        .iter()
        .map(BoundingBox::to_corner_array)
        .collect();
    json!({ "img": image, "bboxes": bboxes })
}

/// Normalize a recognition response into groups of text items.
///
/// Each top-level entry is either a list of items or a single item; repeated
/// groups are dropped.
pub fn parse_recognition_response(response: Value) -> Result<Vec<Vec<RecognizedText>>, ItemError> {
    let Value::Array(entries) = response else {
        return Err(ItemError::RemoteCall("recognition response is not a list".to_string()));
    };

    let mut groups = Vec::with_capacity(entries.len());
    for entry in entries {
        let group = match entry {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value::<RecognizedText>)
                .collect::<Result<Vec<_>, _>>(),
            item @ Value::Object(_) => serde_json::from_value::<RecognizedText>(item).map(|t| vec![t]),
            other => {
                return Err(ItemError::RemoteCall(format!(
                    "unexpected recognition entry: {}",
                    other
                )));
            }
        }
        .map_err(|e| ItemError::RemoteCall(format!("malformed recognition item: {}", e)))?;
        groups.push(group);
    }

    Ok(dedup_preserving_order(&groups))
}
