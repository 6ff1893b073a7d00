// src/detection/remote.rs
//
// HTTP detector client. Frames are JPEG-encoded and sent base64 in a JSON
// body; the service answers with pixel-space detections. Any transport,
// status or decode failure is reported as DetectorUnavailable so the
// analyzer falls back exactly as it does on a timeout.

use super::{DetectionRequest, DetectorRole, HazardDetector, WireDetection};
use crate::error::{PipelineError, PipelineResult};
use crate::types::Detection2D;
use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    /// Path appended to `url`
    pub endpoint: String,
    /// Optional model hint forwarded to the service
    pub model: Option<String>,
    pub jpeg_quality: u8,
    /// Transport-level timeout; the analyzer's own budget still applies
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            endpoint: "/detect".to_string(),
            model: None,
            jpeg_quality: 80,
            request_timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self, field: &str) -> PipelineResult<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(PipelineError::invalid_config(
                format!("{}.url", field),
                format!("must be an http(s) URL, got '{}'", self.url),
            ));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(PipelineError::invalid_config(
                format!("{}.jpeg_quality", field),
                format!("must be within 1..=100, got {}", self.jpeg_quality),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(PipelineError::invalid_config(
                format!("{}.request_timeout_ms", field),
                "must be positive",
            ));
        }
        Ok(())
    }

    fn detect_url(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DetectRequestBody {
    /// Unique request ID for correlation
    pub request_id: String,
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub width: u32,
    pub height: u32,
    pub work_context: Option<String>,
    pub model: Option<String>,
    /// Base64-encoded JPEG
    pub image_base64: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectResponseBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub detections: Vec<WireDetection>,
}

// ============================================================================
// REMOTE DETECTOR
// ============================================================================

pub struct RemoteDetector {
    http_client: reqwest::Client,
    config: RemoteConfig,
    name: String,
}

impl RemoteDetector {
    pub fn new(config: RemoteConfig, role: DetectorRole) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "🌐 Remote {} detector → {}",
            role.as_str(),
            config.detect_url()
        );
        Ok(Self {
            http_client,
            config,
            name: format!("remote-{}", role.as_str()),
        })
    }

    pub fn build_body(&self, request: &DetectionRequest) -> PipelineResult<DetectRequestBody> {
        let jpeg = encode_rgb_to_jpeg(
            &request.data,
            request.width,
            request.height,
            self.config.jpeg_quality,
        )
        .ok_or_else(|| {
            PipelineError::unavailable(
                self.name.as_str(),
                format!(
                    "cannot encode {}x{} frame ({} bytes) as JPEG",
                    request.width,
                    request.height,
                    request.data.len()
                ),
            )
        })?;

        Ok(DetectRequestBody {
            request_id: uuid::Uuid::new_v4().to_string(),
            frame_id: request.frame_id,
            timestamp_ms: request.timestamp_ms,
            width: request.width,
            height: request.height,
            work_context: request.work_context.clone(),
            model: self.config.model.clone(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
        })
    }
}

#[async_trait::async_trait]
impl HazardDetector for RemoteDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, request: DetectionRequest) -> PipelineResult<Vec<Detection2D>> {
        let body = self.build_body(&request)?;
        let url = self.config.detect_url();
        debug!(
            "🌐 Sending frame {} ({}x{}) to {} as {}",
            request.frame_id, request.width, request.height, url, body.request_id
        );

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::unavailable(self.name.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            warn!("🌐 Detector service returned {}: {}", status, text);
            return Err(PipelineError::unavailable(
                self.name.as_str(),
                format!("HTTP {}", status),
            ));
        }

        let parsed: DetectResponseBody = response.json().await.map_err(|e| {
            PipelineError::unavailable(self.name.as_str(), format!("bad response body: {}", e))
        })?;

        debug!(
            "🌐 {} detections for frame {}",
            parsed.detections.len(),
            request.frame_id
        );
        Ok(parsed
            .detections
            .into_iter()
            .map(|d| d.into_detection(request.timestamp_ms))
            .collect())
    }
}

// ============================================================================
// JPEG ENCODING HELPER
// ============================================================================

/// Encode raw RGB bytes into a JPEG. Returns None on failure.
fn encode_rgb_to_jpeg(rgb_data: &[u8], width: u32, height: u32, quality: u8) -> Option<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};

    if width == 0 || height == 0 {
        return None;
    }
    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb_data.to_vec())?;

    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder).ok()?;

    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(data: Vec<u8>, width: u32, height: u32) -> DetectionRequest {
        DetectionRequest {
            frame_id: 3,
            timestamp_ms: 300.0,
            data: Arc::from(data),
            width,
            height,
            work_context: Some("roofing".to_string()),
        }
    }

    #[test]
    fn test_jpeg_roundtrip_header() {
        let jpeg = encode_rgb_to_jpeg(&vec![128u8; 8 * 8 * 3], 8, 8, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_jpeg_rejects_wrong_buffer_size() {
        assert!(encode_rgb_to_jpeg(&[0u8; 10], 8, 8, 80).is_none());
        assert!(encode_rgb_to_jpeg(&[], 0, 0, 80).is_none());
    }

    #[test]
    fn test_body_carries_frame_metadata() {
        let detector = RemoteDetector::new(RemoteConfig::default(), DetectorRole::Background).unwrap();
        let body = detector.build_body(&request(vec![0u8; 4 * 4 * 3], 4, 4)).unwrap();
        assert_eq!(body.frame_id, 3);
        assert_eq!(body.work_context.as_deref(), Some("roofing"));
        assert!(!body.image_base64.is_empty());
        assert_eq!(detector.name(), "remote-background");
    }

    #[test]
    fn test_unencodable_frame_is_unavailable() {
        let detector = RemoteDetector::new(RemoteConfig::default(), DetectorRole::Realtime).unwrap();
        let err = detector.build_body(&request(Vec::new(), 4, 4)).unwrap_err();
        assert!(err.is_detector_failure());
    }

    #[test]
    fn test_url_joining_and_validation() {
        let config = RemoteConfig {
            url: "http://host:9000/".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(config.detect_url(), "http://host:9000/detect");
        assert!(config.validate("detector.realtime").is_ok());

        let bad = RemoteConfig {
            url: "host:9000".to_string(),
            ..RemoteConfig::default()
        };
        assert!(bad.validate("detector.realtime").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_unavailable() {
        let config = RemoteConfig {
            url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 500,
            ..RemoteConfig::default()
        };
        let detector = RemoteDetector::new(config, DetectorRole::Realtime).unwrap();
        let result = detector.detect(request(vec![0u8; 4 * 4 * 3], 4, 4)).await;
        assert!(matches!(result, Err(PipelineError::DetectorUnavailable { .. })));
    }
}
