use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::frame::EncodedFrame;

pub const ANALYZE_FRAME_PATH: &str = "/analyze_frame";
const NO_READING_LABEL: &str = "None";

/// Errors that can occur while talking to the remote analyzer.
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    UnexpectedStatus { status: StatusCode, body: String },
    Decode(serde_json::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(err) => write!(f, "http error: {err}"),
            ApiError::UnexpectedStatus { status, body } => {
                write!(f, "unexpected status {status}: {body}")
            }
            ApiError::Decode(err) => write!(f, "malformed analyzer response: {err}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        ApiError::Http(value)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::Decode(value)
    }
}

/// Latest emotion label and confidence reported by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionReading {
    pub label: String,
    /// In `[0, 1]`; `0` means not applicable.
    pub confidence: f64,
}

impl EmotionReading {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label: label.into(),
            confidence,
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl Default for EmotionReading {
    fn default() -> Self {
        Self {
            label: NO_READING_LABEL.to_string(),
            confidence: 0.0,
        }
    }
}

/// Request body for `POST /analyze_frame`.
#[derive(Debug, Serialize)]
struct AnalyzeFrameRequest<'a> {
    image: &'a str,
}

/// Response body of `POST /analyze_frame`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeFrameResponse {
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl AnalyzeFrameResponse {
    /// A missing, null or empty label means "no update".
    pub fn into_reading(self) -> Option<EmotionReading> {
        let label = self.emotion.filter(|label| !label.is_empty())?;
        Some(EmotionReading::new(label, self.confidence.unwrap_or(0.0)))
    }
}

/// Something that turns an encoded frame into an emotion reading.
///
/// Failures resolve to `None`; implementations must not panic on bad input.
#[allow(async_fn_in_trait)]
pub trait Analyzer {
    async fn analyze(&self, frame: EncodedFrame) -> Option<EmotionReading>;
}

/// HTTP client for the remote emotion analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerClient {
    base_url: String,
    http: Client,
}

impl AnalyzerClient {
    /// Create a new client targeting the provided base URL. `timeout` bounds every request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Returns the base URL configured for this client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, ANALYZE_FRAME_PATH)
    }

    /// Sends one frame and decodes the reply. `Ok(None)` means the analyzer saw no emotion.
    pub async fn try_analyze(&self, frame: &EncodedFrame) -> Result<Option<EmotionReading>, ApiError> {
        let response = self
            .http
            .post(self.endpoint())
            .json(&AnalyzeFrameRequest {
                image: frame.as_str(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::UnexpectedStatus { status, body });
        }

        let body = response.bytes().await?;
        let payload: AnalyzeFrameResponse = serde_json::from_slice(&body)?;
        Ok(payload.into_reading())
    }
}

impl Analyzer for AnalyzerClient {
    async fn analyze(&self, frame: EncodedFrame) -> Option<EmotionReading> {
        match self.try_analyze(&frame).await {
            Ok(Some(reading)) => {
                debug!(
                    "Analyzer reported {} ({:.2}) for {}x{} frame",
                    reading.label,
                    reading.confidence,
                    frame.width(),
                    frame.height()
                );
                Some(reading)
            }
            Ok(None) => {
                debug!("Analyzer returned no emotion");
                None
            }
            Err(err) => {
                warn!("Error analyzing frame: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameExtractor, FrameSource};
    use crate::surface::ReadyState;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use image::RgbImage;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    struct Gray;

    impl FrameSource for Gray {
        fn ready_state(&self) -> ReadyState {
            ReadyState::HaveEnoughData
        }

        fn dimensions(&self) -> (u32, u32) {
            (16, 16)
        }

        fn draw(&self, target: &mut RgbImage) {
            target.fill(128);
        }
    }

    fn sample_frame() -> EncodedFrame {
        FrameExtractor::new().extract(&Gray).expect("frame")
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub analyzer");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve stub analyzer");
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> AnalyzerClient {
        AnalyzerClient::new(base_url, Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn reading_defaults_and_clamps() {
        let reading = EmotionReading::default();
        assert_eq!(reading.label, "None");
        assert_eq!(reading.confidence, 0.0);
        assert!(reading.is_default());

        assert_eq!(EmotionReading::new("happy", 1.7).confidence, 1.0);
        assert_eq!(EmotionReading::new("sad", -0.3).confidence, 0.0);
        assert_eq!(EmotionReading::new("sad", f64::NAN).confidence, 0.0);
    }

    #[test]
    fn response_without_label_is_no_update() {
        let parsed: AnalyzeFrameResponse =
            serde_json::from_value(json!({"emotion": null, "confidence": 0.0})).expect("parse");
        assert!(parsed.into_reading().is_none());

        let parsed: AnalyzeFrameResponse =
            serde_json::from_value(json!({"confidence": 0.4})).expect("parse");
        assert!(parsed.into_reading().is_none());

        let parsed: AnalyzeFrameResponse =
            serde_json::from_value(json!({"emotion": "", "confidence": 0.4})).expect("parse");
        assert!(parsed.into_reading().is_none());

        let parsed: AnalyzeFrameResponse =
            serde_json::from_value(json!({"emotion": "surprise", "emoji_path": "static/emojis/surprise.jpg"}))
                .expect("parse");
        assert_eq!(
            parsed.into_reading(),
            Some(EmotionReading::new("surprise", 0.0))
        );
    }

    #[test]
    fn whitespace_label_is_still_a_reading() {
        let parsed: AnalyzeFrameResponse =
            serde_json::from_value(json!({"emotion": "  ", "confidence": 0.3})).expect("parse");
        assert_eq!(parsed.into_reading(), Some(EmotionReading::new("  ", 0.3)));
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = client("http://127.0.0.1:5000/");
        assert_eq!(client.base_url(), "http://127.0.0.1:5000");
        assert_eq!(client.endpoint(), "http://127.0.0.1:5000/analyze_frame");
    }

    #[tokio::test]
    async fn posts_frame_as_json_and_decodes_reading() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let router = Router::new().route(
            "/analyze_frame",
            post(move |Json(body): Json<Value>| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder.lock().expect("lock").push(body);
                    Json(json!({"emotion": "happy", "confidence": 0.92}))
                }
            }),
        );
        let base = spawn_stub(router).await;

        let frame = sample_frame();
        let reading = client(&base).analyze(frame.clone()).await;
        assert_eq!(reading, Some(EmotionReading::new("happy", 0.92)));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["image"].as_str(), Some(frame.as_str()));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_and_no_reading() {
        let router = Router::new().route(
            "/analyze_frame",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(json!({"error": "No image file provided"})),
                )
            }),
        );
        let base = spawn_stub(router).await;
        let client = client(&base);

        match client.try_analyze(&sample_frame()).await {
            Err(ApiError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("No image file provided"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(client.analyze(sample_frame()).await, None);
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let router = Router::new().route("/analyze_frame", post(|| async { "not json" }));
        let base = spawn_stub(router).await;
        let client = client(&base);

        assert!(matches!(
            client.try_analyze(&sample_frame()).await,
            Err(ApiError::Decode(_))
        ));
        assert_eq!(client.analyze(sample_frame()).await, None);
    }

    #[tokio::test]
    async fn unreachable_analyzer_resolves_to_none() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = client(&format!("http://{addr}"));
        assert!(matches!(
            client.try_analyze(&sample_frame()).await,
            Err(ApiError::Http(_))
        ));
        assert_eq!(client.analyze(sample_frame()).await, None);
    }

    #[tokio::test]
    async fn slow_analyzer_is_bounded_by_timeout() {
        let router = Router::new().route(
            "/analyze_frame",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"emotion": "late"}))
            }),
        );
        let base = spawn_stub(router).await;
        let client = AnalyzerClient::new(&base, Duration::from_millis(100)).expect("client");

        match client.try_analyze(&sample_frame()).await {
            Err(ApiError::Http(err)) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
