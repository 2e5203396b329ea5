use std::time::Duration;

use async_trait::async_trait;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;

use super::Recognizer;
use crate::config::AzureCredentials;
use crate::error::RecognizerError;
use crate::types::{BoundingBox, Image, RecognizedRegion};

const API_VERSION: &str = "2024-11-30";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Polls before giving up; 80 s of waiting plus one request stays inside the default job timeout.
const MAX_POLLS: u32 = 40;
/// Bound on one HTTP exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Azure Document Intelligence `prebuilt-read` backend.
///
/// Each HTTP exchange is blocking and runs on tokio's blocking pool; the waits between polls
/// are async. Dropping the `recognize` future (job timeout, batch cancel) therefore stops the
/// analysis after at most the request in flight. The blocking client is built per request
/// because it must not be created or dropped on an async worker thread.
#[derive(Debug, Clone)]
pub struct AzureReadRecognizer {
    credentials: AzureCredentials,
}

/// Where a submitted analysis stands after one poll.
#[derive(Debug, PartialEq)]
enum PollState {
    Running,
    Done(Vec<RecognizedRegion>),
}

impl AzureReadRecognizer {
    pub fn new(credentials: AzureCredentials) -> Self {
        Self { credentials }
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/prebuilt-read:analyze?api-version={}",
            self.credentials.endpoint.trim_end_matches('/'),
            API_VERSION
        )
    }

    /// POST the image and return the `Operation-Location` to poll.
    async fn submit(&self, bytes: Vec<u8>) -> Result<String, RecognizerError> {
        let url = self.analyze_url();
        let key = self.credentials.key.clone();
        blocking(move |client| {
            let response = client
                .post(url)
                .header("Ocp-Apim-Subscription-Key", key)
                .header("Content-Type", "application/octet-stream")
                .body(bytes)
                .send()
                .map_err(map_transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(map_status(status, body));
            }
            response
                .headers()
                .get("Operation-Location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    RecognizerError::Unavailable("No Operation-Location in response".to_string())
                })
        })
        .await
    }

    async fn poll(&self, result_url: &str) -> Result<PollState, RecognizerError> {
        let url = result_url.to_string();
        let key = self.credentials.key.clone();
        let poll_json: Value = blocking(move |client| {
            client
                .get(url)
                .header("Ocp-Apim-Subscription-Key", key)
                .send()
                .map_err(map_transport_error)?
                .json()
                .map_err(|e| RecognizerError::Unavailable(format!("Invalid JSON: {}", e)))
        })
        .await?;
        read_poll(&poll_json)
    }
}

/// Run one blocking HTTP exchange on the blocking pool with a fresh client.
async fn blocking<T, F>(f: F) -> Result<T, RecognizerError>
where
    T: Send + 'static,
    F: FnOnce(&Client) -> Result<T, RecognizerError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RecognizerError::Unavailable(e.to_string()))?;
        f(&client)
    })
    .await
    .map_err(|e| RecognizerError::Unavailable(format!("Task join error: {}", e)))?
}

fn read_poll(poll_json: &Value) -> Result<PollState, RecognizerError> {
    match poll_json.get("status").and_then(|s| s.as_str()).unwrap_or("") {
        "succeeded" => {
            let result = poll_json
                .get("analyzeResult")
                .ok_or_else(|| RecognizerError::Unavailable("No analyzeResult".to_string()))?;
            Ok(PollState::Done(regions_from_read_result(result)))
        }
        "failed" => {
            let err = &poll_json["error"];
            let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("");
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error")
                .to_string();
            Err(if code.contains("Invalid") || code.contains("Unsupported") {
                RecognizerError::InvalidImage(message)
            } else {
                RecognizerError::Unavailable(message)
            })
        }
        _ => Ok(PollState::Running),
    }
}

#[async_trait]
impl Recognizer for AzureReadRecognizer {
    async fn recognize(&self, image: &Image) -> Result<Vec<RecognizedRegion>, RecognizerError> {
        let result_url = self.submit(image.bytes.to_vec()).await?;
        for _ in 0..MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let PollState::Done(regions) = self.poll(&result_url).await? {
                return Ok(regions);
            }
        }
        Err(RecognizerError::Timeout(format!(
            "analysis still running after {} polls",
            MAX_POLLS
        )))
    }

    fn name(&self) -> &str {
        "azure-read"
    }
}

fn map_transport_error(e: reqwest::Error) -> RecognizerError {
    if e.is_timeout() {
        RecognizerError::Timeout(e.to_string())
    } else if e.is_connect() {
        RecognizerError::Unavailable("Check your internet connection and try again.".to_string())
    } else {
        RecognizerError::Unavailable(format!("Network error: {}", e))
    }
}

fn map_status(status: StatusCode, body: String) -> RecognizerError {
    let detail = format!(
        "OCR failed ({}): {}",
        status,
        if body.is_empty() {
            "Invalid key or endpoint?"
        } else {
            body.as_str()
        }
    );
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::PAYLOAD_TOO_LARGE => {
            RecognizerError::InvalidImage(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RecognizerError::Timeout(detail),
        _ => RecognizerError::Unavailable(detail),
    }
}

/// Turn a `prebuilt-read` analyzeResult into line regions.
///
/// Lines carry no confidence of their own in current API versions, so the mean confidence of
/// the words whose span falls inside the line is used instead.
pub(crate) fn regions_from_read_result(result: &Value) -> Vec<RecognizedRegion> {
    let empty: Vec<Value> = vec![];
    let pages = result.get("pages").and_then(|p| p.as_array()).unwrap_or(&empty);
    let mut regions = Vec::new();
    for page in pages {
        let words: Vec<(u64, f64)> = page
            .get("words")
            .and_then(|w| w.as_array())
            .unwrap_or(&empty)
            .iter()
            .filter_map(|w| {
                let offset = w.get("span")?.get("offset")?.as_u64()?;
                let confidence = w.get("confidence")?.as_f64()?;
                Some((offset, confidence))
            })
            .collect();

        for line in page.get("lines").and_then(|l| l.as_array()).unwrap_or(&empty) {
            let text = line
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if text.is_empty() {
                continue;
            }
            let bounds = line
                .get("polygon")
                .and_then(|p| p.as_array())
                .map(|coords| {
                    coords
                        .chunks(2)
                        .filter_map(|pair| Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?)))
                        .collect::<Vec<_>>()
                })
                .and_then(|points| BoundingBox::from_points(&points));
            let confidence = line
                .get("confidence")
                .and_then(|c| c.as_f64())
                .or_else(|| line_word_confidence(line, &words));
            regions.push(RecognizedRegion {
                text,
                bounds,
                confidence,
            });
        }
    }
    regions
}

fn line_word_confidence(line: &Value, words: &[(u64, f64)]) -> Option<f64> {
    let spans: Vec<(u64, u64)> = line
        .get("spans")?
        .as_array()?
        .iter()
        .filter_map(|s| Some((s.get("offset")?.as_u64()?, s.get("length")?.as_u64()?)))
        .collect();
    let scores: Vec<f64> = words
        .iter()
        .filter(|(offset, _)| {
            spans
                .iter()
                .any(|(start, len)| *offset >= *start && *offset < start + len)
        })
        .map(|(_, c)| *c)
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}
