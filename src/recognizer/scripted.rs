use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::Recognizer;
use crate::error::RecognizerError;
use crate::types::{Image, RecognizedRegion};

/// What a scripted image returns on one call.
#[derive(Debug, Clone)]
pub enum Script {
    Regions(Vec<RecognizedRegion>),
    Fail(RecognizerError),
    /// Never completes; only a timeout or cancellation ends the call.
    Hang,
    /// Panics with the given message, like a backend with a bug.
    Panic(String),
}

#[derive(Debug)]
struct Entry {
    steps: Vec<Script>,
    delay: Duration,
    calls: usize,
}

/// Deterministic recognizer keyed by image name.
///
/// Each call consumes the next scripted step; the last step repeats. Images without a script
/// are reported as unreadable.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    entries: Mutex<HashMap<String, Entry>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, image_name: &str, script: Script) -> Self {
        self.on_sequence(image_name, vec![script])
    }

    pub fn on_sequence(self, image_name: &str, steps: Vec<Script>) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                image_name.to_string(),
                Entry {
                    steps,
                    delay: Duration::ZERO,
                    calls: 0,
                },
            );
        }
        self
    }

    /// Delay every call for `image_name` before answering.
    pub fn with_delay(self, image_name: &str, delay: Duration) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(image_name) {
                entry.delay = delay;
            }
        }
        self
    }

    /// Number of recognize calls made for an image so far.
    pub fn calls(&self, image_name: &str) -> usize {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(image_name).map(|entry| entry.calls))
            .unwrap_or(0)
    }

    /// Highest number of overlapping recognize calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, image_name: &str) -> Option<(Script, Duration)> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get_mut(image_name)?;
        let idx = entry.calls.min(entry.steps.len().saturating_sub(1));
        entry.calls += 1;
        entry.steps.get(idx).cloned().map(|s| (s, entry.delay))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn recognize(&self, image: &Image) -> Result<Vec<RecognizedRegion>, RecognizerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let Some((step, delay)) = self.next_step(&image.original_name) else {
            return Err(RecognizerError::InvalidImage(format!(
                "no script for {}",
                image.original_name
            )));
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match step {
            Script::Regions(regions) => Ok(regions),
            Script::Fail(e) => Err(e),
            Script::Hang => std::future::pending().await,
            Script::Panic(message) => panic!("{}", message),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
