//! Runtime settings, loaded from the environment (and an optional `.env` file).

use std::time::Duration;

use crate::error::Error;

pub const DEFAULT_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 16;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
/// Pixel distance between x-centres that starts a new column when clustering.
pub const DEFAULT_COLUMN_GAP: f64 = 50.0;

/// Azure Document Intelligence credentials.
#[derive(Clone)]
pub struct AzureCredentials {
    pub key: String,
    pub endpoint: String,
}

impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("endpoint", &self.endpoint)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Concurrent image jobs.
    pub workers: usize,
    /// Retries for transient recognizer failures.
    pub max_retries: u32,
    /// Base delay, doubled on each retry.
    pub retry_backoff: Duration,
    /// Upper bound on a single recognizer call.
    pub job_timeout: Duration,
    /// Rows below this confidence are flagged for review.
    pub confidence_threshold: f64,
    pub column_gap: f64,
    /// Confidence assumed when the recognizer reports none.
    pub unscored_confidence: f64,
    pub azure: Option<AzureCredentials>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(500),
            job_timeout: Duration::from_secs(120),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            column_gap: DEFAULT_COLUMN_GAP,
            unscored_confidence: 0.5,
            azure: None,
        }
    }
}

impl Settings {
    /// Load `.env` (if present) and read settings from process environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::default();

        if let Some(v) = get("HWS_WORKERS") {
            settings.workers = parse(&v, "HWS_WORKERS")?;
        }
        if let Some(v) = get("HWS_MAX_RETRIES") {
            settings.max_retries = parse(&v, "HWS_MAX_RETRIES")?;
        }
        if let Some(v) = get("HWS_RETRY_BACKOFF_MS") {
            settings.retry_backoff = Duration::from_millis(parse(&v, "HWS_RETRY_BACKOFF_MS")?);
        }
        if let Some(v) = get("HWS_JOB_TIMEOUT_SECS") {
            settings.job_timeout = Duration::from_secs(parse(&v, "HWS_JOB_TIMEOUT_SECS")?);
        }
        if let Some(v) = get("HWS_CONFIDENCE_THRESHOLD") {
            settings.confidence_threshold = parse(&v, "HWS_CONFIDENCE_THRESHOLD")?;
        }
        if let Some(v) = get("HWS_COLUMN_GAP") {
            settings.column_gap = parse(&v, "HWS_COLUMN_GAP")?;
        }
        if let Some(v) = get("HWS_UNSCORED_CONFIDENCE") {
            settings.unscored_confidence = parse(&v, "HWS_UNSCORED_CONFIDENCE")?;
        }
        if let (Some(key), Some(endpoint)) = (get("AZURE_OCR_KEY"), get("AZURE_OCR_ENDPOINT")) {
            settings.azure = Some(AzureCredentials { key, endpoint });
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(Error::Config(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence threshold must be within 0..=1, got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.unscored_confidence) {
            return Err(Error::Config(format!(
                "unscored confidence must be within 0..=1, got {}",
                self.unscored_confidence
            )));
        }
        if !(self.column_gap.is_finite() && self.column_gap > 0.0) {
            return Err(Error::Config(format!(
                "column gap must be a positive number of pixels, got {}",
                self.column_gap
            )));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::Config("job timeout must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, value)))
}
