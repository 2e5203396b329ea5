//! Handwriting recognition capability.
//!
//! The pipeline only depends on the [`Recognizer`] trait; backends are plugged in by the caller.

mod azure;
mod scripted;

pub use azure::AzureReadRecognizer;
pub use scripted::{Script, ScriptedRecognizer};

use async_trait::async_trait;

use crate::error::RecognizerError;
use crate::types::{Image, RecognizedRegion};

#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Recognize all text regions on one image.
    async fn recognize(&self, image: &Image) -> Result<Vec<RecognizedRegion>, RecognizerError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
