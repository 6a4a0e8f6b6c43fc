use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod fallback;
pub mod ollama;

pub use fallback::LocalResponder;
pub use ollama::OllamaClient;

/// Sampling options for one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            num_predict: 2000,
        }
    }
}

/// Chunks of generated text. Ends after exactly one terminal event: the
/// stream either finishes cleanly or yields a single error and then ends.
/// Dropping the stream cancels the request behind it.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub family: Option<String>,
}

/// Text-generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_text(&self, prompt: &str, options: GenerationOptions) -> Result<TextStream, ProviderError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    async fn select_model(&self, name: &str) -> Result<(), ProviderError>;

    fn selected_model(&self) -> Option<String>;

    async fn check_availability(&self) -> bool;

    /// Simple estimation: ~4 characters per token.
    fn estimate_tokens(&self, text: &str) -> u64 {
        (text.len() / 4) as u64
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("No model selected")]
    ModelNotSelected,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl ProviderError {
    /// Worth another attempt with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Network(_) | ProviderError::Stream(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProviderError::ServiceUnavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ProviderError::ServiceUnavailable(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}
