pub mod classify;
pub mod openai_compat;
pub mod vision;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse};

pub use classify::{classify, parse_classification, Classification};
pub use openai_compat::{normalize_content, parse_openai_response, OpenAiCompatProvider};
pub use vision::{analyze_meal, parse_meal_analysis, MealAnalysis};

/// Trait for completion services.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Send one chat completion request and return the first choice.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Create the provider described by `config`.
pub fn create_provider(config: &ProviderConfig) -> Arc<dyn CompletionProvider> {
    Arc::new(OpenAiCompatProvider::new(
        config.api_key.clone(),
        config.api_base.clone(),
    ))
}
