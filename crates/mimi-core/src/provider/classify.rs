//! Reply generation with intent classification.
//!
//! The model is asked for `{"category": ..., "reply": ...}`. Whatever it
//! actually returns, the caller gets a non-empty reply and one of the four
//! categories; only transport and configuration failures are errors.

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ModelsConfig;
use crate::error::ProviderError;
use crate::types::{CompletionRequest, IntentCategory, Message};

use super::CompletionProvider;

/// Used when the model's output was not JSON at all.
pub const BUSY_REPLY: &str = "小咪這邊有點忙碌，等等再和你聊聊好嗎？";

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub reply: String,
    pub category: IntentCategory,
    /// Set when the raw output could not be parsed and the busy reply was
    /// substituted.
    pub parse_error: Option<String>,
}

/// Interpret raw model output.
pub fn parse_classification(raw: &str) -> Classification {
    let parsed = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Null) => Err("model returned JSON null".to_string()),
        Ok(v) => Ok(v),
        Err(e) => Err(e.to_string()),
    };

    let parsed = match parsed {
        Ok(v) => v,
        Err(e) => {
            warn!("Model output is not JSON ({}); using fallback reply", e);
            return Classification {
                reply: BUSY_REPLY.to_string(),
                category: IntentCategory::General,
                parse_error: Some(e),
            };
        }
    };

    let category = parsed
        .get("category")
        .and_then(|c| c.as_str())
        .and_then(IntentCategory::parse)
        .unwrap_or_default();

    // Raw output that parsed as JSON is never blank.
    let reply = match parsed.get("reply").and_then(|r| r.as_str()) {
        Some(r) if !r.trim().is_empty() => r.to_string(),
        _ => {
            debug!("Model JSON had no usable reply; replying with raw output");
            raw.to_string()
        }
    };

    Classification {
        reply,
        category,
        parse_error: None,
    }
}

/// Generate a reply for `messages` and classify the user's intent.
pub async fn classify(
    provider: &dyn CompletionProvider,
    models: &ModelsConfig,
    messages: Vec<Message>,
) -> Result<Classification, ProviderError> {
    let request = CompletionRequest {
        messages,
        model: models.chat_model.clone(),
        max_tokens: models.max_tokens,
        temperature: Some(models.temperature),
        json_mode: true,
    };

    let response = provider.complete(&request).await?;
    debug!(
        "Classification used {} tokens",
        response.usage.total_tokens
    );
    Ok(parse_classification(&response.content))
}
