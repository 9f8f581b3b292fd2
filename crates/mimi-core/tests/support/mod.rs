//! Shared fixtures: scripted completion provider, recording LINE channel and
//! an in-memory agent.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use mimi_core::agent::ConversationAgent;
use mimi_core::channel::line::LineEvent;
use mimi_core::channel::MessagingChannel;
use mimi_core::config::Config;
use mimi_core::error::{ChannelError, ProviderError};
use mimi_core::provider::CompletionProvider;
use mimi_core::store::Database;
use mimi_core::types::{CompletionRequest, CompletionResponse, TokenUsage};

/// Answers requests from a queue and remembers what it was asked.
#[derive(Default)]
pub struct FakeProvider {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(content.into()));
        self
    }

    pub fn fail(self, err: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(content)) => Ok(CompletionResponse {
                content,
                usage: TokenUsage::default(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(ProviderError::Parse("no scripted response".to_string())),
        }
    }
}

/// Records replies; serves one fixed content download.
#[derive(Default)]
pub struct FakeChannel {
    replies: Mutex<Vec<(String, String)>>,
    fetches: Mutex<Vec<String>>,
    /// `Ok(bytes)` or the HTTP status to fail with.
    content: Mutex<Option<Result<Vec<u8>, u16>>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(self, bytes: &[u8]) -> Self {
        *self.content.lock().unwrap() = Some(Ok(bytes.to_vec()));
        self
    }

    pub fn with_content_status(self, status: u16) -> Self {
        *self.content.lock().unwrap() = Some(Err(status));
        self
    }

    /// `(reply_token, text)` in send order.
    pub fn replies(&self) -> Vec<(String, String)> {
        self.replies.lock().unwrap().clone()
    }

    pub fn reply_texts(&self) -> Vec<String> {
        self.replies().into_iter().map(|(_, text)| text).collect()
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingChannel for FakeChannel {
    fn name(&self) -> &str {
        "fake"
    }

    async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ChannelError> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), text.to_string()));
        Ok(())
    }

    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>, ChannelError> {
        self.fetches.lock().unwrap().push(message_id.to_string());
        match self.content.lock().unwrap().clone() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(status)) => Err(ChannelError::Api {
                status,
                body: "not found".to_string(),
            }),
            None => Err(ChannelError::NotConfigured("test content")),
        }
    }
}

pub struct Harness {
    pub db: Database,
    pub config: Config,
    pub provider: Arc<FakeProvider>,
    pub channel: Arc<FakeChannel>,
    pub agent: Arc<ConversationAgent>,
}

pub async fn harness(provider: FakeProvider, channel: FakeChannel) -> Harness {
    harness_with_config(Config::default(), provider, channel).await
}

pub async fn harness_with_config(config: Config, provider: FakeProvider, channel: FakeChannel) -> Harness {
    let db = Database::in_memory().await.unwrap();
    let provider = Arc::new(provider);
    let channel = Arc::new(channel);
    let agent = Arc::new(ConversationAgent::new(
        &db,
        provider.clone() as Arc<dyn CompletionProvider>,
        channel.clone() as Arc<dyn MessagingChannel>,
        &config,
    ));
    Harness {
        db,
        config,
        provider,
        channel,
        agent,
    }
}

impl Harness {
    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.db.pool())
            .await
            .unwrap()
    }

    pub async fn error_sources(&self) -> Vec<String> {
        sqlx::query_scalar("SELECT source FROM error_logs ORDER BY id")
            .fetch_all(self.db.pool())
            .await
            .unwrap()
    }
}

pub fn text_event(line_user_id: &str, reply_token: &str, text: &str) -> LineEvent {
    message_event(line_user_id, reply_token, json!({ "id": "m-text", "type": "text", "text": text }))
}

pub fn image_event(line_user_id: &str, reply_token: &str, message_id: &str) -> LineEvent {
    message_event(line_user_id, reply_token, json!({ "id": message_id, "type": "image" }))
}

pub fn message_event(line_user_id: &str, reply_token: &str, message: serde_json::Value) -> LineEvent {
    serde_json::from_value(json!({
        "type": "message",
        "replyToken": reply_token,
        "source": { "type": "user", "userId": line_user_id },
        "message": message,
        "timestamp": 1700000000000u64,
    }))
    .unwrap()
}
