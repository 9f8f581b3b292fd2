pub mod context;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::channel::line::LineEvent;
use crate::channel::MessagingChannel;
use crate::config::{Config, ModelsConfig};
use crate::error::{ChannelError, MimiError, Result};
use crate::provider::{self, CompletionProvider};
use crate::store::{
    Database, ErrorSink, EulaStore, EulaVersion, HistoryStore, MealLogStore, NewChatTurn,
    NewConsent, NewMealLog, UserDirectory,
};
use crate::types::IntentCategory;
use crate::util::truncate_string;

use self::context::{
    build_messages, consent_request_text, FALLBACK_REPLY, IMAGE_RESEND_REPLY, IMAGE_RETRY_REPLY,
    MEAL_ADVICE_FALLBACK, UNSUPPORTED_REPLY,
};

/// Result of one text exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversation {
    /// The user has not agreed to this EULA version; nothing was generated
    /// or stored.
    ConsentRequired(EulaVersion),
    Replied {
        reply: String,
        category: IntentCategory,
    },
}

/// A consent submission from the LIFF page.
#[derive(Debug, Clone)]
pub struct ConsentSubmission {
    pub line_user_id: String,
    pub agreed: bool,
    pub accepted_at: Option<DateTime<Utc>>,
    pub channel: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsentOutcome {
    /// The user declined; nothing was written.
    Declined,
    NoVersionConfigured,
    Recorded {
        already_recorded: bool,
        version: EulaVersion,
    },
}

/// Handles inbound events: user resolution, the consent gate, context
/// assembly, generation, persistence and the reply.
pub struct ConversationAgent {
    users: UserDirectory,
    eula: EulaStore,
    history: HistoryStore,
    meals: MealLogStore,
    errors: ErrorSink,
    provider: Arc<dyn CompletionProvider>,
    channel: Arc<dyn MessagingChannel>,
    models: ModelsConfig,
    window_hours: i64,
}

impl ConversationAgent {
    pub fn new(
        db: &Database,
        provider: Arc<dyn CompletionProvider>,
        channel: Arc<dyn MessagingChannel>,
        config: &Config,
    ) -> Self {
        Self {
            users: db.users(),
            eula: db.eula(),
            history: db.history(),
            meals: db.meals(),
            errors: db.error_sink(),
            provider,
            channel,
            models: config.models.clone(),
            window_hours: config.history.window_hours,
        }
    }

    pub fn error_sink(&self) -> &ErrorSink {
        &self.errors
    }

    /// Resolve a LINE identity to its internal user id.
    pub async fn resolve_user(&self, line_user_id: &str) -> Result<i64> {
        Ok(self.users.resolve_or_create(line_user_id).await?)
    }

    /// One gated text exchange for `user_id`.
    ///
    /// On a reply, the user turn (with its category) and the bot turn are
    /// appended to history in that order.
    pub async fn converse(&self, user_id: i64, prompt: &str) -> Result<Conversation> {
        let status = self.eula.has_agreed_to_latest(user_id).await?;
        if let (false, Some(latest)) = (status.agreed, status.latest) {
            info!("User {} has not agreed to EULA {}", user_id, latest.version);
            return Ok(Conversation::ConsentRequired(latest));
        }

        let history = self.history.recent_turns(user_id, self.window_hours).await?;
        let messages = build_messages(&history, prompt);

        let result = provider::classify(self.provider.as_ref(), &self.models, messages).await?;
        if let Some(ref parse_error) = result.parse_error {
            self.errors
                .record(
                    "openai_chat_parse_error",
                    parse_error,
                    Some(json!({ "userId": user_id })),
                )
                .await;
        }

        self.history
            .append(&NewChatTurn::user(user_id, prompt, result.category))
            .await?;
        self.history
            .append(&NewChatTurn::bot(user_id, &result.reply))
            .await?;

        debug!("Replied to user {} ({})", user_id, result.category);
        Ok(Conversation::Replied {
            reply: result.reply,
            category: result.category,
        })
    }

    /// Process one webhook event. Never fails: errors are recorded and
    /// answered with a fallback reply.
    pub async fn handle_line_event(&self, event: &LineEvent) {
        if event.event_type != "message" {
            debug!("Ignoring LINE event type: {}", event.event_type);
            return;
        }

        let (Some(reply_token), Some(line_user_id)) = (event.reply_token(), event.user_id()) else {
            warn!("LINE message event without reply token or user id; skipping");
            return;
        };
        let Some(message) = event.message.as_ref() else {
            warn!("LINE message event without a message body; skipping");
            return;
        };

        let outcome = match message.msg_type.as_str() {
            "text" => {
                let text = message.text.as_deref().unwrap_or("");
                if text.is_empty() {
                    warn!("Empty LINE text message from {}; skipping", line_user_id);
                    return;
                }
                info!("{} text from {}: {}", self.channel.name(), line_user_id, truncate_string(text, 80, "..."));
                self.handle_text(reply_token, line_user_id, text).await
            }
            "image" => {
                let Some(message_id) = message.id.as_deref() else {
                    warn!("LINE image message from {} without an id; skipping", line_user_id);
                    return;
                };
                info!("{} image from {}", self.channel.name(), line_user_id);
                self.handle_image(reply_token, line_user_id, message_id).await
            }
            other => {
                debug!("Unsupported LINE message type {} from {}", other, line_user_id);
                self.channel
                    .reply(reply_token, UNSUPPORTED_REPLY)
                    .await
                    .map_err(MimiError::from)
            }
        };

        if let Err(e) = outcome {
            let payload = serde_json::to_value(event).ok().map(|event| json!({ "event": event }));
            self.errors
                .record_with_detail("line_webhook", &e, Some(format!("{:?}", e)), payload)
                .await;
            if let Err(send_err) = self.channel.reply(reply_token, FALLBACK_REPLY).await {
                warn!("Failed to send fallback reply: {}", send_err);
            }
        }
    }

    async fn handle_text(&self, reply_token: &str, line_user_id: &str, text: &str) -> Result<()> {
        let user_id = self.resolve_user(line_user_id).await?;
        let reply = match self.converse(user_id, text).await? {
            Conversation::ConsentRequired(latest) => consent_request_text(&latest.url),
            Conversation::Replied { reply, .. } => reply,
        };
        self.channel.reply(reply_token, &reply).await?;
        Ok(())
    }

    async fn handle_image(&self, reply_token: &str, line_user_id: &str, message_id: &str) -> Result<()> {
        let user_id = self.resolve_user(line_user_id).await?;

        let status = self.eula.has_agreed_to_latest(user_id).await?;
        if let (false, Some(latest)) = (status.agreed, status.latest) {
            self.channel
                .reply(reply_token, &consent_request_text(&latest.url))
                .await?;
            return Ok(());
        }

        let image = match self.channel.fetch_content(message_id).await {
            Ok(bytes) => bytes,
            Err(e @ ChannelError::Api { .. }) => {
                self.errors
                    .record(
                        "line_image_fetch",
                        &e,
                        Some(json!({ "messageId": message_id, "userId": user_id })),
                    )
                    .await;
                self.channel.reply(reply_token, IMAGE_RETRY_REPLY).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let analysis = match provider::analyze_meal(self.provider.as_ref(), &self.models, &image).await {
            Ok(analysis) => analysis,
            Err(e) => {
                self.errors
                    .record(
                        "openai_image_analysis",
                        &e,
                        Some(json!({ "messageId": message_id, "imageBytes": image.len() })),
                    )
                    .await;
                self.channel.reply(reply_token, IMAGE_RESEND_REPLY).await?;
                return Ok(());
            }
        };

        let meal = NewMealLog::from_analysis(user_id, &analysis, Utc::now())?;
        self.meals.insert(&meal).await?;

        let reply = analysis.advice.as_deref().unwrap_or(MEAL_ADVICE_FALLBACK);
        self.channel.reply(reply_token, reply).await?;
        Ok(())
    }

    /// Record (or decline) agreement to the latest EULA version.
    pub async fn submit_consent(&self, submission: &ConsentSubmission) -> Result<ConsentOutcome> {
        if !submission.agreed {
            info!("User {} declined the EULA", submission.line_user_id);
            return Ok(ConsentOutcome::Declined);
        }

        let user_id = self.resolve_user(&submission.line_user_id).await?;
        let Some(version) = self.eula.latest_version().await? else {
            warn!("Consent submitted but no EULA version is configured");
            return Ok(ConsentOutcome::NoVersionConfigured);
        };

        let already_recorded = self
            .eula
            .record_consent(&NewConsent {
                user_id,
                eula_version_id: version.id,
                accepted_at: submission.accepted_at,
                channel: submission.channel.clone(),
                ip_address: submission.ip_address.clone(),
                user_agent: submission.user_agent.clone(),
            })
            .await?;

        Ok(ConsentOutcome::Recorded {
            already_recorded,
            version,
        })
    }
}
