use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::{ConsentOutcome, ConsentSubmission, Conversation, ConversationAgent};
use crate::agent::context::consent_request_text;
use crate::channel::line::LineChannel;
use crate::config::Config;
use crate::error::MimiError;
use crate::types::IntentCategory;

const CONSENT_PATH: &str = "/api/external/line/eula/consent";
const MAKE_CHAT_PATH: &str = "/api/external/make/chat";

/// Headers sent with every consent response, including the preflight.
const CONSENT_CORS_HEADERS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
];

/// Shared application state for the HTTP API.
pub struct AppState {
    pub config: Config,
    pub agent: Arc<ConversationAgent>,
    /// Webhook events still being processed after the 200 was sent.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(config: Config, agent: Arc<ConversationAgent>) -> Self {
        Self {
            config,
            agent,
            tasks: TaskTracker::new(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_body(error: impl Into<String>) -> Json<ErrorBody> {
    Json(ErrorBody {
        success: false,
        error: error.into(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsentRecorded {
    success: bool,
    agreed: bool,
    already_agreed: bool,
    eula_version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EulaRef {
    id: i64,
    version: String,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MakeConsentRequired {
    success: bool,
    need_eula_consent: bool,
    eula: EulaRef,
    reply_text: String,
    echo: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MakeChatReply {
    success: bool,
    reply_text: String,
    intent_category: IntentCategory,
    reply_id: String,
    source: String,
    echo: Value,
}

/// Create the axum Router with all API routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Root
        .route("/", get(handle_root))
        // Webhooks
        .route("/webhooks/line", post(handle_line_webhook))
        // LIFF consent page
        .route(CONSENT_PATH, post(handle_eula_consent).options(handle_consent_preflight))
        // Make.com
        .route(MAKE_CHAT_PATH, post(handle_make_chat))
        // Health
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET / — service banner
async fn handle_root() -> impl IntoResponse {
    Json(json!({
        "success": true,
        "message": format!("AI小咪後端運作正常（mimi v{}）", crate::VERSION),
    }))
}

/// POST /webhooks/line — LINE webhook
///
/// Acknowledges immediately; each event is processed on the task tracker.
async fn handle_line_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    info!("LINE webhook received: {} bytes", body.len());

    let secret = &state.config.line.channel_secret;
    if !secret.is_empty() {
        let signature = headers
            .get("x-line-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !LineChannel::verify_signature(secret, body.as_bytes(), signature) {
            warn!("LINE webhook signature mismatch");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let events = match LineChannel::parse_webhook_events(&body) {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to parse LINE webhook: {}", e);
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    for event in events {
        let agent = state.agent.clone();
        state.tasks.spawn(async move {
            agent.handle_line_event(&event).await;
        });
    }

    (StatusCode::OK, "OK").into_response()
}

/// OPTIONS /api/external/line/eula/consent — CORS preflight
async fn handle_consent_preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, CONSENT_CORS_HEADERS)
}

/// POST /api/external/line/eula/consent — record EULA agreement
async fn handle_eula_consent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // An unreadable body is treated like an empty one.
    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

    let Some(line_user_id) = body
        .get("lineUserId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            CONSENT_CORS_HEADERS,
            error_body("Missing lineUserId"),
        )
            .into_response();
    };

    let submission = ConsentSubmission {
        line_user_id: line_user_id.to_string(),
        agreed: is_truthy(body.get("agreed")),
        accepted_at: body
            .get("agreedAt")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp),
        channel: "liff".to_string(),
        ip_address: header_str(&headers, "cf-connecting-ip")
            .or_else(|| header_str(&headers, "x-forwarded-for")),
        user_agent: header_str(&headers, "user-agent"),
    };

    match state.agent.submit_consent(&submission).await {
        Ok(ConsentOutcome::Declined) => (
            CONSENT_CORS_HEADERS,
            Json(json!({
                "success": true,
                "agreed": false,
                "message": "User declined EULA.",
            })),
        )
            .into_response(),
        Ok(ConsentOutcome::NoVersionConfigured) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            CONSENT_CORS_HEADERS,
            error_body("No EULA version configured."),
        )
            .into_response(),
        Ok(ConsentOutcome::Recorded {
            already_recorded,
            version,
        }) => (
            CONSENT_CORS_HEADERS,
            Json(ConsentRecorded {
                success: true,
                agreed: true,
                already_agreed: already_recorded,
                eula_version: version.version,
            }),
        )
            .into_response(),
        Err(e) => {
            state
                .agent
                .error_sink()
                .record(
                    "eula_consent",
                    &e,
                    Some(json!({ "path": CONSENT_PATH, "method": "POST" })),
                )
                .await;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                CONSENT_CORS_HEADERS,
                error_body(e.to_string()),
            )
                .into_response()
        }
    }
}

/// POST /api/external/make/chat — server-to-server chat
async fn handle_make_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let expected = &state.config.make.api_key;
    let provided = header_str(&headers, "x-api-key");
    if expected.is_empty() || provided.as_deref() != Some(expected.as_str()) {
        warn!("Rejected Make.com request with missing or wrong x-api-key");
        return (StatusCode::FORBIDDEN, error_body("Unauthorized")).into_response();
    }

    let body: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, error_body(format!("Invalid JSON body: {}", e)))
                .into_response();
        }
    };

    let line_id = body.get("lineId").and_then(|v| v.as_str()).unwrap_or("");
    let user_prompt = body.get("userPrompt").and_then(|v| v.as_str()).unwrap_or("");
    if line_id.is_empty() || user_prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Missing required fields: lineId or userPrompt"),
        )
            .into_response();
    }
    let source = body
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("make")
        .to_string();
    let metadata = body
        .get("metadata")
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| json!({}));

    info!("Make.com chat for {} (source {})", line_id, source);

    match make_chat(&state.agent, line_id, user_prompt).await {
        Ok(Conversation::ConsentRequired(latest)) => Json(MakeConsentRequired {
            success: true,
            need_eula_consent: true,
            reply_text: consent_request_text(&latest.url),
            eula: EulaRef {
                id: latest.id,
                version: latest.version,
                url: latest.url,
            },
            echo: json!({
                "lineId": line_id,
                "userPrompt": user_prompt,
                "source": source,
                "metadata": metadata,
            }),
        })
        .into_response(),
        Ok(Conversation::Replied { reply, category }) => Json(MakeChatReply {
            success: true,
            reply_text: reply,
            intent_category: category,
            reply_id: uuid::Uuid::new_v4().to_string(),
            source,
            echo: json!({
                "lineId": line_id,
                "userPrompt": user_prompt,
                "metadata": metadata,
            }),
        })
        .into_response(),
        Err(e) => {
            state
                .agent
                .error_sink()
                .record(
                    "make_chat",
                    &e,
                    Some(json!({ "path": MAKE_CHAT_PATH, "method": "POST" })),
                )
                .await;
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response()
        }
    }
}

async fn make_chat(
    agent: &ConversationAgent,
    line_id: &str,
    user_prompt: &str,
) -> Result<Conversation, MimiError> {
    let user_id = agent.resolve_user(line_id).await?;
    agent.converse(user_id, user_prompt).await
}

/// GET /health — Health check
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// RFC 3339 timestamp; anything else is ignored.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// JavaScript-style truthiness for the `agreed` flag.
fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Start the HTTP server on the given address.
///
/// Stops on Ctrl-C, then waits for in-flight webhook events to finish.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let tasks = state.tasks.clone();
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.close();
    if !tasks.is_empty() {
        info!("Waiting for {} background event(s) to finish", tasks.len());
    }
    tasks.wait().await;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
