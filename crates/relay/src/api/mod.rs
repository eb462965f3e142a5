// Operator HTTP API.
//
// Every route here requires the operator secret in `x-admin-secret`.
// Handlers are thin: they validate input, call the registry and map
// `RegistryError` onto the JSON error envelope.

use axum::{
    extract::{Json, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tapcast_common::protocol::{EventBody, Participant};
use tapcast_common::tenant::TenantKey;
use tracing::info;

use crate::config::TenantConfig;
use crate::error::{ErrorCode, RelayError};
use crate::hub::auth::secrets_match;
use crate::profile::{ProfileCache, DEFAULT_AVATAR_URL};
use crate::registry::TenantStatus;
use crate::upstream::UpstreamSource;
use crate::AppState;

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

pub fn router<S: UpstreamSource>(state: AppState<S>) -> Router {
    let admin_layer = middleware::from_fn_with_state(state.clone(), require_admin_secret::<S>);

    Router::new()
        .route("/status", get(status::<S>))
        .route("/v1/tenants", post(register_tenant::<S>))
        .route("/v1/tenants/{key}", delete(deactivate_tenant::<S>))
        .route("/v1/tenants/{key}/reactivate", post(reactivate_tenant::<S>))
        .route("/v1/tenants/{key}/events", post(inject_event::<S>))
        .route("/v1/tenants/{key}/test/{kind}", post(inject_test_event::<S>))
        .route("/webhook", post(webhook::<S>))
        .route_layer(admin_layer)
        .with_state(state)
}

async fn require_admin_secret<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !secrets_match(presented, &state.admin_secret) {
        return RelayError::new(ErrorCode::AuthInvalidToken, "missing or invalid admin secret")
            .into_response();
    }

    next.run(request).await
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
    cached_profiles: usize,
    tenants: Vec<TenantStatus>,
}

async fn status<S: UpstreamSource>(State(state): State<AppState<S>>) -> Json<StatusResponse> {
    let now = Utc::now();
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_secs: (now - state.started_at).num_seconds().max(0),
        cached_profiles: state.registry.profiles().len(),
        tenants: state.registry.status_snapshot().await,
    })
}

// ── Tenant lifecycle ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterTenantResponse {
    key: String,
    streamer: String,
    active: bool,
    created: bool,
}

async fn register_tenant<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Json(payload): Json<TenantConfig>,
) -> Result<(StatusCode, Json<RegisterTenantResponse>), RelayError> {
    let config = payload.normalized();
    let response = RegisterTenantResponse {
        key: config.key.redacted(),
        streamer: config.identity.clone(),
        active: config.active,
        created: false,
    };

    let created = state.registry.register_tenant(config).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(RegisterTenantResponse { created, ..response })))
}

async fn deactivate_tenant<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Path(key): Path<String>,
) -> Result<StatusCode, RelayError> {
    state.registry.deactivate_tenant(&TenantKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reactivate_tenant<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Path(key): Path<String>,
) -> Result<StatusCode, RelayError> {
    state.registry.reactivate_tenant(&TenantKey::new(key)).await?;
    Ok(StatusCode::ACCEPTED)
}

// ── Event injection ─────────────────────────────────────────────────

/// Event payload in the same shape subscribers receive.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectEventRequest {
    #[serde(rename = "type")]
    kind: String,
    user: Option<String>,
    nickname: Option<String>,
    pfp: Option<String>,
    likes: Option<u64>,
    gift_name: Option<String>,
    repeat_count: Option<u32>,
    repeat_end: Option<bool>,
    event: Option<String>,
    data: Option<Value>,
}

impl InjectEventRequest {
    fn into_parts(
        self,
        profiles: &ProfileCache,
    ) -> Result<(Option<Participant>, EventBody), RelayError> {
        let participant = self.user.filter(|user| !user.trim().is_empty()).map(|id| {
            let avatar_url = match self.pfp.filter(|pfp| !pfp.is_empty()) {
                Some(pfp) => pfp,
                None => profiles.resolve(&id, &Map::new()),
            };
            Participant {
                display_name: self.nickname.unwrap_or_else(|| id.clone()),
                id,
                avatar_url,
            }
        });

        let body = match self.kind.as_str() {
            "tap" => match self.likes.unwrap_or(1) {
                0 => return Err(invalid_event("tap events need likes of at least 1")),
                count => EventBody::Tap { count },
            },
            "follow" => EventBody::Follow,
            "gift" => EventBody::Gift {
                gift_name: self
                    .gift_name
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| invalid_event("gift events need a giftName"))?,
                repeat_count: self.repeat_count.unwrap_or(1),
                repeat_end: self.repeat_end.unwrap_or(true),
            },
            "join" => EventBody::Raw { event: "join".to_string(), data: json!({}) },
            "raw" => EventBody::Raw {
                event: self
                    .event
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| invalid_event("raw events need an event name"))?,
                data: self.data.unwrap_or(Value::Null),
            },
            other => return Err(invalid_event(&format!("unsupported event type `{other}`"))),
        };
        Ok((participant, body))
    }
}

fn invalid_event(message: &str) -> RelayError {
    RelayError::new(ErrorCode::ValidationFailed, message.to_string())
}

#[derive(Debug, Serialize)]
struct InjectResponse {
    delivered: bool,
}

async fn inject_event<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Path(key): Path<String>,
    Json(payload): Json<InjectEventRequest>,
) -> Result<(StatusCode, Json<InjectResponse>), RelayError> {
    let (participant, body) = payload.into_parts(state.registry.profiles())?;
    let delivered =
        state.registry.inject_external_event(&TenantKey::new(key), participant, body).await?;
    Ok((StatusCode::ACCEPTED, Json(InjectResponse { delivered })))
}

/// Synthetic overlay check: one event of `kind` from a fixed test viewer.
pub fn test_event(kind: &str) -> Option<InjectEventRequest> {
    let (user, nickname) = match kind {
        "tap" => ("AAA", "TapTester"),
        "follow" => ("BBB", "FollowTester"),
        "join" => ("CCC", "JoinTester"),
        "gift" => ("DDD", "GiftTester"),
        _ => return None,
    };
    Some(InjectEventRequest {
        kind: kind.to_string(),
        user: Some(user.to_string()),
        nickname: Some(nickname.to_string()),
        pfp: Some(DEFAULT_AVATAR_URL.to_string()),
        likes: Some(1),
        gift_name: (kind == "gift").then(|| "🎁 Test".to_string()),
        repeat_end: Some(true),
        ..Default::default()
    })
}

async fn inject_test_event<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Path((key, kind)): Path<(String, String)>,
) -> Result<(StatusCode, Json<InjectResponse>), RelayError> {
    let request = test_event(&kind).ok_or_else(|| {
        RelayError::new(ErrorCode::NotFound, format!("no test event named `{kind}`"))
    })?;
    let (participant, body) = request.into_parts(state.registry.profiles())?;
    let key = TenantKey::new(key);
    let delivered = state.registry.inject_external_event(&key, participant, body).await?;
    info!(tenant = %key.redacted(), kind = %kind, delivered, "test event injected");
    Ok((StatusCode::ACCEPTED, Json(InjectResponse { delivered })))
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    tenants: usize,
}

async fn webhook<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<WebhookResponse>) {
    let tenants = state.registry.broadcast_webhook(payload).await;
    info!(tenants, "webhook relayed");
    (StatusCode::ACCEPTED, Json(WebhookResponse { tenants }))
}
