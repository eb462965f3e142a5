// Subscriber WebSocket endpoint.
//
// `GET /ws?token=<tenant key>&secret=<secret>`. Authentication happens
// before the upgrade so a rejected subscriber never touches its tenant's
// session. After the upgrade the socket task only moves frames: the
// supervisor decides what to send and when to ping, the socket reports
// every inbound frame as proof of life.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tapcast_common::tenant::TenantKey;
use tracing::{info, warn};

use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::hub::{Outbound, Subscriber};
use crate::registry::SessionRegistry;
use crate::upstream::UpstreamSource;
use crate::AppState;

/// Subscribers only send control frames; anything larger is abuse.
const MAX_FRAME_BYTES: usize = 16 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

pub fn router<S: UpstreamSource>(state: AppState<S>) -> Router {
    Router::new().route("/ws", get(ws_upgrade::<S>)).with_state(state)
}

pub async fn ws_upgrade<S: UpstreamSource>(
    State(state): State<AppState<S>>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let key = TenantKey::new(query.token.unwrap_or_default());
    let secret = query.secret.unwrap_or_default();

    if key.is_empty() {
        return RelayError::new(ErrorCode::AuthInvalidToken, "missing tenant token").into_response();
    }
    if let Err(error) = state.registry.authenticate_subscriber_upgrade(&key, &secret).await {
        warn!(tenant = %key.redacted(), error = %error, "subscriber upgrade rejected");
        return RelayError::from_code(ErrorCode::AuthInvalidToken).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = Arc::clone(&state.registry);
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(registry, key, socket)).await;
    })
}

async fn handle_socket<S: UpstreamSource>(
    registry: Arc<SessionRegistry<S>>,
    key: TenantKey,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (subscriber, mut outbound) = Subscriber::new(key.clone());
    let subscriber_id = subscriber.id();
    let liveness = subscriber.liveness();

    if let Err(error) = registry.attach_subscriber(subscriber).await {
        warn!(tenant = %key.redacted(), request_id = %request_id, error = %error, "subscriber attach failed");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "session unavailable".into(),
            })))
            .await;
        return;
    }
    info!(tenant = %key.redacted(), subscriber = %subscriber_id, request_id = %request_id, "subscriber connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let sent = match frame {
                    Some(Outbound::Event(payload)) => {
                        socket.send(Message::Text(payload.to_string().into())).await
                    }
                    Some(Outbound::Ping) => socket.send(Message::Ping(vec![].into())).await,
                    Some(Outbound::Close { reason }) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::AWAY,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    // Dropped by the hub (dead or evicted).
                    None => break,
                };
                if sent.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => liveness.acknowledge(),
                }
            }
        }
    }

    registry.detach_subscriber(&key, subscriber_id).await;
    info!(tenant = %key.redacted(), subscriber = %subscriber_id, request_id = %request_id, "subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::router;
    use crate::config::TenantConfig;
    use crate::profile::ProfileCache;
    use crate::registry::SessionRegistry;
    use crate::supervisor::SupervisorSettings;
    use crate::upstream::{TransportOptions, UpstreamError, UpstreamSession, UpstreamSource};
    use crate::AppState;

    struct RefusingSource;

    impl UpstreamSource for RefusingSource {
        async fn connect(
            &self,
            _identity: &str,
            _transport: &TransportOptions,
        ) -> Result<UpstreamSession, UpstreamError> {
            Err(UpstreamError::Transport("offline".into()))
        }
    }

    async fn state() -> AppState<RefusingSource> {
        let registry = SessionRegistry::new(
            Arc::new(RefusingSource),
            SupervisorSettings::default(),
            Arc::new(ProfileCache::default()),
            "global-subscriber-secret",
        );
        registry.register_tenant(TenantConfig::new("abc", "streamer")).await.expect("register");
        AppState::new(Arc::new(registry), "admin-secret")
    }

    async fn status_for(uri: &str) -> (StatusCode, Value) {
        let response = router(state().await)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let (status, body) = status_for("/ws").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized_before_upgrade() {
        let (status, _) = status_for("/ws?token=abc&secret=nope").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_tenant_is_unauthorized() {
        let (status, _) = status_for("/ws?token=ghost&secret=global-subscriber-secret").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_secret_without_upgrade_headers_is_rejected_by_upgrade() {
        let (status, _) = status_for("/ws?token=abc&secret=global-subscriber-secret").await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert!(status.is_client_error());
    }
}
