// JSON polling client for the webcast API.
//
// Resolves the room id for a username, then polls the message endpoint at a
// fixed interval and translates each JSON message into an
// `UpstreamMessage`. Request signing and the binary push protocol are not
// handled here; deployments that need them put a signing gateway behind
// `TAPCAST_UPSTREAM_BASE_URL`.

use std::time::Duration;

use reqwest::{Client, Proxy, StatusCode};
use serde_json::{json, Map, Value};
use tapcast_common::protocol::EventBody;
use tracing::{debug, warn};
use url::Url;

use super::{
    TransportOptions, UpstreamError, UpstreamEvent, UpstreamFeed, UpstreamMessage,
    UpstreamSession, UpstreamSource,
};

pub const DEFAULT_BASE_URL: &str = "https://webcast.tiktok.com/webcast";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_BUFFER: usize = 512;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct WebcastConfig {
    pub base_url: Url,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl WebcastConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebcastSource {
    config: WebcastConfig,
}

impl WebcastSource {
    pub fn new(config: WebcastConfig) -> Self {
        Self { config }
    }

    /// Fresh client per attempt so a transport switch never reuses a
    /// pooled connection from the other path.
    fn client_for(&self, transport: &TransportOptions) -> Result<Client, UpstreamError> {
        let mut builder = Client::builder()
            .timeout(self.config.request_timeout)
            .user_agent(USER_AGENT);
        if let Some(proxy_url) = transport.effective_proxy() {
            let proxy = Proxy::all(proxy_url.clone())
                .map_err(|e| UpstreamError::Transport(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| UpstreamError::Transport(format!("failed to create HTTP client: {e}")))
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        let base = self.config.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| UpstreamError::Transport(format!("invalid endpoint: {e}")))
    }

    async fn resolve_room_id(&self, client: &Client, identity: &str) -> Result<String, UpstreamError> {
        let mut url = self.endpoint("roomid/")?;
        url.query_pairs_mut().append_pair("uniqueId", identity);

        let response = client.get(url).send().await.map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(UpstreamError::TenantNotFound(identity.to_string()));
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Transport(format!(
                "room lookup returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await.map_err(request_error)?;
        room_id_from_response(&body).ok_or_else(|| UpstreamError::TenantNotFound(identity.to_string()))
    }
}

impl UpstreamSource for WebcastSource {
    async fn connect(
        &self,
        identity: &str,
        transport: &TransportOptions,
    ) -> Result<UpstreamSession, UpstreamError> {
        let client = self.client_for(transport)?;
        let room_id = self.resolve_room_id(&client, identity).await?;
        let fetch_url = self.endpoint("im/fetch/")?;
        debug!(%room_id, mode = ?transport.mode, "webcast room resolved");

        let (session, feed) = UpstreamSession::channel(Some(room_id.clone()), EVENT_BUFFER);
        tokio::spawn(poll_loop(client, fetch_url, room_id, self.config.poll_interval, feed));
        Ok(session)
    }
}

async fn poll_loop(
    client: Client,
    fetch_url: Url,
    room_id: String,
    interval: Duration,
    mut feed: UpstreamFeed,
) {
    let mut cursor = "0".to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = feed.cancelled() => {
                debug!(%room_id, "webcast polling cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let mut url = fetch_url.clone();
        url.query_pairs_mut()
            .append_pair("room_id", &room_id)
            .append_pair("cursor", &cursor)
            .append_pair("version", "1.0")
            .append_pair("is_polling", "1");

        let batch = match fetch_batch(&client, url).await {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%room_id, error = %error, "webcast poll failed");
                let _ = feed.send(UpstreamEvent::Closed { reason: error.to_string() }).await;
                return;
            }
        };

        if let Some(next) = batch.cursor {
            cursor = next;
        }
        for message in batch.messages.iter().filter_map(translate_message) {
            if !feed.send(UpstreamEvent::Message(message)).await {
                return;
            }
        }
    }
}

struct FetchBatch {
    messages: Vec<Value>,
    cursor: Option<String>,
}

async fn fetch_batch(client: &Client, url: Url) -> Result<FetchBatch, UpstreamError> {
    let response = client.get(url).send().await.map_err(request_error)?;
    if !response.status().is_success() {
        return Err(UpstreamError::Disconnected(format!("poll returned {}", response.status())));
    }
    let body: Value = response.json().await.map_err(request_error)?;
    let data = body.get("data");
    let messages = data
        .and_then(|d| d.get("messages"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let cursor = data.and_then(|d| d.get("cursor")).and_then(string_or_number);
    Ok(FetchBatch { messages, cursor })
}

fn request_error(error: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(error.to_string())
}

/// `data.roomId` as a string; `None` when absent, null or zero.
pub fn room_id_from_response(body: &Value) -> Option<String> {
    body.get("data")
        .and_then(|data| data.get("roomId"))
        .and_then(string_or_number)
        .filter(|id| !id.is_empty() && id != "0")
}

fn string_or_number(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Translate one JSON message. Messages without a `type` are skipped.
pub fn translate_message(message: &Value) -> Option<UpstreamMessage> {
    let kind = message.get("type").and_then(Value::as_str)?;

    // Participant fields live either under `user` or at the top level.
    let user = message.get("user").and_then(Value::as_object).or_else(|| message.as_object())?;
    let participant_id = ["uniqueId", "userId", "user_id"]
        .iter()
        .find_map(|field| user.get(*field).and_then(string_or_number))
        .unwrap_or_default();
    let display_name = user
        .get("nickname")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| participant_id.clone());

    let body = match kind {
        "like" => EventBody::Tap { count: u64_field(message, &["likeCount", "count"]).unwrap_or(1) },
        "follow" => EventBody::Follow,
        "gift" => EventBody::Gift {
            gift_name: message
                .get("giftName")
                .and_then(Value::as_str)
                .or_else(|| message.pointer("/gift/name").and_then(Value::as_str))
                .unwrap_or("gift")
                .to_string(),
            repeat_count: u64_field(message, &["repeatCount"])
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(1),
            repeat_end: message.get("repeatEnd").and_then(Value::as_bool).unwrap_or(true),
        },
        "member" => EventBody::Raw { event: "join".to_string(), data: strip_type(message) },
        other => EventBody::Raw { event: other.to_string(), data: strip_type(message) },
    };

    Some(UpstreamMessage { body, participant_id, display_name, attributes: user.clone() })
}

fn u64_field(message: &Value, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|field| message.get(*field).and_then(Value::as_u64))
}

fn strip_type(message: &Value) -> Value {
    match message {
        Value::Object(map) => {
            let rest: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "type")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(rest)
        }
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn room_id_accepts_string_or_number() {
        assert_eq!(
            room_id_from_response(&json!({ "data": { "roomId": "7312" } })).as_deref(),
            Some("7312")
        );
        assert_eq!(
            room_id_from_response(&json!({ "data": { "roomId": 7312 } })).as_deref(),
            Some("7312")
        );
    }

    #[test]
    fn null_or_missing_room_id_is_none() {
        assert!(room_id_from_response(&json!({ "data": { "roomId": null } })).is_none());
        assert!(room_id_from_response(&json!({ "data": {} })).is_none());
        assert!(room_id_from_response(&json!({ "data": { "roomId": "0" } })).is_none());
    }

    #[test]
    fn like_becomes_tap_with_count() {
        let message = translate_message(&json!({
            "type": "like",
            "uniqueId": "viewer",
            "nickname": "Viewer",
            "likeCount": 15,
            "profilePictureUrl": "https://cdn/v.png",
        }))
        .expect("like should translate");

        assert_eq!(message.body, EventBody::Tap { count: 15 });
        assert_eq!(message.participant_id, "viewer");
        assert_eq!(message.display_name, "Viewer");
        assert!(message.attributes.contains_key("profilePictureUrl"));
    }

    #[test]
    fn nested_user_object_is_used_for_participant() {
        let message = translate_message(&json!({
            "type": "follow",
            "user": { "uniqueId": "fan", "avatarThumb": { "urlList": ["https://cdn/f.png"] } },
        }))
        .expect("follow should translate");

        assert_eq!(message.body, EventBody::Follow);
        assert_eq!(message.participant_id, "fan");
        assert_eq!(message.display_name, "fan");
        assert!(message.attributes.contains_key("avatarThumb"));
    }

    #[test]
    fn gift_defaults_to_completed_streak() {
        let message = translate_message(&json!({
            "type": "gift",
            "uniqueId": "g",
            "gift": { "name": "Rose" },
        }))
        .expect("gift should translate");

        assert_eq!(
            message.body,
            EventBody::Gift { gift_name: "Rose".into(), repeat_count: 1, repeat_end: true }
        );
    }

    #[test]
    fn member_and_unknown_types_become_raw() {
        let join = translate_message(&json!({ "type": "member", "uniqueId": "m" })).expect("member");
        let chat = translate_message(&json!({ "type": "chat", "uniqueId": "c", "comment": "hi" }))
            .expect("chat");

        assert!(matches!(join.body, EventBody::Raw { ref event, .. } if event == "join"));
        match chat.body {
            EventBody::Raw { event, data } => {
                assert_eq!(event, "chat");
                assert_eq!(data["comment"], "hi");
                assert!(data.get("type").is_none());
            }
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn untyped_message_is_skipped() {
        assert!(translate_message(&json!({ "uniqueId": "x" })).is_none());
    }

    #[test]
    fn endpoint_joins_base_without_double_slash() {
        let source = WebcastSource::new(WebcastConfig::new(
            Url::parse("https://example.test/webcast/").expect("valid url"),
        ));
        let url = source.endpoint("roomid/").expect("endpoint");
        assert_eq!(url.as_str(), "https://example.test/webcast/roomid/");
    }
}
