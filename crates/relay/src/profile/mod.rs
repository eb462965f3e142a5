// Participant avatar cache.
//
// Resolves a participant's display-picture URL, preferring a cached value,
// then the first usable candidate field of the incoming event, then a fixed
// default. Entries expire after a TTL measured from their last access and
// are removed lazily on lookup and periodically by `spawn_sweeper`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Returned when no candidate field carries a URL. Never cached.
pub const DEFAULT_AVATAR_URL: &str = "https://i.imgur.com/0Z8FQmT.png";

/// Default time-to-live since last access.
pub const DEFAULT_PROFILE_TTL: Duration = Duration::from_secs(30 * 60);

/// Candidate fields in preference order.
const AVATAR_FIELDS: [&str; 5] =
    ["profilePictureUrl", "avatarThumb", "avatarMedium", "avatarLarger", "avatarUrl"];

#[derive(Debug, Clone)]
struct CacheEntry {
    avatar_url: String,
    last_accessed: Instant,
}

#[derive(Debug)]
pub struct ProfileCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new(DEFAULT_PROFILE_TTL)
    }
}

impl ProfileCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Avatar URL for `participant_id`, consulting `attributes` on a miss.
    pub fn resolve(&self, participant_id: &str, attributes: &Map<String, Value>) -> String {
        self.resolve_at(participant_id, attributes, Instant::now())
    }

    pub fn resolve_at(
        &self,
        participant_id: &str,
        attributes: &Map<String, Value>,
        now: Instant,
    ) -> String {
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(participant_id) {
            if now.saturating_duration_since(entry.last_accessed) <= self.ttl {
                entry.last_accessed = now;
                return entry.avatar_url.clone();
            }
            entries.remove(participant_id);
        }

        match avatar_from_attributes(attributes) {
            Some(url) => {
                if !participant_id.is_empty() {
                    entries.insert(
                        participant_id.to_string(),
                        CacheEntry { avatar_url: url.clone(), last_accessed: now },
                    );
                }
                url
            }
            None => DEFAULT_AVATAR_URL.to_string(),
        }
    }

    /// Remove every entry idle for longer than the TTL. Returns the number
    /// of evicted entries.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_accessed) <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Run `sweep` every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(cache: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.reset();
            loop {
                ticker.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "profile cache swept");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned map still holds valid entries.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// First non-empty URL among the candidate fields.
pub fn avatar_from_attributes(attributes: &Map<String, Value>) -> Option<String> {
    AVATAR_FIELDS.iter().filter_map(|field| attributes.get(*field)).find_map(url_from_value)
}

fn url_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(items) => items.iter().find_map(url_from_value),
        Value::Object(object) => {
            object.get("urlList").or_else(|| object.get("url_list")).and_then(url_from_value)
        }
        _ => None,
    }
}
