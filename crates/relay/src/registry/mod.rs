// Process-wide tenant table.
//
// The registry is the only structure touched from many call sites at once
// (socket upgrades, operator routes, shutdown). It holds tenant
// registrations and the handle of each tenant's supervisor; everything
// per-tenant is serialized inside that supervisor's task, so the map lock
// is only held long enough to look up or insert a handle.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tapcast_common::protocol::{EventBody, LiveEvent};
use tapcast_common::tenant::TenantKey;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TenantConfig;
use crate::hub::auth::secrets_match;
use crate::hub::Subscriber;
use crate::profile::ProfileCache;
use crate::supervisor::{spawn_session, SessionHandle, SessionSnapshot, SupervisorSettings};
use crate::upstream::UpstreamSource;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tenant")]
    UnknownTenant,
    #[error("subscriber secret rejected")]
    Unauthorized,
    #[error("tenant is already registered for a different streamer")]
    IdentityConflict,
    #[error("tenant session has stopped")]
    SessionClosed,
    #[error("invalid tenant registration: {0}")]
    InvalidTenant(String),
}

impl From<crate::supervisor::SessionClosed> for RegistryError {
    fn from(_: crate::supervisor::SessionClosed) -> Self {
        Self::SessionClosed
    }
}

/// Operator-facing view of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Redacted tenant key.
    pub key: String,
    pub streamer: String,
    pub configured_active: bool,
    /// Absent while no supervisor has been started for the tenant.
    #[serde(flatten)]
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug)]
struct TenantEntry {
    config: TenantConfig,
    session: Option<SessionHandle>,
}

impl TenantEntry {
    fn live_session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().filter(|handle| !handle.is_closed())
    }
}

pub struct SessionRegistry<S: UpstreamSource> {
    source: Arc<S>,
    settings: Arc<SupervisorSettings>,
    profiles: Arc<ProfileCache>,
    default_secret: String,
    tenants: RwLock<HashMap<TenantKey, TenantEntry>>,
}

impl<S: UpstreamSource> SessionRegistry<S> {
    pub fn new(
        source: Arc<S>,
        settings: SupervisorSettings,
        profiles: Arc<ProfileCache>,
        default_secret: impl Into<String>,
    ) -> Self {
        Self {
            source,
            settings: Arc::new(settings),
            profiles,
            default_secret: default_secret.into(),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    fn spawn(&self, config: &TenantConfig, always_on: bool) -> SessionHandle {
        spawn_session(
            config.key.clone(),
            config.identity.clone(),
            always_on,
            Arc::clone(&self.source),
            Arc::clone(&self.settings),
            Arc::clone(&self.profiles),
        )
    }

    // ── Tenant lifecycle ────────────────────────────────────────────

    /// Add or update a tenant. Active tenants get a supervisor straight
    /// away; others wait for their first subscriber. A changed `active`
    /// flag is applied to a running supervisor. Returns true when the
    /// tenant was not previously registered.
    pub async fn register_tenant(&self, config: TenantConfig) -> Result<bool, RegistryError> {
        let config = config.normalized();
        if config.key.is_empty() {
            return Err(RegistryError::InvalidTenant("tenant key must not be empty".into()));
        }

        let mut tenants = self.tenants.write().await;
        let created = match tenants.get_mut(&config.key) {
            Some(entry) => {
                if entry.config.identity != config.identity {
                    return Err(RegistryError::IdentityConflict);
                }
                let active_changed = entry.config.active != config.active;
                entry.config.active = config.active;
                entry.config.secret = config.secret.clone();
                if active_changed {
                    if let Some(handle) = entry.live_session() {
                        handle.set_always_on(config.active)?;
                    }
                }
                false
            }
            None => {
                tenants.insert(config.key.clone(), TenantEntry { config: config.clone(), session: None });
                true
            }
        };

        if config.active {
            if let Some(entry) = tenants.get_mut(&config.key) {
                if entry.live_session().is_none() {
                    entry.session = Some(self.spawn(&config, true));
                }
            }
        }

        info!(
            tenant = %config.key.redacted(),
            streamer = %config.identity,
            active = config.active,
            created,
            "tenant registered"
        );
        Ok(created)
    }

    /// Stop the tenant's supervisor and remove the registration. Open
    /// sockets receive a final status frame and a close frame.
    pub async fn deactivate_tenant(&self, key: &TenantKey) -> Result<(), RegistryError> {
        let entry = self.tenants.write().await.remove(key).ok_or(RegistryError::UnknownTenant)?;
        if let Some(handle) = entry.session {
            // A stopped task has nothing left to tear down.
            let _ = handle.deactivate().await;
        }
        info!(tenant = %key.redacted(), "tenant deactivated");
        Ok(())
    }

    /// Lift a misconfiguration pause or restart a backoff streak.
    pub async fn reactivate_tenant(&self, key: &TenantKey) -> Result<(), RegistryError> {
        let mut tenants = self.tenants.write().await;
        let entry = tenants.get_mut(key).ok_or(RegistryError::UnknownTenant)?;
        match entry.live_session() {
            Some(handle) => handle.reactivate()?,
            None => entry.session = Some(self.spawn(&entry.config, true)),
        }
        info!(tenant = %key.redacted(), "tenant reactivation requested");
        Ok(())
    }

    // ── Subscribers ─────────────────────────────────────────────────

    /// Check an upgrade request. The tenant's own secret wins over the
    /// global one.
    pub async fn authenticate_subscriber_upgrade(
        &self,
        key: &TenantKey,
        secret: &str,
    ) -> Result<(), RegistryError> {
        let tenants = self.tenants.read().await;
        let entry = tenants.get(key).ok_or(RegistryError::UnknownTenant)?;
        let expected = entry.config.secret.as_deref().unwrap_or(&self.default_secret);
        if secrets_match(secret, expected) {
            Ok(())
        } else {
            Err(RegistryError::Unauthorized)
        }
    }

    /// Hand an authenticated subscriber to its tenant's supervisor,
    /// creating the supervisor on first use.
    pub async fn attach_subscriber(&self, subscriber: Subscriber) -> Result<(), RegistryError> {
        let key = subscriber.tenant_key().clone();
        let mut tenants = self.tenants.write().await;
        let entry = tenants.get_mut(&key).ok_or(RegistryError::UnknownTenant)?;

        if entry.live_session().is_none() {
            info!(tenant = %key.redacted(), streamer = %entry.config.identity, "creating session for first subscriber");
            entry.session = Some(self.spawn(&entry.config, entry.config.active));
        }
        match entry.live_session() {
            Some(handle) => handle.attach(subscriber).map_err(RegistryError::from),
            None => Err(RegistryError::SessionClosed),
        }
    }

    pub async fn detach_subscriber(&self, key: &TenantKey, subscriber_id: Uuid) {
        let tenants = self.tenants.read().await;
        if let Some(handle) = tenants.get(key).and_then(TenantEntry::live_session) {
            let _ = handle.detach(subscriber_id);
        }
    }

    // ── External ingestion ──────────────────────────────────────────

    /// Feed an event into the tenant's pipeline as if it came from the
    /// upstream. Returns false when no supervisor is running, so nobody
    /// could receive it.
    pub async fn inject_external_event(
        &self,
        key: &TenantKey,
        participant: Option<tapcast_common::protocol::Participant>,
        body: EventBody,
    ) -> Result<bool, RegistryError> {
        let tenants = self.tenants.read().await;
        let entry = tenants.get(key).ok_or(RegistryError::UnknownTenant)?;
        let Some(handle) = entry.live_session() else {
            return Ok(false);
        };
        let event = LiveEvent::new(key.clone(), entry.config.identity.clone(), participant, body);
        handle.inject(event)?;
        Ok(true)
    }

    /// Relay a webhook payload as a `webhook` raw event to every active
    /// tenant. Returns the number of tenants reached.
    pub async fn broadcast_webhook(&self, payload: Value) -> usize {
        let tenants = self.tenants.read().await;
        let mut reached = 0;
        for (key, entry) in tenants.iter().filter(|(_, entry)| entry.config.active) {
            let Some(handle) = entry.live_session() else {
                continue;
            };
            let event = LiveEvent::new(
                key.clone(),
                entry.config.identity.clone(),
                None,
                EventBody::Raw { event: "webhook".to_string(), data: payload.clone() },
            );
            match handle.inject(event) {
                Ok(()) => reached += 1,
                Err(error) => warn!(tenant = %key.redacted(), error = %error, "webhook not delivered"),
            }
        }
        reached
    }

    // ── Observability ───────────────────────────────────────────────

    pub async fn status_snapshot(&self) -> Vec<TenantStatus> {
        let tenants = self.tenants.read().await;
        let mut statuses: Vec<TenantStatus> = tenants
            .values()
            .map(|entry| TenantStatus {
                key: entry.config.key.redacted(),
                streamer: entry.config.identity.clone(),
                configured_active: entry.config.active,
                session: entry.session.as_ref().map(SessionHandle::snapshot),
            })
            .collect();
        statuses.sort_by(|a, b| a.streamer.cmp(&b.streamer));
        statuses
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// Deactivate every supervisor. Registrations stay so a restart of the
    /// registry would not be needed to inspect them.
    pub async fn shutdown(&self) {
        let handles: Vec<(TenantKey, SessionHandle)> = {
            let mut tenants = self.tenants.write().await;
            tenants
                .iter_mut()
                .filter_map(|(key, entry)| entry.session.take().map(|handle| (key.clone(), handle)))
                .collect()
        };
        let count = handles.len();
        for (key, handle) in handles {
            if handle.deactivate().await.is_err() {
                warn!(tenant = %key.redacted(), "session had already stopped");
            }
        }
        info!(sessions = count, "registry shut down");
    }
}
