// Connection health reported to overlays on every supervisor transition.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one tenant's upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Paused,
    Deactivated,
}

impl SupervisorState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Paused => "paused",
            Self::Deactivated => "deactivated",
        }
    }
}

/// Why a session sits in [`SupervisorState::Paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Nobody is listening; resumes on the next subscriber.
    NoSubscribers,
    /// The upstream identity does not exist; only manual reactivation resumes.
    TenantNotFound,
}

impl PauseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSubscribers => "no_subscribers",
            Self::TenantNotFound => "tenant_not_found",
        }
    }
}

/// Path used to reach the upstream platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Through the configured intermediary (proxy).
    Proxy,
    Direct,
}

/// Payload of a `status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SupervisorState,
    /// Short machine-readable cause (`timeout`, `no_subscribers`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Seconds until the next attempt, while in backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnecting_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMode>,
    #[serde(default)]
    pub failures: u32,
}

impl StatusReport {
    pub fn new(state: SupervisorState) -> Self {
        Self { state, reason: None, reconnecting_in: None, transport: None, failures: 0 }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn reconnecting_in_secs(mut self, secs: u64) -> Self {
        self.reconnecting_in = Some(secs);
        self
    }
}
