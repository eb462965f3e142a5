// Per-tenant session state.
//
// A plain value type: every transition is a method that takes the current
// instant, so the reconnect and fallback rules are testable without a
// runtime. The supervisor task owns one `Session` and re-invokes the
// upstream connect for each attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tapcast_common::protocol::{PauseReason, StatusReport, SupervisorState, TransportMode};
use tapcast_common::tenant::TenantKey;
use tokio::time::Instant;

use super::backoff::ReconnectPolicy;

/// Result of recording an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Transport the next attempt switches to, if the failure toggled it.
    pub switched_to: Option<TransportMode>,
}

#[derive(Debug, Clone)]
pub struct Session {
    tenant_key: TenantKey,
    state: SupervisorState,
    pause_reason: Option<PauseReason>,
    failure_count: u32,
    proxy_failure_count: u32,
    using_direct_fallback: bool,
    direct_since: Option<Instant>,
    transport: Option<TransportMode>,
    next_attempt_at: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(tenant_key: TenantKey) -> Self {
        Self {
            tenant_key,
            state: SupervisorState::Disconnected,
            pause_reason: None,
            failure_count: 0,
            proxy_failure_count: 0,
            using_direct_fallback: false,
            direct_since: None,
            transport: None,
            next_attempt_at: None,
            last_success_at: None,
        }
    }

    pub fn tenant_key(&self) -> &TenantKey {
        &self.tenant_key
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.pause_reason
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn proxy_failure_count(&self) -> u32 {
        self.proxy_failure_count
    }

    pub fn using_direct_fallback(&self) -> bool {
        self.using_direct_fallback
    }

    /// Transport of the current or most recent attempt.
    pub fn transport(&self) -> Option<TransportMode> {
        self.transport
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    /// Deadline of the pending reconnect, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        match self.state {
            SupervisorState::Disconnected | SupervisorState::Backoff => self.next_attempt_at,
            _ => None,
        }
    }

    /// Transport the next attempt would use.
    pub fn next_transport(&self, proxy_configured: bool) -> TransportMode {
        if proxy_configured && !self.using_direct_fallback {
            TransportMode::Proxy
        } else {
            TransportMode::Direct
        }
    }

    /// Schedule an attempt at `now`. Only meaningful while disconnected.
    pub fn schedule_immediate(&mut self, now: Instant) {
        if self.state == SupervisorState::Disconnected {
            self.next_attempt_at = Some(now);
        }
    }

    /// `Disconnected/Backoff -> Connecting`. Returns the transport to use,
    /// or `None` when the session is not in a state that may attempt.
    pub fn begin_attempt(&mut self, proxy_configured: bool) -> Option<TransportMode> {
        if !matches!(self.state, SupervisorState::Disconnected | SupervisorState::Backoff) {
            return None;
        }
        let transport = self.next_transport(proxy_configured);
        self.state = SupervisorState::Connecting;
        self.transport = Some(transport);
        self.next_attempt_at = None;
        Some(transport)
    }

    /// `Connecting -> Connected`.
    pub fn on_connected(&mut self, policy: &ReconnectPolicy, now: Instant, at: DateTime<Utc>) {
        if self.state != SupervisorState::Connecting {
            return;
        }
        self.state = SupervisorState::Connected;
        self.failure_count = 0;
        self.proxy_failure_count = 0;
        self.last_success_at = Some(at);

        let fallback_elapsed = self
            .direct_since
            .is_some_and(|since| now.saturating_duration_since(since) >= policy.fallback_delay);
        if self.using_direct_fallback
            && self.transport == Some(TransportMode::Direct)
            && fallback_elapsed
        {
            self.using_direct_fallback = false;
            self.direct_since = None;
        }
    }

    /// `Connecting/Connected -> Backoff`. Applies the proxy/direct fallback
    /// rules and schedules the next attempt. Returns `None` if the session
    /// was not attempting or connected (stale failure).
    pub fn on_failure(&mut self, policy: &ReconnectPolicy, now: Instant) -> Option<FailureOutcome> {
        if !matches!(self.state, SupervisorState::Connecting | SupervisorState::Connected) {
            return None;
        }

        let outcome = if self.transport == Some(TransportMode::Proxy)
            && self.proxy_failure_count + 1 >= policy.proxy_failure_threshold
        {
            self.using_direct_fallback = true;
            self.direct_since = Some(now);
            self.failure_count = 0;
            self.proxy_failure_count = 0;
            FailureOutcome { delay: policy.base_delay, switched_to: Some(TransportMode::Direct) }
        } else if self.transport == Some(TransportMode::Proxy) {
            self.proxy_failure_count += 1;
            self.failure_count = self.failure_count.saturating_add(1);
            FailureOutcome { delay: policy.delay_for(self.failure_count), switched_to: None }
        } else if self.using_direct_fallback {
            self.using_direct_fallback = false;
            self.direct_since = None;
            self.proxy_failure_count = 0;
            self.failure_count = self.failure_count.saturating_add(1);
            FailureOutcome { delay: policy.fallback_delay, switched_to: Some(TransportMode::Proxy) }
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
            FailureOutcome { delay: policy.delay_for(self.failure_count), switched_to: None }
        };

        self.state = SupervisorState::Backoff;
        self.next_attempt_at = Some(now + outcome.delay);
        Some(outcome)
    }

    /// Any non-deactivated state `-> Paused`. Cancels the pending attempt.
    /// Returns false when nothing changed.
    pub fn pause(&mut self, reason: PauseReason) -> bool {
        if self.state == SupervisorState::Deactivated {
            return false;
        }
        if self.state == SupervisorState::Paused && self.pause_reason == Some(reason) {
            return false;
        }
        // A misconfiguration pause outranks an idle pause.
        if self.pause_reason == Some(PauseReason::TenantNotFound)
            && reason == PauseReason::NoSubscribers
        {
            return false;
        }
        self.state = SupervisorState::Paused;
        self.pause_reason = Some(reason);
        self.next_attempt_at = None;
        true
    }

    /// Lift an idle pause so the next attempt can begin. A
    /// misconfiguration pause is kept; see [`Session::reactivate`].
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.state != SupervisorState::Paused
            || self.pause_reason != Some(PauseReason::NoSubscribers)
        {
            return false;
        }
        self.state = SupervisorState::Disconnected;
        self.pause_reason = None;
        self.next_attempt_at = Some(now);
        true
    }

    /// Manual reactivation: clears any pause or backoff, resets the failure
    /// streak and schedules an attempt at `now`.
    pub fn reactivate(&mut self, now: Instant) -> bool {
        if !matches!(
            self.state,
            SupervisorState::Paused | SupervisorState::Backoff | SupervisorState::Disconnected
        ) {
            return false;
        }
        self.state = SupervisorState::Disconnected;
        self.pause_reason = None;
        self.failure_count = 0;
        self.proxy_failure_count = 0;
        self.next_attempt_at = Some(now);
        true
    }

    /// Terminal transition.
    pub fn deactivate(&mut self) {
        self.state = SupervisorState::Deactivated;
        self.pause_reason = None;
        self.next_attempt_at = None;
    }

    /// Status payload describing the current state.
    pub fn status_report(&self, now: Instant) -> StatusReport {
        let mut report = StatusReport::new(self.state).with_failures(self.failure_count);
        if let Some(reason) = self.pause_reason {
            report = report.with_reason(reason.as_str());
        }
        if let Some(transport) = self.transport {
            report = report.with_transport(transport);
        }
        if let Some(deadline) = self.reconnect_deadline() {
            let remaining = deadline.saturating_duration_since(now);
            report = report.reconnecting_in_secs(ceil_secs(remaining));
        }
        report
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
