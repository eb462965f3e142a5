// Per-tenant connection supervisor.
//
// One task per tenant owns the session state, the subscriber hub and the
// aggregator, so every mutation for a tenant is serialized through its
// command queue while tenants run independently of one another. All timers
// (pending connect, reconnect, aggregation flush, liveness sweep) are
// branches of the task's select loop and disappear with the state that
// armed them.

pub mod backoff;
pub mod session;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tapcast_common::protocol::{
    LiveEvent, Participant, PauseReason, SupervisorState, TransportMode,
};
use tapcast_common::tenant::TenantKey;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::aggregate::{AggregatorConfig, EventAggregator, Observation};
use crate::hub::{Occupancy, Outbound, Subscriber, SubscriberHub};
use crate::profile::ProfileCache;
use crate::upstream::{
    TransportOptions, UpstreamError, UpstreamEvent, UpstreamMessage, UpstreamSession,
    UpstreamSource,
};

pub use backoff::ReconnectPolicy;
pub use session::{FailureOutcome, Session};

// ── Configuration ───────────────────────────────────────────────────

/// Settings shared by every tenant's supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub policy: ReconnectPolicy,
    /// Intermediary transport; `None` means every attempt is direct.
    pub proxy_url: Option<Url>,
    /// Upper bound on one connect call.
    pub connect_timeout: Duration,
    pub aggregator: AggregatorConfig,
    /// Subscriber liveness sweep interval.
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            proxy_url: None,
            connect_timeout: Duration::from_secs(20),
            aggregator: AggregatorConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Point-in-time view of one tenant, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SupervisorState,
    pub pause_reason: Option<PauseReason>,
    pub subscriber_count: usize,
    pub last_success_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub using_direct_fallback: bool,
    pub transport: Option<TransportMode>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("session task has stopped")]
pub struct SessionClosed;

enum SessionCommand {
    Update(SessionUpdate),
    /// Ends the task once the session is torn down.
    Deactivate { done: oneshot::Sender<()> },
}

enum SessionUpdate {
    Attach { subscriber: Subscriber },
    Detach { subscriber_id: Uuid },
    Inject { event: LiveEvent },
    Reactivate,
    SetAlwaysOn(bool),
}

/// Owner's handle to a running supervisor task.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.commands.send(command).map_err(|_| SessionClosed)
    }

    fn update(&self, update: SessionUpdate) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Update(update))
    }

    pub fn attach(&self, subscriber: Subscriber) -> Result<(), SessionClosed> {
        self.update(SessionUpdate::Attach { subscriber })
    }

    pub fn detach(&self, subscriber_id: Uuid) -> Result<(), SessionClosed> {
        self.update(SessionUpdate::Detach { subscriber_id })
    }

    pub fn inject(&self, event: LiveEvent) -> Result<(), SessionClosed> {
        self.update(SessionUpdate::Inject { event })
    }

    pub fn reactivate(&self) -> Result<(), SessionClosed> {
        self.update(SessionUpdate::Reactivate)
    }

    /// Change whether the tenant connects without subscribers. Turning it
    /// on lifts an idle pause; turning it off pauses an unwatched session.
    pub fn set_always_on(&self, always_on: bool) -> Result<(), SessionClosed> {
        self.update(SessionUpdate::SetAlwaysOn(always_on))
    }

    /// Stop the supervisor: flush, tear down upstream, close subscribers,
    /// and wait for the task to finish.
    pub async fn deactivate(self) -> Result<(), SessionClosed> {
        let (done, finished) = oneshot::channel();
        let sent = self.send(SessionCommand::Deactivate { done });
        if sent.is_ok() {
            let _ = finished.await;
        }
        let _ = self.task.await;
        sent
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start a supervisor for `key`. With `always_on` the first attempt is
/// made immediately; otherwise the session parks in
/// `Paused(no_subscribers)` until a subscriber attaches.
pub fn spawn_session<S: UpstreamSource>(
    key: TenantKey,
    identity: String,
    always_on: bool,
    source: Arc<S>,
    settings: Arc<SupervisorSettings>,
    profiles: Arc<ProfileCache>,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (supervisor, snapshot_rx) =
        Supervisor::new(key, identity, always_on, source, settings, profiles);
    let task = tokio::spawn(supervisor.run(commands_rx));

    SessionHandle { commands: commands_tx, snapshot: snapshot_rx, task }
}

// ── Supervisor task ─────────────────────────────────────────────────

type ConnectFuture = Pin<Box<dyn Future<Output = Result<UpstreamSession, UpstreamError>> + Send>>;

struct Supervisor<S: UpstreamSource> {
    key: TenantKey,
    identity: String,
    always_on: bool,
    source: Arc<S>,
    settings: Arc<SupervisorSettings>,
    profiles: Arc<ProfileCache>,
    session: Session,
    hub: SubscriberHub,
    aggregator: EventAggregator,
    connecting: Option<ConnectFuture>,
    upstream: Option<UpstreamSession>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<S: UpstreamSource> Supervisor<S> {
    fn new(
        key: TenantKey,
        identity: String,
        always_on: bool,
        source: Arc<S>,
        settings: Arc<SupervisorSettings>,
        profiles: Arc<ProfileCache>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let session = Session::new(key.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&session, 0, Instant::now()));
        let supervisor = Self {
            hub: SubscriberHub::new(key.clone()),
            aggregator: EventAggregator::new(settings.aggregator.clone()),
            key,
            identity,
            always_on,
            source,
            settings,
            profiles,
            session,
            connecting: None,
            upstream: None,
            snapshot_tx,
        };
        (supervisor, snapshot_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        if self.always_on {
            self.session.schedule_immediate(Instant::now());
            self.publish();
        } else {
            self.pause(PauseReason::NoSubscribers, None);
        }

        let mut liveness = tokio::time::interval(self.settings.heartbeat_interval);
        liveness.reset(); // skip immediate first tick

        loop {
            let reconnect_at = self.session.reconnect_deadline();
            let flush_at = self.aggregator.next_deadline();

            tokio::select! {
                biased;
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Deactivate { done }) => {
                            self.deactivate();
                            let _ = done.send(());
                            break;
                        }
                        Some(SessionCommand::Update(update)) => self.apply_update(update),
                        None => {
                            self.deactivate();
                            break;
                        }
                    }
                }
                result = pending_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                event = next_upstream_event(&mut self.upstream), if self.upstream.is_some() => {
                    self.on_upstream_event(event);
                }
                _ = sleep_until_deadline(reconnect_at), if reconnect_at.is_some() && self.connecting.is_none() => {
                    self.start_attempt();
                }
                _ = sleep_until_deadline(flush_at), if flush_at.is_some() => {
                    for event in self.aggregator.drain_ready_at(Instant::now()) {
                        self.deliver(&event);
                    }
                }
                _ = liveness.tick() => {
                    let report = self.hub.sweep();
                    if !report.removed.is_empty() {
                        debug!(tenant = %self.key.redacted(), evicted = report.removed.len(), "liveness sweep evicted subscribers");
                        self.apply_occupancy(report.occupancy);
                        self.publish();
                    }
                }
            }
        }

        debug!(tenant = %self.key.redacted(), "supervisor stopped");
    }

    fn apply_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Attach { subscriber } => self.attach(subscriber),
            SessionUpdate::Detach { subscriber_id } => {
                let occupancy = self.hub.detach(subscriber_id);
                self.apply_occupancy(occupancy);
                self.publish();
            }
            SessionUpdate::Inject { event } => self.dispatch(event),
            SessionUpdate::Reactivate => self.reactivate(),
            SessionUpdate::SetAlwaysOn(always_on) => self.set_always_on(always_on),
        }
    }

    fn attach(&mut self, subscriber: Subscriber) {
        let occupancy = self.hub.attach(subscriber.clone());
        let resumes = occupancy == Occupancy::FirstSubscriber
            && self.session.pause_reason() == Some(PauseReason::NoSubscribers);

        if resumes {
            self.apply_occupancy(occupancy);
        } else {
            // Late joiners still learn the current connection health.
            let status = self.status_event(None);
            if let Ok(encoded) = status.to_json() {
                let _ = subscriber.deliver(Outbound::Event(Arc::from(encoded)));
            }
        }
        self.publish();
    }

    fn apply_occupancy(&mut self, occupancy: Occupancy) {
        match occupancy {
            Occupancy::FirstSubscriber => {
                if self.session.resume(Instant::now()) {
                    info!(tenant = %self.key.redacted(), "first subscriber attached, resuming");
                    self.start_attempt();
                }
            }
            Occupancy::BecameEmpty => {
                info!(tenant = %self.key.redacted(), "last subscriber left, pausing upstream");
                self.pause(PauseReason::NoSubscribers, None);
            }
            Occupancy::Unchanged => {}
        }
    }

    fn reactivate(&mut self) {
        if !self.session.reactivate(Instant::now()) {
            debug!(tenant = %self.key.redacted(), state = self.session.state().as_str(), "reactivate ignored");
            return;
        }
        info!(tenant = %self.key.redacted(), "session reactivated");
        if self.hub.is_empty() && !self.always_on {
            self.pause(PauseReason::NoSubscribers, None);
        } else {
            self.emit_status(None);
        }
    }

    fn set_always_on(&mut self, always_on: bool) {
        if self.always_on == always_on {
            return;
        }
        self.always_on = always_on;
        if always_on {
            if self.session.resume(Instant::now()) {
                info!(tenant = %self.key.redacted(), "tenant marked active, connecting");
                self.start_attempt();
            }
        } else if self.hub.is_empty() {
            info!(tenant = %self.key.redacted(), "tenant marked inactive without subscribers, pausing");
            self.pause(PauseReason::NoSubscribers, None);
        }
        self.publish();
    }

    // ── Upstream lifecycle ──────────────────────────────────────────

    fn start_attempt(&mut self) {
        let proxy_configured = self.settings.proxy_url.is_some();
        let Some(mode) = self.session.begin_attempt(proxy_configured) else {
            return;
        };
        info!(tenant = %self.key.redacted(), streamer = %self.identity, transport = ?mode, "connecting upstream");

        let source = Arc::clone(&self.source);
        let identity = self.identity.clone();
        let options = TransportOptions { mode, proxy_url: self.settings.proxy_url.clone() };
        let timeout = self.settings.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, source.connect(&identity, &options)).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout(timeout)),
            }
        }));
        self.emit_status(None);
    }

    fn on_connect_result(&mut self, result: Result<UpstreamSession, UpstreamError>) {
        match result {
            Ok(upstream) => {
                if self.session.state() != SupervisorState::Connecting {
                    upstream.disconnect();
                    return;
                }
                self.session.on_connected(&self.settings.policy, Instant::now(), Utc::now());
                info!(
                    tenant = %self.key.redacted(),
                    streamer = %self.identity,
                    room_id = upstream.room_id().unwrap_or("-"),
                    "upstream connected"
                );
                self.upstream = Some(upstream);
                self.emit_status(None);
            }
            Err(error) => self.on_failure(error),
        }
    }

    fn on_upstream_event(&mut self, event: Option<UpstreamEvent>) {
        match event {
            Some(UpstreamEvent::Message(message)) => {
                let event = self.live_event(message);
                self.dispatch(event);
            }
            Some(UpstreamEvent::Closed { reason }) => {
                self.on_failure(UpstreamError::Disconnected(reason));
            }
            None => {
                self.on_failure(UpstreamError::Disconnected("upstream stream ended".to_string()));
            }
        }
    }

    fn on_failure(&mut self, error: UpstreamError) {
        self.teardown_upstream();

        if error.is_permanent() {
            warn!(tenant = %self.key.redacted(), streamer = %self.identity, error = %error, "upstream identity rejected, pausing until reactivated");
            self.pause(PauseReason::TenantNotFound, None);
            return;
        }

        let Some(outcome) = self.session.on_failure(&self.settings.policy, Instant::now()) else {
            return;
        };
        if let Some(mode) = outcome.switched_to {
            info!(tenant = %self.key.redacted(), transport = ?mode, "switching upstream transport");
        }
        warn!(
            tenant = %self.key.redacted(),
            streamer = %self.identity,
            error = %error,
            failures = self.session.failure_count(),
            delay_secs = outcome.delay.as_secs(),
            "upstream failed, backing off"
        );
        self.emit_status(Some(error.reason()));
    }

    fn teardown_upstream(&mut self) {
        self.connecting = None;
        if let Some(upstream) = self.upstream.take() {
            upstream.disconnect();
        }
    }

    fn pause(&mut self, reason: PauseReason, detail: Option<&str>) {
        for event in self.aggregator.flush_all() {
            self.deliver(&event);
        }
        self.teardown_upstream();
        if self.session.pause(reason) {
            self.emit_status(detail);
        } else {
            self.publish();
        }
    }

    fn deactivate(&mut self) {
        for event in self.aggregator.flush_all() {
            self.deliver(&event);
        }
        self.teardown_upstream();
        self.session.deactivate();
        let status = self.status_event(None);
        self.hub.broadcast(&status);
        let closed = self.hub.close_all("tenant deactivated");
        info!(tenant = %self.key.redacted(), subscribers = closed, "session deactivated");
        self.publish();
    }

    // ── Event path ──────────────────────────────────────────────────

    fn live_event(&self, message: UpstreamMessage) -> LiveEvent {
        let participant = (!message.participant_id.is_empty()).then(|| Participant {
            avatar_url: self.profiles.resolve(&message.participant_id, &message.attributes),
            id: message.participant_id,
            display_name: message.display_name,
        });
        LiveEvent::new(self.key.clone(), self.identity.clone(), participant, message.body)
    }

    fn dispatch(&mut self, event: LiveEvent) {
        match self.aggregator.observe_at(event, Instant::now()) {
            Observation::Forward(event) => self.deliver(&event),
            Observation::Absorbed => {}
        }
    }

    fn deliver(&mut self, event: &LiveEvent) {
        let report = self.hub.broadcast(event);
        if report.occupancy != Occupancy::Unchanged {
            self.apply_occupancy(report.occupancy);
        }
    }

    fn status_event(&self, reason: Option<&str>) -> LiveEvent {
        let mut report = self.session.status_report(Instant::now());
        if report.reason.is_none() {
            if let Some(reason) = reason {
                report = report.with_reason(reason);
            }
        }
        LiveEvent::status(self.key.clone(), self.identity.clone(), report)
    }

    fn emit_status(&mut self, reason: Option<&str>) {
        let status = self.status_event(reason);
        self.deliver(&status);
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(snapshot_of(&self.session, self.hub.len(), Instant::now()));
    }
}

fn snapshot_of(session: &Session, subscriber_count: usize, now: Instant) -> SessionSnapshot {
    let next_attempt_at = session.reconnect_deadline().and_then(|deadline| {
        chrono::Duration::from_std(deadline.saturating_duration_since(now))
            .ok()
            .map(|remaining| Utc::now() + remaining)
    });
    SessionSnapshot {
        state: session.state(),
        pause_reason: session.pause_reason(),
        subscriber_count,
        last_success_at: session.last_success_at(),
        failure_count: session.failure_count(),
        using_direct_fallback: session.using_direct_fallback(),
        transport: session.transport(),
        next_attempt_at,
    }
}

async fn pending_connect(
    connecting: &mut Option<ConnectFuture>,
) -> Result<UpstreamSession, UpstreamError> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_upstream_event(upstream: &mut Option<UpstreamSession>) -> Option<UpstreamEvent> {
    match upstream {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamFeed;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tapcast_common::protocol::EventBody;
    use tokio::sync::Mutex;

    enum MockOutcome {
        Succeed,
        Fail(UpstreamError),
        Hang,
    }

    /// Upstream source that returns scripted outcomes and keeps the feed
    /// of every successful connection so tests can push events.
    #[derive(Clone)]
    struct MockSource {
        outcomes: Arc<Mutex<Vec<MockOutcome>>>,
        transports: Arc<Mutex<Vec<TransportMode>>>,
        feeds: Arc<Mutex<Vec<UpstreamFeed>>>,
        connect_count: Arc<AtomicUsize>,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(Vec::new())),
                transports: Arc::new(Mutex::new(Vec::new())),
                feeds: Arc::new(Mutex::new(Vec::new())),
                connect_count: Arc::new(AtomicUsize::new(0)),
            }
        }

        async fn push(&self, outcome: MockOutcome) {
            self.outcomes.lock().await.push(outcome);
        }

        fn connect_calls(&self) -> usize {
            self.connect_count.load(Ordering::SeqCst)
        }

        async fn take_feed(&self) -> UpstreamFeed {
            loop {
                if let Some(feed) = self.feeds.lock().await.pop() {
                    return feed;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    impl UpstreamSource for MockSource {
        async fn connect(
            &self,
            _identity: &str,
            transport: &TransportOptions,
        ) -> Result<UpstreamSession, UpstreamError> {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
            self.transports.lock().await.push(transport.mode);
            let outcome = {
                let mut outcomes = self.outcomes.lock().await;
                if outcomes.is_empty() {
                    MockOutcome::Succeed
                } else {
                    outcomes.remove(0)
                }
            };
            match outcome {
                MockOutcome::Succeed => {
                    let (session, feed) = UpstreamSession::channel(Some("room-1".into()), 64);
                    self.feeds.lock().await.push(feed);
                    Ok(session)
                }
                MockOutcome::Fail(error) => Err(error),
                MockOutcome::Hang => std::future::pending().await,
            }
        }
    }

    fn settings() -> Arc<SupervisorSettings> {
        Arc::new(SupervisorSettings {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        })
    }

    fn spawn(mock: &MockSource, always_on: bool, settings: Arc<SupervisorSettings>) -> SessionHandle {
        spawn_session(
            TenantKey::new("abc"),
            "streamer".to_string(),
            always_on,
            Arc::new(mock.clone()),
            settings,
            Arc::new(ProfileCache::default()),
        )
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        loop {
            match rx.recv().await.expect("subscriber channel should stay open") {
                Outbound::Event(json) => {
                    return serde_json::from_str(&json).expect("frame should be json")
                }
                Outbound::Ping => continue,
                Outbound::Close { reason } => panic!("unexpected close: {reason}"),
            }
        }
    }

    async fn next_status(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        loop {
            let frame = next_frame(rx).await;
            if frame["type"] == "status" {
                return frame;
            }
        }
    }

    async fn wait_for_state(handle: &SessionHandle, state: SupervisorState) {
        let mut watch = handle.watch();
        watch.wait_for(|snapshot| snapshot.state == state).await.expect("supervisor alive");
    }

    fn tap_message(user: &str, count: u64) -> UpstreamEvent {
        UpstreamEvent::Message(UpstreamMessage {
            body: EventBody::Tap { count },
            participant_id: user.to_string(),
            display_name: user.to_uppercase(),
            attributes: Map::new(),
        })
    }

    // ── Reconnect / backoff ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn always_on_tenant_retries_until_connected() {
        let mock = MockSource::new();
        mock.push(MockOutcome::Fail(UpstreamError::Transport("refused".into()))).await;
        mock.push(MockOutcome::Fail(UpstreamError::Transport("refused".into()))).await;

        let handle = spawn(&mock, true, settings());
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");

        let mut states = Vec::new();
        let mut delays = Vec::new();
        loop {
            let status = next_status(&mut rx).await;
            let state = status["state"].as_str().expect("state").to_string();
            if state == "backoff" {
                delays.push(status["reconnectingIn"].as_u64().expect("delay"));
            }
            states.push(state.clone());
            if state == "connected" {
                break;
            }
        }

        let after_start: Vec<&str> =
            states.iter().map(String::as_str).skip_while(|s| *s != "connecting").collect();
        assert_eq!(
            after_start,
            ["connecting", "backoff", "connecting", "backoff", "connecting", "connected"]
        );
        assert_eq!(delays.len(), 2);
        assert!(delays[1] > delays[0]);
        assert_eq!(mock.connect_calls(), 3);
        assert_eq!(handle.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_failure() {
        let mock = MockSource::new();
        mock.push(MockOutcome::Hang).await;

        let handle = spawn(&mock, true, settings());
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");

        loop {
            let status = next_status(&mut rx).await;
            if status["state"] == "backoff" {
                assert_eq!(status["reason"], "timeout");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_failures_fall_back_to_direct() {
        let mock = MockSource::new();
        for _ in 0..2 {
            mock.push(MockOutcome::Fail(UpstreamError::Transport("proxy refused".into()))).await;
        }
        let settings = Arc::new(SupervisorSettings {
            proxy_url: Some(Url::parse("http://proxy.local:3128").expect("url")),
            policy: ReconnectPolicy { proxy_failure_threshold: 2, ..Default::default() },
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        let handle = spawn(&mock, true, settings);
        wait_for_state(&handle, SupervisorState::Connected).await;

        let transports = mock.transports.lock().await.clone();
        assert_eq!(transports, [TransportMode::Proxy, TransportMode::Proxy, TransportMode::Direct]);
        assert!(handle.snapshot().using_direct_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_not_found_pauses_until_reactivated() {
        let mock = MockSource::new();
        mock.push(MockOutcome::Fail(UpstreamError::TenantNotFound("ghost".into()))).await;

        let handle = spawn(&mock, true, settings());
        wait_for_state(&handle, SupervisorState::Paused).await;
        assert_eq!(handle.snapshot().pause_reason, Some(PauseReason::TenantNotFound));

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(mock.connect_calls(), 1);

        handle.reactivate().expect("reactivate");
        wait_for_state(&handle, SupervisorState::Connected).await;
        assert_eq!(mock.connect_calls(), 2);
    }

    // ── Subscriber-driven pause / resume ────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn first_subscriber_resumes_lazy_session() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        wait_for_state(&handle, SupervisorState::Paused).await;
        assert_eq!(mock.connect_calls(), 0);

        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");

        assert_eq!(next_status(&mut rx).await["state"], "connecting");
        assert_eq!(next_status(&mut rx).await["state"], "connected");
        assert_eq!(handle.snapshot().subscriber_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_subscriber_leaving_pauses_and_tears_down() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        let (subscriber, _rx) = Subscriber::new(TenantKey::new("abc"));
        let id = subscriber.id();
        handle.attach(subscriber).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;
        let mut feed = mock.take_feed().await;

        handle.detach(id).expect("detach");
        wait_for_state(&handle, SupervisorState::Paused).await;
        feed.cancelled().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.pause_reason, Some(PauseReason::NoSubscribers));
        assert!(snapshot.next_attempt_at.is_none());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_flushes_open_tap_window_before_status() {
        let mock = MockSource::new();
        let (mut supervisor, _snapshots) = Supervisor::new(
            TenantKey::new("abc"),
            "streamer".to_string(),
            false,
            Arc::new(mock),
            settings(),
            Arc::new(ProfileCache::default()),
        );
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        supervisor.hub.attach(subscriber);

        supervisor.dispatch(LiveEvent::new(
            TenantKey::new("abc"),
            "streamer",
            None,
            EventBody::Tap { count: 4 },
        ));
        assert_eq!(supervisor.aggregator.open_windows(), 1);

        supervisor.pause(PauseReason::NoSubscribers, None);

        assert_eq!(supervisor.aggregator.open_windows(), 0);
        assert!(supervisor.aggregator.next_deadline().is_none());
        let tap = next_frame(&mut rx).await;
        assert_eq!(tap["type"], "tap");
        assert_eq!(tap["likes"], 4);
        let status = next_frame(&mut rx).await;
        assert_eq!(status["state"], "paused");
    }

    #[tokio::test(start_paused = true)]
    async fn taps_open_at_pause_do_not_leak_into_next_connection() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        let (first, _first_rx) = Subscriber::new(TenantKey::new("abc"));
        let first_id = first.id();
        handle.attach(first).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;

        let feed = mock.take_feed().await;
        feed.send(tap_message("early", 4)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.detach(first_id).expect("detach");
        wait_for_state(&handle, SupervisorState::Paused).await;

        let (second, mut second_rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(second).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;
        let feed = mock.take_feed().await;
        feed.send(tap_message("late", 1)).await;

        let tap = loop {
            let frame = next_frame(&mut second_rx).await;
            if frame["type"] == "tap" {
                break frame;
            }
        };
        assert_eq!(tap["likes"], 1);
        assert_eq!(tap["user"], "late");
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_close_triggers_backoff() {
        let mock = MockSource::new();
        let handle = spawn(&mock, true, settings());
        wait_for_state(&handle, SupervisorState::Connected).await;

        let feed = mock.take_feed().await;
        feed.send(UpstreamEvent::Closed { reason: "stream ended".into() }).await;
        wait_for_state(&handle, SupervisorState::Backoff).await;
        assert_eq!(handle.snapshot().failure_count, 1);
        wait_for_state(&handle, SupervisorState::Connected).await;
        assert_eq!(mock.connect_calls(), 2);
    }

    // ── Event path ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn burst_of_taps_is_delivered_once() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;

        let feed = mock.take_feed().await;
        for i in 0..10 {
            feed.send(tap_message(&format!("viewer{i}"), 1)).await;
        }

        let tap = loop {
            let frame = next_frame(&mut rx).await;
            if frame["type"] == "tap" {
                break frame;
            }
        };
        assert_eq!(tap["likes"], 10);
        assert_eq!(tap["user"], "viewer0");
        assert_eq!(tap["pfp"], crate::profile::DEFAULT_AVATAR_URL);

        let extra = tokio::time::timeout(Duration::from_secs(5), next_frame(&mut rx)).await;
        assert!(extra.is_err(), "no second tap frame expected");
    }

    #[tokio::test(start_paused = true)]
    async fn injected_events_reach_subscribers() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");

        handle
            .inject(LiveEvent::new(TenantKey::new("abc"), "streamer", None, EventBody::Follow))
            .expect("inject");

        let follow = loop {
            let frame = next_frame(&mut rx).await;
            if frame["type"] == "follow" {
                break frame;
            }
        };
        assert_eq!(follow["streamer"], "streamer");
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_subscriber_is_evicted() {
        let mock = MockSource::new();
        let settings = Arc::new(SupervisorSettings {
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        });
        let handle = spawn(&mock, false, settings);
        let (subscriber, _rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;

        wait_for_state(&handle, SupervisorState::Paused).await;
        assert_eq!(handle.snapshot().subscriber_count, 0);
    }

    // ── Deactivation ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn deactivate_flushes_and_closes_subscribers() {
        let mock = MockSource::new();
        let handle = spawn(&mock, false, settings());
        let (subscriber, mut rx) = Subscriber::new(TenantKey::new("abc"));
        handle.attach(subscriber).expect("attach");
        wait_for_state(&handle, SupervisorState::Connected).await;

        let mut feed = mock.take_feed().await;
        feed.send(tap_message("v", 3)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut watch = handle.watch();
        handle.deactivate().await.expect("deactivate");

        let mut saw_tap = false;
        let mut saw_deactivated = false;
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Event(json) => {
                    let value: Value = serde_json::from_str(&json).expect("json");
                    saw_tap |= value["type"] == "tap" && value["likes"] == 3;
                    saw_deactivated |= value["state"] == "deactivated";
                }
                Outbound::Close { .. } => break,
                Outbound::Ping => {}
            }
        }
        assert!(saw_tap, "open tap window should be flushed");
        assert!(saw_deactivated);
        assert_eq!(watch.borrow_and_update().state, SupervisorState::Deactivated);
        feed.cancelled().await;
    }
}
