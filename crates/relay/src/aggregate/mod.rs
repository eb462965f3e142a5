// Per-session event coalescing.
//
// Burst-prone kinds (taps) are merged inside a fixed window: the first event
// of the window opens it and supplies the display attributes, later events
// only add to the running count. The window timer is armed once and is not
// extended by later events. Every other kind passes straight through.

use std::collections::HashMap;
use std::time::Duration;

use tapcast_common::protocol::{EventBody, EventKind, LiveEvent};
use tokio::time::Instant;

/// Default coalescing window.
const DEFAULT_WINDOW_MS: u64 = 1_000;
/// Minimum allowed coalescing window.
const MIN_WINDOW_MS: u64 = 100;
/// Maximum allowed coalescing window.
const MAX_WINDOW_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub window: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(DEFAULT_WINDOW_MS) }
    }
}

impl AggregatorConfig {
    /// Create a config with the given window in milliseconds, clamped to [100, 10000].
    pub fn with_millis(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_WINDOW_MS, MAX_WINDOW_MS);
        Self { window: Duration::from_millis(clamped) }
    }
}

/// What happened to an observed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Deliver now.
    Forward(LiveEvent),
    /// Held in an open window until its flush.
    Absorbed,
}

/// In-flight accumulator for one kind.
#[derive(Debug)]
struct AggregationWindow {
    accumulated: u64,
    representative: LiveEvent,
    deadline: Instant,
}

impl AggregationWindow {
    fn into_event(self) -> LiveEvent {
        let mut event = self.representative;
        event.body = EventBody::Tap { count: self.accumulated };
        event
    }
}

#[derive(Debug)]
pub struct EventAggregator {
    config: AggregatorConfig,
    windows: HashMap<EventKind, AggregationWindow>,
}

impl EventAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config, windows: HashMap::new() }
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    pub fn observe(&mut self, event: LiveEvent) -> Observation {
        self.observe_at(event, Instant::now())
    }

    pub fn observe_at(&mut self, event: LiveEvent, now: Instant) -> Observation {
        match event.kind() {
            EventKind::Tap => {
                let count = event.tap_count().unwrap_or(0);
                match self.windows.get_mut(&EventKind::Tap) {
                    Some(window) => {
                        window.accumulated = window.accumulated.saturating_add(count);
                    }
                    None => {
                        self.windows.insert(
                            EventKind::Tap,
                            AggregationWindow {
                                accumulated: count,
                                representative: event,
                                deadline: now + self.config.window,
                            },
                        );
                    }
                }
                Observation::Absorbed
            }
            EventKind::Follow | EventKind::Gift | EventKind::Status | EventKind::Raw => {
                Observation::Forward(event)
            }
        }
    }

    /// Flush every window whose timer has fired.
    pub fn drain_ready(&mut self) -> Vec<LiveEvent> {
        self.drain_ready_at(Instant::now())
    }

    pub fn drain_ready_at(&mut self, now: Instant) -> Vec<LiveEvent> {
        let ready: Vec<EventKind> = self
            .windows
            .iter()
            .filter(|(_, window)| window.deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();

        ready
            .into_iter()
            .filter_map(|kind| self.windows.remove(&kind))
            .map(AggregationWindow::into_event)
            .collect()
    }

    /// Flush every open window regardless of its timer. Used when the
    /// session pauses or is deactivated so counted engagement is not lost.
    pub fn flush_all(&mut self) -> Vec<LiveEvent> {
        self.windows.drain().map(|(_, window)| window.into_event()).collect()
    }

    /// Earliest flush deadline among open windows.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.windows.values().map(|window| window.deadline).min()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }
}
