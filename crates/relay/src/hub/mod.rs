// Per-tenant subscriber set.
//
// The hub is owned by its tenant's supervisor task, so every mutation is
// already serialized per tenant and needs no locking. Each subscriber is a
// bounded outbound queue drained by its socket task; a subscriber whose
// queue is full or closed counts as dead and is dropped, which also closes
// its socket.

pub mod auth;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tapcast_common::protocol::LiveEvent;
use tapcast_common::tenant::TenantKey;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound queue depth per subscriber socket.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Frame queued for one subscriber socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized event, shared by every subscriber of the broadcast.
    Event(Arc<str>),
    Ping,
    Close { reason: String },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    Backpressure,
    #[error("subscriber socket is closed")]
    Closed,
}

/// Ping/pong bookkeeping shared between the hub and the socket task.
#[derive(Debug)]
pub struct Liveness {
    awaiting_ack: AtomicBool,
    last_ack: Mutex<Instant>,
}

impl Liveness {
    fn new(now: Instant) -> Self {
        Self { awaiting_ack: AtomicBool::new(false), last_ack: Mutex::new(now) }
    }

    /// Record a pong (or any inbound frame proving the peer is alive).
    pub fn acknowledge(&self) {
        self.awaiting_ack.store(false, Ordering::SeqCst);
        if let Ok(mut last) = self.last_ack.lock() {
            *last = Instant::now();
        }
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack.lock().ok().map(|last| *last)
    }

    /// Arm the next check. Returns false if the previous ping was never
    /// acknowledged.
    fn arm(&self) -> bool {
        !self.awaiting_ack.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    id: Uuid,
    tenant_key: TenantKey,
    outbound: mpsc::Sender<Outbound>,
    liveness: Arc<Liveness>,
}

impl Subscriber {
    /// New subscriber plus the receiving end its socket task drains.
    pub fn new(tenant_key: TenantKey) -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(tenant_key, SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        tenant_key: TenantKey,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let subscriber = Self {
            id: Uuid::new_v4(),
            tenant_key,
            outbound,
            liveness: Arc::new(Liveness::new(Instant::now())),
        };
        (subscriber, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant_key(&self) -> &TenantKey {
        &self.tenant_key
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    pub fn deliver(&self, frame: Outbound) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Change in subscriber count relevant to the upstream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    FirstSubscriber,
    BecameEmpty,
    Unchanged,
}

/// Result of a broadcast or a liveness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub removed: Vec<Uuid>,
    pub occupancy: Occupancy,
}

#[derive(Debug)]
pub struct SubscriberHub {
    tenant_key: TenantKey,
    subscribers: HashMap<Uuid, Subscriber>,
}

impl SubscriberHub {
    pub fn new(tenant_key: TenantKey) -> Self {
        Self { tenant_key, subscribers: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Register an authenticated subscriber. Re-attaching the same id is a
    /// no-op for occupancy.
    pub fn attach(&mut self, subscriber: Subscriber) -> Occupancy {
        let was_empty = self.subscribers.is_empty();
        self.subscribers.insert(subscriber.id, subscriber);
        if was_empty {
            Occupancy::FirstSubscriber
        } else {
            Occupancy::Unchanged
        }
    }

    pub fn detach(&mut self, id: Uuid) -> Occupancy {
        if self.subscribers.remove(&id).is_none() {
            return Occupancy::Unchanged;
        }
        self.occupancy_after_removal()
    }

    /// Serialize once and queue to every subscriber. Subscribers that cannot
    /// take the frame are removed.
    pub fn broadcast(&mut self, event: &LiveEvent) -> FanoutReport {
        if self.subscribers.is_empty() {
            return FanoutReport { delivered: 0, removed: Vec::new(), occupancy: Occupancy::Unchanged };
        }

        let payload: Arc<str> = match event.to_json() {
            Ok(encoded) => Arc::from(encoded),
            Err(error) => {
                warn!(tenant = %self.tenant_key.redacted(), error = %error, "failed to encode event");
                return FanoutReport {
                    delivered: 0,
                    removed: Vec::new(),
                    occupancy: Occupancy::Unchanged,
                };
            }
        };

        self.fan_out(|_| Outbound::Event(Arc::clone(&payload)), false)
    }

    /// Liveness sweep: evict subscribers that did not acknowledge the last
    /// ping, then ping the rest.
    pub fn sweep(&mut self) -> FanoutReport {
        self.fan_out(|_| Outbound::Ping, true)
    }

    /// Queue a close frame to everyone and drop the set.
    pub fn close_all(&mut self, reason: &str) -> usize {
        let count = self.subscribers.len();
        for subscriber in self.subscribers.values() {
            let _ = subscriber.deliver(Outbound::Close { reason: reason.to_string() });
        }
        self.subscribers.clear();
        count
    }

    fn fan_out<F>(&mut self, frame: F, check_liveness: bool) -> FanoutReport
    where
        F: Fn(&Subscriber) -> Outbound,
    {
        let was_empty = self.subscribers.is_empty();
        let mut delivered = 0;
        let mut removed = Vec::new();

        for subscriber in self.subscribers.values() {
            if check_liveness && !subscriber.liveness.arm() {
                debug!(tenant = %self.tenant_key.redacted(), subscriber = %subscriber.id, "liveness check failed");
                removed.push(subscriber.id);
                continue;
            }
            match subscriber.deliver(frame(subscriber)) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(
                        tenant = %self.tenant_key.redacted(),
                        subscriber = %subscriber.id,
                        error = %error,
                        "dropping subscriber"
                    );
                    removed.push(subscriber.id);
                }
            }
        }

        for id in &removed {
            self.subscribers.remove(id);
        }

        let occupancy = if !was_empty && !removed.is_empty() {
            self.occupancy_after_removal()
        } else {
            Occupancy::Unchanged
        };
        FanoutReport { delivered, removed, occupancy }
    }

    fn occupancy_after_removal(&self) -> Occupancy {
        if self.subscribers.is_empty() {
            Occupancy::BecameEmpty
        } else {
            Occupancy::Unchanged
        }
    }
}
