// Overlay wire protocol: JSON text frames pushed to subscribers.

pub mod event;
pub mod status;

pub use event::{EventBody, EventKind, LiveEvent, Participant};
pub use status::{PauseReason, StatusReport, SupervisorState, TransportMode};
