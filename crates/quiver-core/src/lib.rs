//! Quiver Core - shared foundation for the performance control plane
//!
//! Every control-plane crate builds on the three surfaces defined here:
//! the common error enum, the control event bus, and the logical
//! request/response types that flow between the balancer, the streaming
//! layer, and the experiment framework.

pub mod errors;
pub mod events;
pub mod request;

pub use errors::{ControlError, Result};
pub use events::{ControlEvent, EventBus, EventSink};
pub use request::{BackendResponse, SearchRequest};
