//! Collaborator capabilities consumed by the arbiter.
//!
//! The arbiter owns boxed implementations of these traits and calls them only
//! from its worker thread. None of the calls may block on radio or network
//! I/O.

use crate::types::{ApnType, EndpointId};

/// Per-endpoint APN ref-counting. Reaching zero on an APN tears down the
/// underlying data call; that is the collaborator's business.
pub trait LogicalChannel: Send {
    fn inc_ref_count(&mut self, endpoint: EndpointId, apn: ApnType);

    fn dec_ref_count(&mut self, endpoint: EndpointId, apn: ApnType);

    fn is_apn_supported(&self, endpoint: EndpointId, apn: ApnType) -> bool;

    /// Priority used for requests that carry none of their own.
    fn priority_of(&self, apn: ApnType) -> i32;
}

pub trait DefaultDataResolver: Send {
    fn current_default_endpoint(&self) -> EndpointId;
}

/// Subscription-to-endpoint ownership and readiness.
pub trait SubscriptionDirectory: Send {
    fn is_ready(&self, endpoint: EndpointId) -> bool;

    fn endpoint_for_subscription(&self, subscription: u32) -> Option<EndpointId>;
}

/// Persisted "last known attach target".
pub trait AttachTargetStore: Send {
    fn load(&self) -> anyhow::Result<Option<EndpointId>>;

    fn store(&mut self, endpoint: EndpointId) -> anyhow::Result<()>;
}

/// Everything the arbiter talks to besides the radios.
pub struct Collaborators {
    pub channel: Box<dyn LogicalChannel>,
    pub default_data: Box<dyn DefaultDataResolver>,
    pub subscriptions: Box<dyn SubscriptionDirectory>,
    pub store: Box<dyn AttachTargetStore>,
}
