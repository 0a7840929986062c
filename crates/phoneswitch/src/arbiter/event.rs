use std::time::Duration;

use crate::types::{EndpointId, Epoch, NetworkRequest, RequestId};

/// Everything that can make the arbiter re-run. Processed strictly in
/// arrival order by a single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterEvent {
    RequestAdded(NetworkRequest),
    RequestRemoved(RequestId),
    AttachConfirmed {
        endpoint: EndpointId,
        epoch: Epoch,
    },
    DetachConfirmed {
        endpoint: EndpointId,
        epoch: Epoch,
    },
    AllowedChanged {
        endpoint_hint: Option<EndpointId>,
        allowed: bool,
        timeout: Duration,
    },
    /// The default-data endpoint setting changed; the resolver holds the new
    /// value.
    SettingsChanged,
    SubscriptionReady(EndpointId),
    /// The endpoint's subscription went away (SIM removed or swapped).
    TopologyInvalidated(EndpointId),
}

/// Outbound notifications for collaborators and observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterNotice {
    DataAttached(EndpointId),
    DataDetached(EndpointId),
    SwitchStateChanged { active: Option<EndpointId> },
    RequestExecuted { id: RequestId, endpoint: EndpointId },
    RequestReleased { id: RequestId },
    RequestRejected { id: RequestId, reason: String },
}
