use serde::Serialize;

use crate::endpoint::SwitchState;
use crate::types::{ApnType, EndpointId, Epoch, RequestId};

/// Monotonic counters, reset only on restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub passes: u64,
    pub attaches_issued: u64,
    pub detaches_issued: u64,
    pub stale_confirmations: u64,
    pub radio_errors: u64,
    pub invariant_violations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub id: EndpointId,
    pub state: SwitchState,
    pub epoch: Epoch,
    pub detaching: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub id: RequestId,
    pub apn: ApnType,
    pub target: EndpointId,
    pub priority: i32,
    pub executed_on: Option<EndpointId>,
}

/// Point-in-time view of the arbiter, published after every handled event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterSnapshot {
    pub active: Option<EndpointId>,
    pub allowed: bool,
    pub default_endpoint: Option<EndpointId>,
    pub endpoints: Vec<EndpointStatus>,
    /// In scan order (target endpoint, then admission order).
    pub requests: Vec<RequestStatus>,
    pub deferred: usize,
    pub stats: ArbiterStats,
}

impl ArbiterSnapshot {
    pub fn request(&self, id: RequestId) -> Option<&RequestStatus> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn is_executed(&self, id: RequestId) -> bool {
        self.request(id).is_some_and(|r| r.executed_on.is_some())
    }

    pub fn non_idle_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.state != SwitchState::Idle)
            .count()
    }
}
