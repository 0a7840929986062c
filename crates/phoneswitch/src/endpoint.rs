//! # Endpoint Switch
//!
//! Per-radio data session state machine:
//!
//! ```text
//!          connect              attach confirmed
//!   IDLE ───────────▶ ATTACHING ─────────────────▶ ATTACHED
//!    ▲                    │                            │
//!    └──────── detach confirmed ◀── disconnect_all ────┘
//! ```
//!
//! Commands are fire-and-forget: the radio reports completion later and the
//! arbiter feeds it back through [`EndpointSwitch::on_attached`] and
//! [`EndpointSwitch::on_detached`]. Every command carries a fresh epoch so a
//! confirmation for a superseded command is recognised and dropped.
//!
//! The state exposed here is only ever updated by confirmations; a detach in
//! flight leaves the endpoint non-idle until the radio acknowledges it.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::error::RadioError;
use crate::types::{EndpointId, Epoch, RequestId};

/// Command side of one physical radio.
///
/// Implementations must not block on radio I/O: `attach`/`detach` queue the
/// command and return. Completion is reported asynchronously by posting
/// `AttachConfirmed`/`DetachConfirmed` with the same epoch.
pub trait RadioEndpoint: Send {
    fn attach(&mut self, epoch: Epoch) -> Result<(), RadioError>;

    fn detach(&mut self, epoch: Epoch) -> Result<(), RadioError>;

    /// Whether the radio currently holds no data session, if known.
    /// Consulted once at startup to seed the cached state.
    fn query_idle(&self) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    Idle,
    Attaching,
    Attached,
}

pub struct EndpointSwitch {
    id: EndpointId,
    radio: Box<dyn RadioEndpoint>,
    state: SwitchState,
    epoch: Epoch,
    detach_pending: bool,
    requests: BTreeSet<RequestId>,
}

impl EndpointSwitch {
    pub fn new(id: EndpointId, radio: Box<dyn RadioEndpoint>) -> Self {
        let state = match radio.query_idle() {
            Some(false) => SwitchState::Attached,
            _ => SwitchState::Idle,
        };
        EndpointSwitch {
            id,
            radio,
            state,
            epoch: 0,
            detach_pending: false,
            requests: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Last confirmed state is IDLE.
    pub fn is_idle(&self) -> bool {
        self.state == SwitchState::Idle
    }

    /// A detach was issued and is not confirmed yet.
    pub fn is_detaching(&self) -> bool {
        self.detach_pending
    }

    /// Requests currently associated with this endpoint's session.
    pub fn requests(&self) -> &BTreeSet<RequestId> {
        &self.requests
    }

    pub fn dissociate(&mut self, request: RequestId) {
        self.requests.remove(&request);
    }

    /// Bring the data session up, or keep it up.
    ///
    /// Returns the epoch of the attach command if one was issued, `None` if
    /// the session was already up or coming up.
    pub fn connect(&mut self, request: Option<RequestId>) -> Result<Option<Epoch>, RadioError> {
        let issued = if self.state == SwitchState::Idle || self.detach_pending {
            let epoch = self.epoch + 1;
            self.radio.attach(epoch)?;
            self.epoch = epoch;
            self.state = SwitchState::Attaching;
            self.detach_pending = false;
            debug!(endpoint = %self.id, epoch, "attach command queued");
            Some(epoch)
        } else {
            None
        };
        if let Some(req) = request {
            self.requests.insert(req);
        }
        Ok(issued)
    }

    /// Tear the data session down.
    ///
    /// Returns the epoch of the detach command if one was issued, `None` if
    /// the endpoint was idle or a detach is already in flight.
    pub fn disconnect_all(&mut self) -> Result<Option<Epoch>, RadioError> {
        self.requests.clear();
        if self.state == SwitchState::Idle || self.detach_pending {
            return Ok(None);
        }
        let epoch = self.epoch + 1;
        self.radio.detach(epoch)?;
        self.epoch = epoch;
        self.detach_pending = true;
        debug!(endpoint = %self.id, epoch, "detach command queued");
        Ok(Some(epoch))
    }

    /// Apply an attach confirmation. Returns `false` if it was stale.
    pub fn on_attached(&mut self, epoch: Epoch) -> bool {
        if epoch != self.epoch || self.detach_pending || self.state != SwitchState::Attaching {
            return false;
        }
        self.state = SwitchState::Attached;
        true
    }

    /// Apply a detach confirmation, solicited or not. Returns `false` if it
    /// was stale.
    pub fn on_detached(&mut self, epoch: Epoch) -> bool {
        if epoch != self.epoch || self.state == SwitchState::Idle {
            return false;
        }
        self.state = SwitchState::Idle;
        self.detach_pending = false;
        self.requests.clear();
        true
    }
}

impl std::fmt::Debug for EndpointSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSwitch")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("detach_pending", &self.detach_pending)
            .field("requests", &self.requests)
            .finish()
    }
}
