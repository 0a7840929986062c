use thiserror::Error;

use crate::types::{EndpointId, RequestId};

// ── Errors ──────────────────────────────────────────────────────────

/// Rejection of a request at the admission boundary. A rejected request
/// never enters the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("duplicate request {0}")]
    DuplicateRequest(RequestId),
    #[error("invalid specifier '{0}'")]
    InvalidSpecifier(String),
    #[error("unsupported APN for {id}: {reason}")]
    UnsupportedApn { id: RequestId, reason: String },
    #[error("arbiter is shut down")]
    ArbiterClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
}

/// A radio command that never reached the modem. Always transient: the next
/// arbiter pass retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("command channel for {0} is not connected")]
    ChannelDown(EndpointId),
    #[error("radio {endpoint} rejected command: {reason}")]
    Rejected { endpoint: EndpointId, reason: String },
}
