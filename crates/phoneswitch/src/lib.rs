//! Cellular data-connection arbiter for devices with several radio
//! endpoints that may only hold one data session at a time.
//!
//! The [`arbiter::Arbiter`] is a deterministic state machine fed by
//! [`arbiter::ArbiterEvent`]s; [`runtime::ArbiterRuntime`] runs it on a
//! worker thread behind a bounded queue.

pub mod arbiter;
pub mod collab;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod persist;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod test_util;
pub mod types;

pub use arbiter::{Arbiter, ArbiterEvent, ArbiterNotice, ArbiterSnapshot};
pub use config::ArbiterConfig;
pub use error::{AdmissionError, RadioError, RegistryError};
pub use runtime::{ArbiterHandle, ArbiterRuntime, EventQueue};
pub use types::{ApnType, Capability, EndpointId, NetworkRequest, RequestId, Specifier};
