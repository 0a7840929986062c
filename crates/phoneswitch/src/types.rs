//! Identifiers and request values shared by every arbiter component.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// Stable index of one physical radio, `0..N-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub usize);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Caller-assigned request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Per-endpoint command sequence number. Every attach or detach issued to a
/// radio carries a fresh epoch; confirmations quoting an older one are stale.
pub type Epoch = u64;

/// Logical APN type. Each one has an independent ref-count per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApnType {
    Default,
    Mms,
    Supl,
    Dun,
    Fota,
    Ims,
    Cbs,
    Ia,
    Emergency,
    Xcap,
    Mcx,
}

impl ApnType {
    pub const ALL: [ApnType; 11] = [
        ApnType::Default,
        ApnType::Mms,
        ApnType::Supl,
        ApnType::Dun,
        ApnType::Fota,
        ApnType::Ims,
        ApnType::Cbs,
        ApnType::Ia,
        ApnType::Emergency,
        ApnType::Xcap,
        ApnType::Mcx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApnType::Default => "default",
            ApnType::Mms => "mms",
            ApnType::Supl => "supl",
            ApnType::Dun => "dun",
            ApnType::Fota => "fota",
            ApnType::Ims => "ims",
            ApnType::Cbs => "cbs",
            ApnType::Ia => "ia",
            ApnType::Emergency => "emergency",
            ApnType::Xcap => "xcap",
            ApnType::Mcx => "mcx",
        }
    }
}

impl fmt::Display for ApnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ApnType::ALL
            .iter()
            .copied()
            .find(|apn| apn.as_str() == needle)
            .ok_or_else(|| format!("unknown APN type '{}'", s))
    }
}

/// Network capability tag carried by a request.
///
/// Qualifier capabilities (`NotRestricted`, `Trusted`, `NotVpn`) do not select
/// an APN and may be combined freely with exactly one APN-bearing capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Internet,
    Mms,
    Supl,
    Dun,
    Fota,
    Ims,
    Cbs,
    Ia,
    Eims,
    Xcap,
    Mcx,
    NotRestricted,
    Trusted,
    NotVpn,
}

impl Capability {
    /// APN type this capability is served by, if any.
    pub fn apn_type(&self) -> Option<ApnType> {
        match self {
            Capability::Internet => Some(ApnType::Default),
            Capability::Mms => Some(ApnType::Mms),
            Capability::Supl => Some(ApnType::Supl),
            Capability::Dun => Some(ApnType::Dun),
            Capability::Fota => Some(ApnType::Fota),
            Capability::Ims => Some(ApnType::Ims),
            Capability::Cbs => Some(ApnType::Cbs),
            Capability::Ia => Some(ApnType::Ia),
            Capability::Eims => Some(ApnType::Emergency),
            Capability::Xcap => Some(ApnType::Xcap),
            Capability::Mcx => Some(ApnType::Mcx),
            Capability::NotRestricted | Capability::Trusted | Capability::NotVpn => None,
        }
    }
}

/// Pins a request to one endpoint, either directly or through the
/// subscription currently installed in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specifier {
    Endpoint(EndpointId),
    Subscription(u32),
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Specifier::Endpoint(ep) => write!(f, "endpoint:{}", ep.0),
            Specifier::Subscription(sub) => write!(f, "sub:{}", sub),
        }
    }
}

impl FromStr for Specifier {
    type Err = AdmissionError;

    /// Accepts `endpoint:N`, `sub:N`, or a bare subscription id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || AdmissionError::InvalidSpecifier(s.to_string());
        if let Some(rest) = s.strip_prefix("endpoint:") {
            let idx = rest.trim().parse::<usize>().map_err(|_| invalid())?;
            return Ok(Specifier::Endpoint(EndpointId(idx)));
        }
        let sub = s.strip_prefix("sub:").unwrap_or(s);
        sub.trim()
            .parse::<u32>()
            .map(Specifier::Subscription)
            .map_err(|_| invalid())
    }
}

/// An application's demand for cellular connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub id: RequestId,
    pub capabilities: BTreeSet<Capability>,
    pub specifier: Option<Specifier>,
    /// Explicit priority; when absent the APN's configured priority applies.
    pub priority: Option<i32>,
}

impl NetworkRequest {
    pub fn new(id: u64) -> Self {
        Self {
            id: RequestId(id),
            capabilities: BTreeSet::new(),
            specifier: None,
            priority: None,
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn with_specifier(mut self, specifier: Specifier) -> Self {
        self.specifier = Some(specifier);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The single APN type this request asks for.
    ///
    /// Zero or several distinct APN types is a caller error.
    pub fn apn_type(&self) -> Result<ApnType, AdmissionError> {
        let apns: BTreeSet<ApnType> = self
            .capabilities
            .iter()
            .filter_map(Capability::apn_type)
            .collect();
        let mut iter = apns.iter();
        match (iter.next(), iter.next()) {
            (Some(apn), None) => Ok(*apn),
            (None, _) => Err(AdmissionError::UnsupportedApn {
                id: self.id,
                reason: "no capability maps to an APN type".into(),
            }),
            (Some(_), Some(_)) => Err(AdmissionError::UnsupportedApn {
                id: self.id,
                reason: format!("capabilities map to {} APN types", apns.len()),
            }),
        }
    }
}
