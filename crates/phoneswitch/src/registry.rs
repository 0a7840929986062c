//! Admitted requests and priority selection.

use std::collections::HashMap;

use crate::collab::SubscriptionDirectory;
use crate::error::{AdmissionError, RegistryError};
use crate::types::{ApnType, EndpointId, NetworkRequest, RequestId, Specifier};

/// One admitted request plus the arbiter's bookkeeping for it.
#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub request: NetworkRequest,
    pub apn: ApnType,
    pub priority: i32,
    /// Endpoint the request currently resolves to.
    pub target: EndpointId,
    /// Endpoint whose APN ref-count this request holds, if executed.
    pub executed_on: Option<EndpointId>,
    /// Set once the "APN unsupported" warning has been logged.
    pub unsupported_reported: bool,
    seq: u64,
}

impl RequestEntry {
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn is_executed(&self) -> bool {
        self.executed_on.is_some()
    }

    /// Follows the default-data endpoint rather than a specifier.
    pub fn is_default_routed(&self) -> bool {
        self.request.specifier.is_none()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: HashMap<RequestId, RequestEntry>,
    next_seq: u64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        request: NetworkRequest,
        apn: ApnType,
        priority: i32,
        target: EndpointId,
    ) -> Result<&RequestEntry, AdmissionError> {
        let id = request.id;
        if self.entries.contains_key(&id) {
            return Err(AdmissionError::DuplicateRequest(id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = self.entries.entry(id).or_insert(RequestEntry {
            request,
            apn,
            priority,
            target,
            executed_on: None,
            unsupported_reported: false,
            seq,
        });
        Ok(entry)
    }

    pub fn remove(&mut self, id: RequestId) -> Result<RequestEntry, RegistryError> {
        self.entries
            .remove(&id)
            .ok_or(RegistryError::UnknownRequest(id))
    }

    pub fn get(&self, id: RequestId) -> Option<&RequestEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut RequestEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in scan order: ascending target endpoint, then admission order.
    pub fn ordered(&self) -> Vec<&RequestEntry> {
        let mut out: Vec<&RequestEntry> = self.entries.values().collect();
        out.sort_by_key(|e| (e.target, e.seq));
        out
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RequestEntry> {
        self.entries.values_mut()
    }

    /// Map a request to the endpoint it should run on.
    ///
    /// Pinned requests go through subscription ownership; everything else
    /// follows the default-data endpoint.
    pub fn resolve_target_endpoint(
        request: &NetworkRequest,
        directory: &dyn SubscriptionDirectory,
        default_endpoint: EndpointId,
        endpoint_count: usize,
    ) -> Result<EndpointId, AdmissionError> {
        match request.specifier {
            None => Ok(default_endpoint),
            Some(Specifier::Endpoint(ep)) => {
                if ep.0 < endpoint_count {
                    Ok(ep)
                } else {
                    Err(AdmissionError::InvalidSpecifier(
                        Specifier::Endpoint(ep).to_string(),
                    ))
                }
            }
            Some(spec @ Specifier::Subscription(sub)) => directory
                .endpoint_for_subscription(sub)
                .filter(|ep| ep.0 < endpoint_count)
                .ok_or_else(|| AdmissionError::InvalidSpecifier(spec.to_string())),
        }
    }

    /// Endpoint of the highest-priority eligible request.
    ///
    /// Ties go to the first entry in scan order. With no eligible request the
    /// fallback is returned.
    pub fn top_priority_endpoint<F>(&self, eligible: F, fallback: EndpointId) -> EndpointId
    where
        F: Fn(&RequestEntry) -> bool,
    {
        let mut best: Option<&RequestEntry> = None;
        for entry in self.ordered() {
            if !eligible(entry) {
                continue;
            }
            match best {
                Some(b) if entry.priority <= b.priority => {}
                _ => best = Some(entry),
            }
        }
        best.map(|e| e.target).unwrap_or(fallback)
    }
}
