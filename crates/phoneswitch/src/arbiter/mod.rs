//! # Arbiter
//!
//! Decides which endpoint holds the single cellular data session and which
//! requests are executed on it. The arbiter is a plain synchronous state
//! machine: every input arrives as an [`ArbiterEvent`] and is followed by a
//! pass over the whole state. Time is injected, so the same code runs under
//! the worker thread in [`crate::runtime`] and in deterministic tests.
//!
//! A pass:
//!
//! 1. picks the target endpoint of the highest-priority executable request
//!    (or the last attach target when there is none),
//! 2. if data is disallowed, detaches every non-idle endpoint,
//! 3. if any endpoint other than the target is non-idle, detaches it and
//!    waits for the confirmation before attaching anything,
//! 4. otherwise attaches the target as needed and executes every pending
//!    request that resolves to it.
//!
//! Invariants after every settled pass:
//! - at most one endpoint is non-idle;
//! - a request holds an APN ref-count iff data is allowed and its resolved
//!   endpoint is the active one.

mod event;
mod settings;
mod snapshot;

pub use event::{ArbiterEvent, ArbiterNotice};
pub use snapshot::{ArbiterSnapshot, ArbiterStats, EndpointStatus, RequestStatus};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::collab::Collaborators;
use crate::config::ArbiterConfig;
use crate::endpoint::{EndpointSwitch, RadioEndpoint};
use crate::error::{AdmissionError, RegistryError};
use crate::policy::PolicyGate;
use crate::registry::{RequestEntry, RequestRegistry};
use crate::types::{ApnType, EndpointId, Epoch, NetworkRequest, RequestId, Specifier};

/// Stateless admission checks shared by the arbiter and its handles.
pub fn validate(request: &NetworkRequest, endpoint_count: usize) -> Result<ApnType, AdmissionError> {
    let apn = request.apn_type()?;
    if let Some(Specifier::Endpoint(ep)) = request.specifier {
        if ep.0 >= endpoint_count {
            return Err(AdmissionError::InvalidSpecifier(
                Specifier::Endpoint(ep).to_string(),
            ));
        }
    }
    Ok(apn)
}

/// Request ids currently claimed by callers (queued, registered or deferred).
///
/// Shared between the arbiter and its handles so duplicates are refused
/// synchronously, before the request is queued. A release through a handle
/// frees the id at once and is counted as pending until the worker reaches
/// the matching `RequestRemoved`; while any release of an id is pending the
/// worker leaves that id's claim alone, since it belongs to a later request.
#[derive(Debug, Clone, Default)]
pub struct Admissions {
    inner: Arc<Mutex<AdmissionLedger>>,
}

#[derive(Debug, Default)]
struct AdmissionLedger {
    ids: HashSet<RequestId>,
    releasing: HashMap<RequestId, usize>,
}

impl AdmissionLedger {
    fn is_releasing(&self, id: RequestId) -> bool {
        self.releasing.contains_key(&id)
    }
}

impl Admissions {
    fn ledger(&self) -> MutexGuard<'_, AdmissionLedger> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim an id for a new request. Returns `false` if it is already claimed.
    pub fn try_admit(&self, id: RequestId) -> bool {
        self.ledger().ids.insert(id)
    }

    /// Drop a claim outright, e.g. when the request could not be queued.
    pub fn release(&self, id: RequestId) {
        self.ledger().ids.remove(&id);
    }

    /// Caller-side release: frees the id now and records that a
    /// `RequestRemoved` for it is on its way to the worker.
    pub fn begin_release(&self, id: RequestId) {
        let mut ledger = self.ledger();
        ledger.ids.remove(&id);
        *ledger.releasing.entry(id).or_default() += 1;
    }

    /// Undo [`Admissions::begin_release`] when the removal never got queued.
    pub fn abort_release(&self, id: RequestId) {
        self.complete_pending(id);
    }

    /// Worker-side half of a caller release. Without a pending release the
    /// removal came straight to the arbiter and the claim is dropped here.
    pub fn complete_release(&self, id: RequestId) {
        if !self.complete_pending(id) {
            self.ledger().ids.remove(&id);
        }
    }

    /// Record an admission made by the worker, unless the caller has already
    /// released this id.
    pub fn note_admitted(&self, id: RequestId) {
        let mut ledger = self.ledger();
        if !ledger.is_releasing(id) {
            ledger.ids.insert(id);
        }
    }

    /// Worker-initiated drop (rejection, invalidation). Leaves the claim of a
    /// newer request with the same id untouched.
    pub fn release_unclaimed(&self, id: RequestId) {
        let mut ledger = self.ledger();
        if !ledger.is_releasing(id) {
            ledger.ids.remove(&id);
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.ledger().ids.contains(&id)
    }

    pub fn pending_releases(&self, id: RequestId) -> usize {
        self.ledger().releasing.get(&id).copied().unwrap_or(0)
    }

    fn claimed(&self) -> Vec<RequestId> {
        self.ledger().ids.iter().copied().collect()
    }

    fn complete_pending(&self, id: RequestId) -> bool {
        let mut ledger = self.ledger();
        let Some(count) = ledger.releasing.get_mut(&id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            ledger.releasing.remove(&id);
        }
        true
    }
}

pub struct Arbiter {
    config: ArbiterConfig,
    endpoint_count: usize,
    registry: RequestRegistry,
    switches: BTreeMap<EndpointId, EndpointSwitch>,
    policy: PolicyGate,
    deferred: BTreeMap<EndpointId, Vec<NetworkRequest>>,
    collab: Collaborators,
    default_endpoint: EndpointId,
    fallback_target: EndpointId,
    last_active: Option<EndpointId>,
    retry_at: Option<Instant>,
    admissions: Admissions,
    subscribers: Vec<Sender<ArbiterNotice>>,
    stats: ArbiterStats,
}

impl Arbiter {
    /// Build an arbiter over the discovered radios, endpoint `i` being
    /// `radios[i]`.
    pub fn new(
        config: ArbiterConfig,
        radios: Vec<Box<dyn RadioEndpoint>>,
        collab: Collaborators,
    ) -> anyhow::Result<Self> {
        if radios.is_empty() {
            anyhow::bail!("at least one radio endpoint is required");
        }
        if radios.len() != config.endpoint_count {
            warn!(
                configured = config.endpoint_count,
                discovered = radios.len(),
                "endpoint count differs from config, using discovered radios"
            );
        }
        let endpoint_count = radios.len();
        let switches: BTreeMap<EndpointId, EndpointSwitch> = radios
            .into_iter()
            .enumerate()
            .map(|(idx, radio)| (EndpointId(idx), EndpointSwitch::new(EndpointId(idx), radio)))
            .collect();

        let fallback_target = match collab.store.load() {
            Ok(Some(ep)) if ep.0 < endpoint_count => ep,
            Ok(Some(ep)) => {
                warn!(endpoint = %ep, "persisted attach target out of range, ignoring");
                EndpointId(0)
            }
            Ok(None) => EndpointId(0),
            Err(e) => {
                warn!(error = %e, "failed to load persisted attach target");
                EndpointId(0)
            }
        };

        let reported = collab.default_data.current_default_endpoint();
        let default_endpoint = if reported.0 < endpoint_count {
            reported
        } else {
            warn!(endpoint = %reported, "default data endpoint out of range, using ep0");
            EndpointId(0)
        };

        Ok(Arbiter {
            config,
            endpoint_count,
            registry: RequestRegistry::new(),
            switches,
            policy: PolicyGate::new(),
            deferred: BTreeMap::new(),
            collab,
            default_endpoint,
            fallback_target,
            last_active: None,
            retry_at: None,
            admissions: Admissions::default(),
            subscribers: Vec::new(),
            stats: ArbiterStats::default(),
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn switch(&self, endpoint: EndpointId) -> Option<&EndpointSwitch> {
        self.switches.get(&endpoint)
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.policy
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    pub fn default_endpoint(&self) -> EndpointId {
        self.default_endpoint
    }

    pub fn fallback_target(&self) -> EndpointId {
        self.fallback_target
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.values().map(Vec::len).sum()
    }

    pub fn admissions(&self) -> Admissions {
        self.admissions.clone()
    }

    /// Adopt a ledger created ahead of the arbiter (by the event queue),
    /// carrying over anything already admitted.
    pub fn share_admissions(&mut self, shared: Admissions) {
        for id in self.admissions.claimed() {
            shared.try_admit(id);
        }
        self.admissions = shared;
    }

    pub fn subscribe(&mut self) -> Receiver<ArbiterNotice> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn add_subscriber(&mut self, tx: Sender<ArbiterNotice>) {
        self.subscribers.push(tx);
    }

    /// The endpoint holding the data session. A live session wins over one
    /// that is being detached.
    pub fn active_endpoint(&self) -> Option<EndpointId> {
        let mut draining = None;
        for sw in self.switches.values() {
            if sw.is_idle() {
                continue;
            }
            if !sw.is_detaching() {
                return Some(sw.id());
            }
            draining.get_or_insert(sw.id());
        }
        draining
    }

    /// Soonest instant at which [`Arbiter::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.policy.deadline(), self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Initial pass at startup.
    pub fn bootstrap(&mut self, now: Instant) {
        info!(
            endpoints = self.endpoint_count,
            default = %self.default_endpoint,
            fallback = %self.fallback_target,
            attach_ahead = self.config.attach_ahead,
            "arbiter starting"
        );
        self.run_pass(now);
    }

    pub fn handle(&mut self, event: ArbiterEvent, now: Instant) {
        debug!(?event, "arbiter event");
        self.policy.poll(now);
        match event {
            ArbiterEvent::RequestAdded(request) => {
                let id = request.id;
                if let Err(err) = self.admit(request) {
                    self.reject(id, err);
                }
            }
            ArbiterEvent::RequestRemoved(id) => {
                // Unknown ids are already logged; releasing twice is harmless.
                let _ = self.release(id);
            }
            ArbiterEvent::AttachConfirmed { endpoint, epoch } => {
                self.on_attach_confirmed(endpoint, epoch);
            }
            ArbiterEvent::DetachConfirmed { endpoint, epoch } => {
                self.on_detach_confirmed(endpoint, epoch);
            }
            ArbiterEvent::AllowedChanged {
                endpoint_hint,
                allowed,
                timeout,
            } => {
                self.policy.set_allowed(endpoint_hint, allowed, timeout, now);
            }
            ArbiterEvent::SettingsChanged => self.on_default_data_changed(),
            ArbiterEvent::SubscriptionReady(endpoint) => self.on_subscription_ready(endpoint),
            ArbiterEvent::TopologyInvalidated(endpoint) => {
                self.on_topology_invalidated(endpoint)
            }
        }
        self.run_pass(now);
    }

    /// Fire due timers: policy re-enable and radio-error retry.
    pub fn tick(&mut self, now: Instant) {
        let mut rerun = self.policy.poll(now);
        if let Some(at) = self.retry_at {
            if now >= at {
                self.retry_at = None;
                debug!("retrying pass after radio error");
                rerun = true;
            }
        }
        if rerun {
            self.run_pass(now);
        }
    }

    /// Admit a request into the registry, or defer it until its endpoint's
    /// subscription is ready.
    pub fn admit(&mut self, request: NetworkRequest) -> Result<(), AdmissionError> {
        let apn = validate(&request, self.endpoint_count)?;
        let id = request.id;
        if self.registry.contains(id) || self.is_deferred(id) {
            return Err(AdmissionError::DuplicateRequest(id));
        }
        let target = RequestRegistry::resolve_target_endpoint(
            &request,
            &*self.collab.subscriptions,
            self.default_endpoint,
            self.endpoint_count,
        )?;

        if request.specifier.is_some() && !self.collab.subscriptions.is_ready(target) {
            info!(request = %id, endpoint = %target, "subscription not ready, deferring request");
            self.deferred.entry(target).or_default().push(request);
            self.admissions.note_admitted(id);
            return Ok(());
        }

        let priority = request
            .priority
            .or_else(|| self.config.apn_priority.get(&apn).copied())
            .unwrap_or_else(|| self.collab.channel.priority_of(apn));
        self.registry.add(request, apn, priority, target)?;
        self.admissions.note_admitted(id);
        info!(request = %id, %apn, priority, endpoint = %target, "request admitted");
        Ok(())
    }

    /// Caller release: drop a request, returning its ref-count if it was
    /// executed. Releasing an unknown id is logged and otherwise ignored.
    pub fn release(&mut self, id: RequestId) -> Result<(), RegistryError> {
        self.admissions.complete_release(id);
        let result = self.drop_request(id);
        if result.is_err() {
            warn!(request = %id, "release of unknown request ignored");
        }
        result
    }

    /// Remove a registered or deferred request without touching its claim.
    fn drop_request(&mut self, id: RequestId) -> Result<(), RegistryError> {
        match self.registry.remove(id) {
            Ok(entry) => {
                if let Some(ep) = entry.executed_on {
                    self.collab.channel.dec_ref_count(ep, entry.apn);
                    if let Some(sw) = self.switches.get_mut(&ep) {
                        sw.dissociate(id);
                    }
                }
                info!(request = %id, executed = entry.executed_on.is_some(), "request released");
                self.notify(ArbiterNotice::RequestReleased { id });
                Ok(())
            }
            Err(err) => {
                if self.take_deferred(id).is_some() {
                    info!(request = %id, "deferred request released");
                    self.notify(ArbiterNotice::RequestReleased { id });
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            active: self.active_endpoint(),
            allowed: self.policy.is_allowed(),
            default_endpoint: Some(self.default_endpoint),
            endpoints: self
                .switches
                .values()
                .map(|sw| EndpointStatus {
                    id: sw.id(),
                    state: sw.state(),
                    epoch: sw.epoch(),
                    detaching: sw.is_detaching(),
                })
                .collect(),
            requests: self
                .registry
                .ordered()
                .into_iter()
                .map(|e| RequestStatus {
                    id: e.id(),
                    apn: e.apn,
                    target: e.target,
                    priority: e.priority,
                    executed_on: e.executed_on,
                })
                .collect(),
            deferred: self.deferred_count(),
            stats: self.stats,
        }
    }

    // ─── Pass ───────────────────────────────────────────────────────────

    fn run_pass(&mut self, now: Instant) {
        self.stats.passes += 1;

        let channel = &self.collab.channel;
        let eligible = |e: &RequestEntry| channel.is_apn_supported(e.target, e.apn);
        let target = self
            .registry
            .top_priority_endpoint(&eligible, self.fallback_target);
        // Requests that can never execute do not hold off attach-ahead.
        let nothing_eligible = !self.registry.ordered().into_iter().any(|e| eligible(e));
        self.check_single_active(target, now);

        let non_idle: Vec<EndpointId> = self
            .switches
            .values()
            .filter(|sw| !sw.is_idle())
            .map(|sw| sw.id())
            .collect();

        if !self.policy.is_allowed() {
            self.unexecute_matching(|e| e.is_executed(), "data disallowed");
            for ep in non_idle {
                self.disconnect(ep, now);
            }
            self.publish_switch_state();
            return;
        }

        self.unexecute_matching(
            |e| e.executed_on.is_some_and(|ep| ep != e.target),
            "request retargeted",
        );

        let others: Vec<EndpointId> = non_idle.iter().copied().filter(|ep| *ep != target).collect();
        if !others.is_empty() {
            // Target waits until every other endpoint confirms its detach.
            debug!(%target, holding = ?others, "preempting active endpoint");
            for ep in others {
                self.disconnect(ep, now);
            }
        } else {
            if non_idle.is_empty() && nothing_eligible && self.config.attach_ahead {
                debug!(%target, "attach-ahead with no requests");
                self.connect(target, None, now);
            }
            self.execute_pending(target, now);
        }

        self.publish_switch_state();
    }

    /// More than one endpoint with a live (not detaching) session breaks the
    /// single-radio rule. Detach all but the selected target.
    fn check_single_active(&mut self, target: EndpointId, now: Instant) {
        let live: Vec<EndpointId> = self
            .switches
            .values()
            .filter(|sw| !sw.is_idle() && !sw.is_detaching())
            .map(|sw| sw.id())
            .collect();
        if live.len() <= 1 {
            return;
        }
        self.stats.invariant_violations += 1;
        let keep = if live.contains(&target) {
            target
        } else {
            live[0]
        };
        error!(
            live = ?live,
            keep = %keep,
            "more than one endpoint active, detaching the rest"
        );
        for ep in live {
            if ep != keep {
                self.disconnect(ep, now);
            }
        }
    }

    fn execute_pending(&mut self, target: EndpointId, now: Instant) {
        let pending: Vec<(RequestId, ApnType)> = self
            .registry
            .ordered()
            .into_iter()
            .filter(|e| e.target == target && !e.is_executed())
            .map(|e| (e.id(), e.apn))
            .collect();

        for (id, apn) in pending {
            if !self.collab.channel.is_apn_supported(target, apn) {
                if let Some(entry) = self.registry.get_mut(id) {
                    if !entry.unsupported_reported {
                        entry.unsupported_reported = true;
                        warn!(
                            request = %id,
                            %apn,
                            endpoint = %target,
                            "APN unsupported on endpoint, request will not execute"
                        );
                    }
                }
                continue;
            }
            if !self.connect(target, Some(id), now) {
                break;
            }
            if let Some(entry) = self.registry.get_mut(id) {
                entry.executed_on = Some(target);
            }
            self.collab.channel.inc_ref_count(target, apn);
            info!(request = %id, %apn, endpoint = %target, "request executed");
            self.notify(ArbiterNotice::RequestExecuted {
                id,
                endpoint: target,
            });
        }
    }

    /// Returns `false` if the radio could not be reached.
    fn connect(&mut self, endpoint: EndpointId, request: Option<RequestId>, now: Instant) -> bool {
        let Some(sw) = self.switches.get_mut(&endpoint) else {
            return false;
        };
        match sw.connect(request) {
            Ok(Some(epoch)) => {
                self.stats.attaches_issued += 1;
                info!(%endpoint, epoch, request = ?request, "attach issued");
                true
            }
            Ok(None) => true,
            Err(e) => {
                self.stats.radio_errors += 1;
                warn!(%endpoint, error = %e, "attach failed, retrying later");
                self.schedule_retry(now);
                false
            }
        }
    }

    fn disconnect(&mut self, endpoint: EndpointId, now: Instant) {
        let released =
            self.unexecute_matching(|e| e.executed_on == Some(endpoint), "endpoint disconnecting");
        let Some(sw) = self.switches.get_mut(&endpoint) else {
            return;
        };
        match sw.disconnect_all() {
            Ok(Some(epoch)) => {
                self.stats.detaches_issued += 1;
                info!(%endpoint, epoch, released, "detach issued");
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.radio_errors += 1;
                warn!(%endpoint, error = %e, "detach failed, retrying later");
                self.schedule_retry(now);
            }
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        if self.retry_at.is_none() {
            self.retry_at = Some(now + self.config.retry_interval);
        }
    }

    /// Clear the executed flag (and return the ref-count) of every matching
    /// request. Returns how many were cleared.
    fn unexecute_matching<F>(&mut self, pred: F, reason: &str) -> usize
    where
        F: Fn(&RequestEntry) -> bool,
    {
        let mut cleared = 0;
        for entry in self.registry.iter_mut() {
            if !pred(&*entry) {
                continue;
            }
            let Some(ep) = entry.executed_on.take() else {
                continue;
            };
            self.collab.channel.dec_ref_count(ep, entry.apn);
            if let Some(sw) = self.switches.get_mut(&ep) {
                sw.dissociate(entry.request.id);
            }
            debug!(request = %entry.request.id, endpoint = %ep, reason, "request un-executed");
            cleared += 1;
        }
        cleared
    }

    // ─── Confirmations ──────────────────────────────────────────────────

    fn on_attach_confirmed(&mut self, endpoint: EndpointId, epoch: Epoch) {
        let Some(sw) = self.switches.get_mut(&endpoint) else {
            warn!(%endpoint, "attach confirmation for unknown endpoint");
            return;
        };
        let applied = sw.on_attached(epoch);
        let current = sw.epoch();
        if !applied {
            self.stats.stale_confirmations += 1;
            warn!(%endpoint, epoch, current, "dropping stale attach confirmation");
            return;
        }
        info!(%endpoint, epoch, "data attached");
        self.fallback_target = endpoint;
        if let Err(e) = self.collab.store.store(endpoint) {
            warn!(error = %e, "failed to persist attach target");
        }
        self.notify(ArbiterNotice::DataAttached(endpoint));
    }

    fn on_detach_confirmed(&mut self, endpoint: EndpointId, epoch: Epoch) {
        let Some(sw) = self.switches.get_mut(&endpoint) else {
            warn!(%endpoint, "detach confirmation for unknown endpoint");
            return;
        };
        let applied = sw.on_detached(epoch);
        let current = sw.epoch();
        if !applied {
            self.stats.stale_confirmations += 1;
            warn!(%endpoint, epoch, current, "dropping stale detach confirmation");
            return;
        }
        let released =
            self.unexecute_matching(|e| e.executed_on == Some(endpoint), "endpoint detached");
        info!(%endpoint, epoch, released, "data detached");
        self.notify(ArbiterNotice::DataDetached(endpoint));
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn reject(&mut self, id: RequestId, err: AdmissionError) {
        warn!(request = %id, error = %err, "request rejected");
        if !matches!(err, AdmissionError::DuplicateRequest(_)) {
            self.admissions.release_unclaimed(id);
        }
        self.notify(ArbiterNotice::RequestRejected {
            id,
            reason: err.to_string(),
        });
    }

    fn is_deferred(&self, id: RequestId) -> bool {
        self.deferred
            .values()
            .any(|list| list.iter().any(|r| r.id == id))
    }

    fn take_deferred(&mut self, id: RequestId) -> Option<NetworkRequest> {
        for list in self.deferred.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    fn publish_switch_state(&mut self) {
        let active = self.active_endpoint();
        if active != self.last_active {
            self.last_active = active;
            self.notify(ArbiterNotice::SwitchStateChanged { active });
        }
    }

    fn notify(&mut self, notice: ArbiterNotice) {
        self.subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }
}
