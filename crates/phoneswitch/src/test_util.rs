//! In-memory collaborators and a deterministic driver for exercising the
//! arbiter without threads.
//!
//! [`Harness`] owns an [`Arbiter`] wired to recording radios. Radio commands
//! are only logged; [`Harness::settle`] plays the radios' part by confirming
//! every logged command in issue order until nothing is outstanding.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::error;

use crate::arbiter::{Arbiter, ArbiterEvent, ArbiterSnapshot};
use crate::collab::{
    Collaborators, DefaultDataResolver, LogicalChannel, SubscriptionDirectory,
};
use crate::config::ArbiterConfig;
use crate::endpoint::{RadioEndpoint, SwitchState};
use crate::error::RadioError;
use crate::persist::MemoryAttachTargetStore;
use crate::types::{ApnType, EndpointId, Epoch, NetworkRequest, RequestId};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Radios ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Attach,
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioCommand {
    pub endpoint: EndpointId,
    pub kind: CommandKind,
    pub epoch: Epoch,
}

impl RadioCommand {
    pub fn attach(endpoint: EndpointId, epoch: Epoch) -> Self {
        Self {
            endpoint,
            kind: CommandKind::Attach,
            epoch,
        }
    }

    pub fn detach(endpoint: EndpointId, epoch: Epoch) -> Self {
        Self {
            endpoint,
            kind: CommandKind::Detach,
            epoch,
        }
    }
}

/// Commands from every radio, in issue order.
pub type CommandLog = Arc<Mutex<Vec<RadioCommand>>>;

pub struct RecordingRadio {
    id: EndpointId,
    log: CommandLog,
    channel_up: Arc<AtomicBool>,
    idle_at_boot: Option<bool>,
}

impl RecordingRadio {
    pub fn new(id: EndpointId, log: CommandLog, channel_up: Arc<AtomicBool>) -> Self {
        Self {
            id,
            log,
            channel_up,
            idle_at_boot: None,
        }
    }

    fn record(&self, kind: CommandKind, epoch: Epoch) -> Result<(), RadioError> {
        if !self.channel_up.load(Ordering::SeqCst) {
            return Err(RadioError::ChannelDown(self.id));
        }
        lock(&self.log).push(RadioCommand {
            endpoint: self.id,
            kind,
            epoch,
        });
        Ok(())
    }
}

impl RadioEndpoint for RecordingRadio {
    fn attach(&mut self, epoch: Epoch) -> Result<(), RadioError> {
        self.record(CommandKind::Attach, epoch)
    }

    fn detach(&mut self, epoch: Epoch) -> Result<(), RadioError> {
        self.record(CommandKind::Detach, epoch)
    }

    fn query_idle(&self) -> Option<bool> {
        self.idle_at_boot
    }
}

// ─── Logical Channel ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEvent {
    pub endpoint: EndpointId,
    pub apn: ApnType,
    pub delta: i32,
}

#[derive(Debug, Default)]
struct LedgerState {
    counts: HashMap<(EndpointId, ApnType), i64>,
    events: Vec<RefEvent>,
    unsupported: HashSet<(EndpointId, ApnType)>,
    priorities: HashMap<ApnType, i32>,
}

/// Ref-count ledger standing in for the data-call layer. Clones share state.
#[derive(Debug, Clone)]
pub struct LedgerChannel {
    state: Arc<Mutex<LedgerState>>,
}

impl Default for LedgerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerChannel {
    pub fn new() -> Self {
        let priorities = [
            (ApnType::Emergency, 10),
            (ApnType::Ims, 5),
            (ApnType::Mms, 2),
            (ApnType::Supl, 2),
            (ApnType::Xcap, 2),
            (ApnType::Cbs, 2),
            (ApnType::Fota, 2),
            (ApnType::Mcx, 2),
            (ApnType::Dun, 1),
        ]
        .into_iter()
        .collect();
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                priorities,
                ..Default::default()
            })),
        }
    }

    pub fn ref_count(&self, endpoint: EndpointId, apn: ApnType) -> i64 {
        lock(&self.state)
            .counts
            .get(&(endpoint, apn))
            .copied()
            .unwrap_or(0)
    }

    pub fn events(&self) -> Vec<RefEvent> {
        lock(&self.state).events.clone()
    }

    pub fn increments(&self) -> usize {
        lock(&self.state).events.iter().filter(|e| e.delta > 0).count()
    }

    pub fn decrements(&self) -> usize {
        lock(&self.state).events.iter().filter(|e| e.delta < 0).count()
    }

    /// Non-zero counts, for comparing against the executed set.
    pub fn outstanding(&self) -> HashMap<(EndpointId, ApnType), i64> {
        lock(&self.state)
            .counts
            .iter()
            .filter(|(_, c)| **c != 0)
            .map(|(k, c)| (*k, *c))
            .collect()
    }

    pub fn set_unsupported(&self, endpoint: EndpointId, apn: ApnType) {
        lock(&self.state).unsupported.insert((endpoint, apn));
    }

    pub fn set_priority(&self, apn: ApnType, priority: i32) {
        lock(&self.state).priorities.insert(apn, priority);
    }

    fn apply(&self, endpoint: EndpointId, apn: ApnType, delta: i32) {
        let mut state = lock(&self.state);
        *state.counts.entry((endpoint, apn)).or_insert(0) += delta as i64;
        state.events.push(RefEvent {
            endpoint,
            apn,
            delta,
        });
    }
}

impl LogicalChannel for LedgerChannel {
    fn inc_ref_count(&mut self, endpoint: EndpointId, apn: ApnType) {
        self.apply(endpoint, apn, 1);
    }

    fn dec_ref_count(&mut self, endpoint: EndpointId, apn: ApnType) {
        self.apply(endpoint, apn, -1);
    }

    fn is_apn_supported(&self, endpoint: EndpointId, apn: ApnType) -> bool {
        !lock(&self.state).unsupported.contains(&(endpoint, apn))
    }

    fn priority_of(&self, apn: ApnType) -> i32 {
        lock(&self.state).priorities.get(&apn).copied().unwrap_or(0)
    }
}

// ─── Settings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SharedDefault {
    endpoint: Arc<AtomicUsize>,
}

impl SharedDefault {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint: Arc::new(AtomicUsize::new(endpoint.0)),
        }
    }

    pub fn set(&self, endpoint: EndpointId) {
        self.endpoint.store(endpoint.0, Ordering::SeqCst);
    }
}

impl DefaultDataResolver for SharedDefault {
    fn current_default_endpoint(&self) -> EndpointId {
        EndpointId(self.endpoint.load(Ordering::SeqCst))
    }
}

/// Subscription `100 + i` lives in endpoint `i` unless overridden.
#[derive(Debug, Clone, Default)]
pub struct SharedSubscriptions {
    ready: Arc<Mutex<HashSet<EndpointId>>>,
    owners: Arc<Mutex<HashMap<u32, EndpointId>>>,
}

impl SharedSubscriptions {
    pub fn all_ready(endpoint_count: usize) -> Self {
        let subs = Self::default();
        for idx in 0..endpoint_count {
            subs.set_ready(EndpointId(idx), true);
            subs.set_owner(100 + idx as u32, Some(EndpointId(idx)));
        }
        subs
    }

    pub fn set_ready(&self, endpoint: EndpointId, ready: bool) {
        let mut set = lock(&self.ready);
        if ready {
            set.insert(endpoint);
        } else {
            set.remove(&endpoint);
        }
    }

    pub fn set_owner(&self, subscription: u32, endpoint: Option<EndpointId>) {
        let mut owners = lock(&self.owners);
        match endpoint {
            Some(ep) => owners.insert(subscription, ep),
            None => owners.remove(&subscription),
        };
    }
}

impl SubscriptionDirectory for SharedSubscriptions {
    fn is_ready(&self, endpoint: EndpointId) -> bool {
        lock(&self.ready).contains(&endpoint)
    }

    fn endpoint_for_subscription(&self, subscription: u32) -> Option<EndpointId> {
        lock(&self.owners).get(&subscription).copied()
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

pub struct HarnessBuilder {
    config: ArbiterConfig,
    persisted: Option<EndpointId>,
    default_endpoint: EndpointId,
    attached_at_boot: Vec<usize>,
}

impl HarnessBuilder {
    pub fn attach_ahead(mut self, on: bool) -> Self {
        self.config.attach_ahead = on;
        self
    }

    pub fn persisted(mut self, endpoint: EndpointId) -> Self {
        self.persisted = Some(endpoint);
        self
    }

    pub fn default_endpoint(mut self, endpoint: EndpointId) -> Self {
        self.default_endpoint = endpoint;
        self
    }

    /// Radios that report an existing data session at startup.
    pub fn attached_at_boot(mut self, endpoints: &[usize]) -> Self {
        self.attached_at_boot = endpoints.to_vec();
        self
    }

    pub fn config(mut self, config: ArbiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Harness {
        let count = self.config.endpoint_count;
        let log: CommandLog = Arc::default();
        let mut links = Vec::with_capacity(count);
        let mut radios: Vec<Box<dyn RadioEndpoint>> = Vec::with_capacity(count);
        for idx in 0..count {
            let up = Arc::new(AtomicBool::new(true));
            let mut radio = RecordingRadio::new(EndpointId(idx), log.clone(), up.clone());
            if self.attached_at_boot.contains(&idx) {
                radio.idle_at_boot = Some(false);
            }
            links.push(up);
            radios.push(Box::new(radio));
        }

        let ledger = LedgerChannel::new();
        let default_data = SharedDefault::new(self.default_endpoint);
        let subs = SharedSubscriptions::all_ready(count);
        let store = MemoryAttachTargetStore::new(self.persisted);
        let collab = Collaborators {
            channel: Box::new(ledger.clone()),
            default_data: Box::new(default_data.clone()),
            subscriptions: Box::new(subs.clone()),
            store: Box::new(store.clone()),
        };

        let arbiter = match Arbiter::new(self.config, radios, collab) {
            Ok(arbiter) => arbiter,
            Err(e) => panic!("harness arbiter: {e}"),
        };

        Harness {
            arbiter,
            now: Instant::now(),
            log,
            ledger,
            default_data,
            subs,
            store,
            links,
            confirmed: 0,
        }
    }
}

pub struct Harness {
    pub arbiter: Arbiter,
    pub now: Instant,
    pub log: CommandLog,
    pub ledger: LedgerChannel,
    pub default_data: SharedDefault,
    pub subs: SharedSubscriptions,
    pub store: MemoryAttachTargetStore,
    links: Vec<Arc<AtomicBool>>,
    confirmed: usize,
}

impl Harness {
    /// `endpoint_count` radios, default data on ep0, attach-ahead on.
    pub fn new(endpoint_count: usize) -> Self {
        Self::builder(endpoint_count).build()
    }

    pub fn builder(endpoint_count: usize) -> HarnessBuilder {
        HarnessBuilder {
            config: ArbiterConfig {
                endpoint_count,
                ..ArbiterConfig::default()
            },
            persisted: None,
            default_endpoint: EndpointId(0),
            attached_at_boot: Vec::new(),
        }
    }

    /// Hand the arbiter to a runtime. Clone `log` and the fakes first.
    pub fn into_arbiter(self) -> Arbiter {
        self.arbiter
    }

    pub fn bootstrap(&mut self) {
        self.arbiter.bootstrap(self.now);
    }

    pub fn event(&mut self, event: ArbiterEvent) {
        self.arbiter.handle(event, self.now);
    }

    pub fn add(&mut self, request: NetworkRequest) {
        self.event(ArbiterEvent::RequestAdded(request));
    }

    pub fn remove(&mut self, id: RequestId) {
        self.event(ArbiterEvent::RequestRemoved(id));
    }

    pub fn set_allowed(&mut self, allowed: bool, timeout: Duration) {
        self.event(ArbiterEvent::AllowedChanged {
            endpoint_hint: None,
            allowed,
            timeout,
        });
    }

    pub fn change_default(&mut self, endpoint: EndpointId) {
        self.default_data.set(endpoint);
        self.event(ArbiterEvent::SettingsChanged);
    }

    pub fn set_channel_up(&mut self, endpoint: EndpointId, up: bool) {
        if let Some(flag) = self.links.get(endpoint.0) {
            flag.store(up, Ordering::SeqCst);
        }
    }

    /// Every radio command issued so far.
    pub fn commands(&self) -> Vec<RadioCommand> {
        lock(&self.log).clone()
    }

    /// Commands not yet confirmed by [`Harness::settle`].
    pub fn outstanding(&self) -> Vec<RadioCommand> {
        lock(&self.log)
            .get(self.confirmed..)
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }

    /// Confirm outstanding radio commands, in order, until none remain.
    /// Returns how many confirmations were delivered.
    pub fn settle(&mut self) -> usize {
        const LIMIT: usize = 10_000;
        let mut delivered = 0;
        loop {
            let next = lock(&self.log).get(self.confirmed).copied();
            let Some(cmd) = next else {
                break;
            };
            self.confirmed += 1;
            let event = match cmd.kind {
                CommandKind::Attach => ArbiterEvent::AttachConfirmed {
                    endpoint: cmd.endpoint,
                    epoch: cmd.epoch,
                },
                CommandKind::Detach => ArbiterEvent::DetachConfirmed {
                    endpoint: cmd.endpoint,
                    epoch: cmd.epoch,
                },
            };
            self.arbiter.handle(event, self.now);
            delivered += 1;
            if delivered >= LIMIT {
                error!(delivered, "settle did not converge");
                break;
            }
        }
        delivered
    }

    /// Move the clock forward and fire due timers.
    pub fn advance(&mut self, by: Duration) {
        self.advance_to(self.now + by);
    }

    pub fn advance_to(&mut self, at: Instant) {
        if at > self.now {
            self.now = at;
        }
        self.arbiter.tick(self.now);
    }

    /// Single-active-radio and executed-iff-active checks against the
    /// current state. Meaningful after [`Harness::settle`].
    pub fn check_invariants(&self) -> Result<(), String> {
        check_settled(&self.arbiter.snapshot(), &self.ledger)
    }
}

/// Checks a snapshot taken once every radio command has been confirmed:
/// at most one endpoint is up, a request is executed iff data is allowed and
/// its endpoint is the active one, and the channel's ref-counts match the
/// executed set.
pub fn check_settled(snap: &ArbiterSnapshot, ledger: &LedgerChannel) -> Result<(), String> {
    let non_idle: Vec<EndpointId> = snap
        .endpoints
        .iter()
        .filter(|e| e.state != SwitchState::Idle)
        .map(|e| e.id)
        .collect();
    if non_idle.len() > 1 {
        return Err(format!("more than one endpoint non-idle: {:?}", non_idle));
    }

    let mut expected: HashMap<(EndpointId, ApnType), i64> = HashMap::new();
    for req in &snap.requests {
        let executable = ledger.is_apn_supported(req.target, req.apn);
        let should = snap.allowed && executable && snap.active == Some(req.target);
        let is = req.executed_on.is_some();
        if should != is {
            return Err(format!(
                "{} executed={} but allowed={} target={} active={:?}",
                req.id, is, snap.allowed, req.target, snap.active
            ));
        }
        if let Some(ep) = req.executed_on {
            *expected.entry((ep, req.apn)).or_insert(0) += 1;
        }
    }
    let outstanding = ledger.outstanding();
    if outstanding != expected {
        return Err(format!(
            "ref-counts {:?} do not match executed requests {:?}",
            outstanding, expected
        ));
    }
    Ok(())
}
