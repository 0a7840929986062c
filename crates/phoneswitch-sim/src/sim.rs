//! A running arbiter wired to simulated radios and in-memory settings.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use phoneswitch::collab::{AttachTargetStore, Collaborators};
use phoneswitch::endpoint::{RadioEndpoint, SwitchState};
use phoneswitch::persist::{FileAttachTargetStore, MemoryAttachTargetStore};
use phoneswitch::test_util::{check_settled, LedgerChannel, SharedDefault, SharedSubscriptions};
use phoneswitch::types::{EndpointId, NetworkRequest, RequestId, Specifier};
use phoneswitch::{
    AdmissionError, Arbiter, ArbiterConfig, ArbiterHandle, ArbiterNotice, ArbiterRuntime,
    ArbiterSnapshot, EventQueue,
};
use tracing::{info, warn};

use crate::radio::{SimRadio, SimRadioConfig, SimRadioControl};
use crate::scenario::Step;

const POLL: Duration = Duration::from_millis(5);

pub struct Simulation {
    runtime: ArbiterRuntime,
    handle: ArbiterHandle,
    radios: Vec<SimRadioControl>,
    radio_cfg: SimRadioConfig,
    pub ledger: LedgerChannel,
    pub default_data: SharedDefault,
    pub subs: SharedSubscriptions,
    notices: Receiver<ArbiterNotice>,
    rejected: Vec<(RequestId, String)>,
}

impl Simulation {
    pub fn start(config: ArbiterConfig, radio_cfg: SimRadioConfig) -> anyhow::Result<Self> {
        let queue = EventQueue::new(&config);
        let handle = queue.handle();

        let mut radios: Vec<Box<dyn RadioEndpoint>> = Vec::with_capacity(config.endpoint_count);
        let mut controls = Vec::with_capacity(config.endpoint_count);
        for idx in 0..config.endpoint_count {
            let (radio, control) = SimRadio::spawn(EndpointId(idx), radio_cfg, handle.clone())?;
            radios.push(Box::new(radio));
            controls.push(control);
        }

        let ledger = LedgerChannel::new();
        let default_data = SharedDefault::new(EndpointId(0));
        let subs = SharedSubscriptions::all_ready(config.endpoint_count);
        let store: Box<dyn AttachTargetStore> = match &config.state_file {
            Some(path) => Box::new(FileAttachTargetStore::new(path.clone())),
            None => Box::new(MemoryAttachTargetStore::default()),
        };
        let collab = Collaborators {
            channel: Box::new(ledger.clone()),
            default_data: Box::new(default_data.clone()),
            subscriptions: Box::new(subs.clone()),
            store,
        };

        let arbiter = Arbiter::new(config, radios, collab)?;
        let runtime = ArbiterRuntime::start(arbiter, queue)?;
        let notices = handle.subscribe();

        Ok(Self {
            runtime,
            handle,
            radios: controls,
            radio_cfg,
            ledger,
            default_data,
            subs,
            notices,
            rejected: Vec::new(),
        })
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    pub fn radio(&self, endpoint: EndpointId) -> Option<&SimRadioControl> {
        self.radios.get(endpoint.0)
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        self.handle.snapshot()
    }

    /// Requests refused at the handle or by the worker, in arrival order.
    pub fn rejected(&mut self) -> &[(RequestId, String)] {
        self.drain_notices();
        &self.rejected
    }

    pub fn apply(&mut self, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Request {
                id,
                capabilities,
                specifier,
                priority,
            } => {
                let mut request = NetworkRequest::new(*id);
                for cap in capabilities {
                    request = request.with_capability(*cap);
                }
                if let Some(text) = specifier {
                    let spec: Specifier = text.parse()?;
                    request = request.with_specifier(spec);
                }
                if let Some(p) = priority {
                    request = request.with_priority(*p);
                }
                match self.handle.request_network(request) {
                    Ok(()) => {}
                    Err(AdmissionError::ArbiterClosed) => {
                        anyhow::bail!("arbiter stopped while the scenario was running")
                    }
                    Err(e) => {
                        warn!(request = id, error = %e, "request refused");
                        self.rejected.push((RequestId(*id), e.to_string()));
                    }
                }
            }
            Step::Release { id } => self.handle.release_network(RequestId(*id))?,
            Step::Allow {
                allowed,
                timeout_ms,
            } => self
                .handle
                .set_data_allowed(None, *allowed, Duration::from_millis(*timeout_ms))?,
            Step::Default { endpoint } => {
                self.default_data.set(EndpointId(*endpoint));
                self.handle.default_data_changed()?;
            }
            Step::SubscriptionReady { endpoint } => {
                self.subs.set_ready(EndpointId(*endpoint), true);
                self.handle.subscription_ready(EndpointId(*endpoint))?;
            }
            Step::SubscriptionLost { endpoint } => {
                self.subs.set_ready(EndpointId(*endpoint), false);
                self.handle.topology_invalidated(EndpointId(*endpoint))?;
            }
            Step::ChannelDown { endpoint } => self.control(*endpoint)?.set_connected(false),
            Step::ChannelUp { endpoint } => self.control(*endpoint)?.set_connected(true),
            Step::DropSession { endpoint } => self.control(*endpoint)?.drop_session(),
            Step::Wait { ms } => thread::sleep(Duration::from_millis(*ms)),
            Step::Settle => {
                if !self.settle(Duration::from_secs(5)) {
                    warn!("simulation did not settle");
                }
            }
        }
        self.drain_notices();
        Ok(())
    }

    /// Wait until no endpoint is mid-transition and nothing has changed for
    /// a few radio latencies. Returns `false` on timeout.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let quiet = (self.radio_cfg.attach_latency.max(self.radio_cfg.detach_latency) * 3)
            .max(Duration::from_millis(30));
        let deadline = Instant::now() + timeout;
        let mut last = self.snapshot();
        let mut stable_since = Instant::now();
        while Instant::now() < deadline {
            thread::sleep(POLL);
            self.drain_notices();
            let snap = self.snapshot();
            let transitional = snap
                .endpoints
                .iter()
                .any(|e| e.state == SwitchState::Attaching || e.detaching);
            if transitional || !same_state(&snap, &last) {
                last = snap;
                stable_since = Instant::now();
                continue;
            }
            if stable_since.elapsed() >= quiet {
                return true;
            }
        }
        false
    }

    /// Settled-state checks against the latest snapshot.
    pub fn check(&self) -> Result<(), String> {
        check_settled(&self.snapshot(), &self.ledger)
    }

    pub fn shutdown(mut self) -> ArbiterSnapshot {
        let snap = self.snapshot();
        self.runtime.shutdown();
        info!(
            active = ?snap.active,
            requests = snap.requests.len(),
            "simulation stopped"
        );
        snap
    }

    fn control(&self, endpoint: usize) -> anyhow::Result<&SimRadioControl> {
        self.radios
            .get(endpoint)
            .ok_or_else(|| anyhow::anyhow!("no simulated radio for endpoint {}", endpoint))
    }

    fn drain_notices(&mut self) {
        for notice in self.notices.try_iter() {
            if let ArbiterNotice::RequestRejected { id, reason } = notice {
                self.rejected.push((id, reason));
            }
        }
    }
}

/// Equality ignoring counters that move on every pass.
fn same_state(a: &ArbiterSnapshot, b: &ArbiterSnapshot) -> bool {
    a.active == b.active
        && a.allowed == b.allowed
        && a.endpoints == b.endpoints
        && a.requests == b.requests
        && a.deferred == b.deferred
}
