//! Worker thread that owns the [`Arbiter`] and serialises every input
//! through one bounded queue.
//!
//! Callers and radios talk to it through cloneable [`ArbiterHandle`]s.
//! The worker handles one message at a time, fires timers between messages
//! and publishes a fresh [`ArbiterSnapshot`] after each step.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::arbiter::{validate, Admissions, Arbiter, ArbiterEvent, ArbiterNotice, ArbiterSnapshot};
use crate::config::ArbiterConfig;
use crate::error::AdmissionError;
use crate::types::{EndpointId, Epoch, NetworkRequest, RequestId};

/// Upper bound on how long the worker sleeps with no timer armed.
const IDLE_WAIT: Duration = Duration::from_millis(250);

enum RuntimeMessage {
    Event(ArbiterEvent),
    Subscribe(Sender<ArbiterNotice>),
    Shutdown,
}

/// Queue created ahead of the arbiter so radios can be given a handle
/// before the arbiter that owns them exists.
pub struct EventQueue {
    sender: Sender<RuntimeMessage>,
    receiver: Receiver<RuntimeMessage>,
    handle: ArbiterHandle,
}

impl EventQueue {
    pub fn new(config: &ArbiterConfig) -> Self {
        let (tx, rx) = bounded(config.queue_capacity);
        let handle = ArbiterHandle {
            sender: tx.clone(),
            endpoint_count: Arc::new(AtomicUsize::new(config.endpoint_count)),
            admissions: Admissions::default(),
            snapshot: Arc::new(Mutex::new(ArbiterSnapshot::default())),
        };
        Self {
            sender: tx,
            receiver: rx,
            handle,
        }
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }
}

#[derive(Clone)]
pub struct ArbiterHandle {
    sender: Sender<RuntimeMessage>,
    endpoint_count: Arc<AtomicUsize>,
    admissions: Admissions,
    snapshot: Arc<Mutex<ArbiterSnapshot>>,
}

impl ArbiterHandle {
    /// Malformed requests and duplicate ids are refused here, before the
    /// request reaches the queue. Unmapped subscription specifiers are only
    /// detected by the worker and reported as a `RequestRejected` notice.
    pub fn request_network(&self, request: NetworkRequest) -> Result<(), AdmissionError> {
        validate(&request, self.endpoint_count.load(Ordering::SeqCst))?;
        let id = request.id;
        if !self.admissions.try_admit(id) {
            return Err(AdmissionError::DuplicateRequest(id));
        }
        if self
            .sender
            .send(RuntimeMessage::Event(ArbiterEvent::RequestAdded(request)))
            .is_err()
        {
            self.admissions.release(id);
            return Err(AdmissionError::ArbiterClosed);
        }
        Ok(())
    }

    /// The id is free for reuse as soon as this returns; a request with the
    /// same id queued afterwards is ordered after the removal.
    pub fn release_network(&self, id: RequestId) -> anyhow::Result<()> {
        self.admissions.begin_release(id);
        if let Err(e) = self.post(ArbiterEvent::RequestRemoved(id)) {
            self.admissions.abort_release(id);
            return Err(e);
        }
        Ok(())
    }

    /// A disallow with a non-zero `timeout` reverts to allowed on its own.
    pub fn set_data_allowed(
        &self,
        endpoint_hint: Option<EndpointId>,
        allowed: bool,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        self.post(ArbiterEvent::AllowedChanged {
            endpoint_hint,
            allowed,
            timeout,
        })
    }

    pub fn notify_data_attached(&self, endpoint: EndpointId, epoch: Epoch) -> anyhow::Result<()> {
        self.post(ArbiterEvent::AttachConfirmed { endpoint, epoch })
    }

    pub fn notify_data_detached(&self, endpoint: EndpointId, epoch: Epoch) -> anyhow::Result<()> {
        self.post(ArbiterEvent::DetachConfirmed { endpoint, epoch })
    }

    pub fn default_data_changed(&self) -> anyhow::Result<()> {
        self.post(ArbiterEvent::SettingsChanged)
    }

    pub fn subscription_ready(&self, endpoint: EndpointId) -> anyhow::Result<()> {
        self.post(ArbiterEvent::SubscriptionReady(endpoint))
    }

    pub fn topology_invalidated(&self, endpoint: EndpointId) -> anyhow::Result<()> {
        self.post(ArbiterEvent::TopologyInvalidated(endpoint))
    }

    /// As of the last published snapshot.
    pub fn active_endpoint(&self) -> Option<EndpointId> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Notices produced after the worker picks up the subscription. The
    /// receiver disconnects once the worker stops.
    pub fn subscribe(&self) -> Receiver<ArbiterNotice> {
        let (tx, rx) = unbounded();
        // A closed runtime drops `tx` with the message, disconnecting `rx`.
        let _ = self.sender.send(RuntimeMessage::Subscribe(tx));
        rx
    }

    fn post(&self, event: ArbiterEvent) -> anyhow::Result<()> {
        self.sender
            .send(RuntimeMessage::Event(event))
            .map_err(|e| anyhow::anyhow!("Arbiter worker is gone, dropped {} message", e.0.kind()))
    }
}

impl RuntimeMessage {
    fn kind(&self) -> &'static str {
        match self {
            RuntimeMessage::Event(_) => "event",
            RuntimeMessage::Subscribe(_) => "subscribe",
            RuntimeMessage::Shutdown => "shutdown",
        }
    }
}

pub struct ArbiterRuntime {
    sender: Sender<RuntimeMessage>,
    handle: ArbiterHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl ArbiterRuntime {
    pub fn start(mut arbiter: Arbiter, queue: EventQueue) -> anyhow::Result<Self> {
        let EventQueue {
            sender,
            receiver,
            handle,
        } = queue;

        handle
            .endpoint_count
            .store(arbiter.endpoint_count(), Ordering::SeqCst);
        arbiter.share_admissions(handle.admissions.clone());

        let snapshot = handle.snapshot.clone();
        let worker = thread::Builder::new()
            .name("phoneswitch-arbiter".into())
            .spawn(move || runtime_worker(arbiter, receiver, snapshot))
            .map_err(|e| anyhow::anyhow!("Failed to spawn arbiter worker: {}", e))?;

        Ok(Self {
            sender,
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    /// Stops the worker after the messages already queued. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.sender.send(RuntimeMessage::Shutdown);
        let _ = worker.join();
    }
}

impl Drop for ArbiterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(
    mut arbiter: Arbiter,
    rx: Receiver<RuntimeMessage>,
    snapshot: Arc<Mutex<ArbiterSnapshot>>,
) {
    arbiter.bootstrap(Instant::now());
    publish(&arbiter, &snapshot);

    loop {
        let wait = match arbiter.next_deadline() {
            Some(at) => at.saturating_duration_since(Instant::now()).min(IDLE_WAIT),
            None => IDLE_WAIT,
        };
        match rx.recv_timeout(wait) {
            Ok(RuntimeMessage::Event(event)) => arbiter.handle(event, Instant::now()),
            Ok(RuntimeMessage::Subscribe(tx)) => {
                debug!("notice subscriber added");
                arbiter.add_subscriber(tx);
            }
            Ok(RuntimeMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        arbiter.tick(Instant::now());
        publish(&arbiter, &snapshot);
    }

    let stats = arbiter.stats();
    info!(
        passes = stats.passes,
        attaches = stats.attaches_issued,
        detaches = stats.detaches_issued,
        "arbiter worker stopped"
    );
    // Radios may be blocked posting confirmations; close the queue before
    // dropping (and joining) them.
    drop(rx);
    drop(arbiter);
}

fn publish(arbiter: &Arbiter, snapshot: &Mutex<ArbiterSnapshot>) {
    let next = arbiter.snapshot();
    *snapshot.lock().unwrap_or_else(|e| e.into_inner()) = next;
}
