//! Simulated modem radio with its own command thread.
//!
//! Commands are queued to the radio thread, which sleeps for the configured
//! latency and then posts the confirmation back through an
//! [`ArbiterHandle`], the same path a real modem callback would take.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use phoneswitch::endpoint::RadioEndpoint;
use phoneswitch::types::{EndpointId, Epoch};
use phoneswitch::{ArbiterHandle, RadioError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRadioConfig {
    pub attach_latency: Duration,
    pub detach_latency: Duration,
}

impl Default for SimRadioConfig {
    fn default() -> Self {
        Self {
            attach_latency: Duration::from_millis(20),
            detach_latency: Duration::from_millis(10),
        }
    }
}

enum RadioOp {
    Attach(Epoch),
    Detach(Epoch),
    DropSession,
    Shutdown,
}

/// Radio half handed to the arbiter.
pub struct SimRadio {
    id: EndpointId,
    ops: Sender<RadioOp>,
    connected: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Test-side controls for a [`SimRadio`].
#[derive(Clone)]
pub struct SimRadioControl {
    id: EndpointId,
    ops: Sender<RadioOp>,
    connected: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
}

impl SimRadio {
    pub fn spawn(
        id: EndpointId,
        cfg: SimRadioConfig,
        arbiter: ArbiterHandle,
    ) -> anyhow::Result<(Self, SimRadioControl)> {
        let (tx, rx) = unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let session = Arc::new(AtomicBool::new(false));

        let worker_session = session.clone();
        let worker = thread::Builder::new()
            .name(format!("sim-radio-{}", id.0))
            .spawn(move || radio_worker(id, cfg, rx, worker_session, arbiter))
            .map_err(|e| anyhow::anyhow!("Failed to spawn radio {}: {}", id, e))?;

        let control = SimRadioControl {
            id,
            ops: tx.clone(),
            connected: connected.clone(),
            session: session.clone(),
        };
        let radio = SimRadio {
            id,
            ops: tx,
            connected,
            session,
            worker: Some(worker),
        };
        Ok((radio, control))
    }

    fn queue(&self, op: RadioOp) -> Result<(), RadioError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RadioError::ChannelDown(self.id));
        }
        self.ops
            .send(op)
            .map_err(|_| RadioError::ChannelDown(self.id))
    }
}

impl RadioEndpoint for SimRadio {
    fn attach(&mut self, epoch: Epoch) -> Result<(), RadioError> {
        self.queue(RadioOp::Attach(epoch))
    }

    fn detach(&mut self, epoch: Epoch) -> Result<(), RadioError> {
        self.queue(RadioOp::Detach(epoch))
    }

    fn query_idle(&self) -> Option<bool> {
        Some(!self.session.load(Ordering::SeqCst))
    }
}

impl Drop for SimRadio {
    fn drop(&mut self) {
        let _ = self.ops.send(RadioOp::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl SimRadioControl {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// While disconnected every command fails with `ChannelDown`.
    pub fn set_connected(&self, connected: bool) {
        info!(endpoint = %self.id, connected, "sim radio channel");
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Network tears the data call down without being asked.
    pub fn drop_session(&self) {
        let _ = self.ops.send(RadioOp::DropSession);
    }

    pub fn is_session_up(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }
}

fn radio_worker(
    id: EndpointId,
    cfg: SimRadioConfig,
    rx: Receiver<RadioOp>,
    session: Arc<AtomicBool>,
    arbiter: ArbiterHandle,
) {
    let mut epoch: Epoch = 0;
    while let Ok(op) = rx.recv() {
        let posted = match op {
            RadioOp::Attach(e) => {
                thread::sleep(cfg.attach_latency);
                epoch = e;
                session.store(true, Ordering::SeqCst);
                arbiter.notify_data_attached(id, e)
            }
            RadioOp::Detach(e) => {
                thread::sleep(cfg.detach_latency);
                epoch = e;
                session.store(false, Ordering::SeqCst);
                arbiter.notify_data_detached(id, e)
            }
            RadioOp::DropSession => {
                if !session.swap(false, Ordering::SeqCst) {
                    continue;
                }
                info!(endpoint = %id, epoch, "sim radio dropped session");
                arbiter.notify_data_detached(id, epoch)
            }
            RadioOp::Shutdown => break,
        };
        if let Err(e) = posted {
            debug!(endpoint = %id, error = %e, "confirmation not delivered");
        }
    }
}
