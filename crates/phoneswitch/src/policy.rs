//! Process-wide data allow/disallow gate with optional auto re-enable.

use std::time::{Duration, Instant};

use tracing::info;

use crate::types::EndpointId;

#[derive(Debug, Clone)]
pub struct PolicyGate {
    allowed: bool,
    reenable_at: Option<Instant>,
    last_hint: Option<EndpointId>,
}

impl Default for PolicyGate {
    fn default() -> Self {
        PolicyGate {
            allowed: true,
            reenable_at: None,
            last_hint: None,
        }
    }
}

impl PolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global flag. The endpoint hint is recorded for diagnostics
    /// only; the gate is not per-endpoint.
    ///
    /// Disallowing with a non-zero timeout schedules a re-enable at
    /// `now + timeout`. Any later call replaces or cancels that timer.
    pub fn set_allowed(
        &mut self,
        endpoint_hint: Option<EndpointId>,
        allowed: bool,
        timeout: Duration,
        now: Instant,
    ) {
        self.last_hint = endpoint_hint;
        self.allowed = allowed;
        self.reenable_at = if !allowed && !timeout.is_zero() {
            Some(now + timeout)
        } else {
            None
        };
        info!(
            allowed,
            hint = ?endpoint_hint,
            timeout_ms = timeout.as_millis() as u64,
            "data allowed state set"
        );
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Fire the deferred re-enable if it is due. Returns `true` if the gate
    /// flipped back to allowed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.reenable_at {
            Some(at) if now >= at => {
                self.reenable_at = None;
                self.allowed = true;
                info!(hint = ?self.last_hint, "data re-enabled after timeout");
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.reenable_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_by_default() {
        let gate = PolicyGate::new();
        assert!(gate.is_allowed());
        assert!(gate.deadline().is_none());
    }

    #[test]
    fn timed_disallow_reenables() {
        let t0 = Instant::now();
        let mut gate = PolicyGate::new();
        gate.set_allowed(None, false, Duration::from_millis(1000), t0);
        assert!(!gate.is_allowed());
        assert_eq!(gate.deadline(), Some(t0 + Duration::from_millis(1000)));

        assert!(!gate.poll(t0 + Duration::from_millis(999)));
        assert!(!gate.is_allowed());

        assert!(gate.poll(t0 + Duration::from_millis(1000)));
        assert!(gate.is_allowed());
        assert!(gate.deadline().is_none());
        assert!(!gate.poll(t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn explicit_allow_cancels_timer() {
        let t0 = Instant::now();
        let mut gate = PolicyGate::new();
        gate.set_allowed(Some(EndpointId(1)), false, Duration::from_millis(500), t0);
        gate.set_allowed(None, true, Duration::ZERO, t0);
        assert!(gate.deadline().is_none());
        assert!(!gate.poll(t0 + Duration::from_secs(1)));
        assert!(gate.is_allowed());
    }

    #[test]
    fn untimed_disallow_stays_off() {
        let t0 = Instant::now();
        let mut gate = PolicyGate::new();
        gate.set_allowed(None, false, Duration::from_millis(100), t0);
        gate.set_allowed(None, false, Duration::ZERO, t0);
        assert!(gate.deadline().is_none());
        assert!(!gate.poll(t0 + Duration::from_secs(60)));
        assert!(!gate.is_allowed());
    }
}
