//! Reactions to external configuration changes: default-data endpoint,
//! subscription readiness and subscription removal.
//!
//! Each handler only fixes up bookkeeping; the pass that follows every event
//! does the actual attaching and executing.

use tracing::{debug, info, warn};

use super::{Arbiter, ArbiterNotice};
use crate::types::{EndpointId, RequestId};

impl Arbiter {
    pub(super) fn on_default_data_changed(&mut self) {
        let reported = self.collab.default_data.current_default_endpoint();
        if reported.0 >= self.endpoint_count {
            warn!(endpoint = %reported, "ignoring out-of-range default data endpoint");
            return;
        }
        let previous = self.default_endpoint;
        self.default_endpoint = reported;
        if previous == reported {
            debug!(endpoint = %reported, "default data endpoint unchanged");
            return;
        }

        let mut invalidated = 0usize;
        for entry in self.registry.iter_mut() {
            if !entry.is_default_routed() {
                continue;
            }
            entry.target = reported;
            match entry.executed_on {
                Some(ep) if ep != reported => {
                    entry.executed_on = None;
                    self.collab.channel.dec_ref_count(ep, entry.apn);
                    if let Some(sw) = self.switches.get_mut(&ep) {
                        sw.dissociate(entry.request.id);
                    }
                    invalidated += 1;
                }
                _ => {}
            }
        }
        info!(
            from = %previous,
            to = %reported,
            invalidated,
            "default data endpoint changed"
        );
    }

    pub(super) fn on_subscription_ready(&mut self, endpoint: EndpointId) {
        let Some(pending) = self.deferred.remove(&endpoint) else {
            debug!(%endpoint, "subscription ready, nothing deferred");
            return;
        };
        info!(%endpoint, count = pending.len(), "subscription ready, replaying deferred requests");
        for request in pending {
            let id = request.id;
            if let Err(err) = self.admit(request) {
                self.reject(id, err);
            }
        }
    }

    /// Every request resolving to the endpoint is released, pinned or
    /// default-routed, and requests deferred on it are dropped.
    pub(super) fn on_topology_invalidated(&mut self, endpoint: EndpointId) {
        let targeting: Vec<RequestId> = self
            .registry
            .ordered()
            .into_iter()
            .filter(|e| e.target == endpoint)
            .map(|e| e.id())
            .collect();
        for id in &targeting {
            // Ids were collected from the registry just above.
            let _ = self.drop_request(*id);
            self.admissions.release_unclaimed(*id);
        }

        let dropped = self.deferred.remove(&endpoint).unwrap_or_default();
        for request in &dropped {
            self.admissions.release_unclaimed(request.id);
            self.notify(ArbiterNotice::RequestReleased { id: request.id });
        }

        info!(
            %endpoint,
            released = targeting.len(),
            deferred_dropped = dropped.len(),
            "endpoint topology invalidated"
        );
    }
}
