//! Moves queued items into outbound requests.

use crate::engine::Engine;
use crate::model::LocationId;
use crate::transport::Transport;
use edgelink_protocol::ElementBody;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

impl<T: Transport> Engine<T> {
    /// Walks the queue under its lock and folds eligible items into the
    /// open request of their binding's location.
    ///
    /// Items stay queued (claimed by the request's message ID) until a
    /// success status purges them. Draining stops once no location is
    /// viable for more content.
    pub(crate) fn drain_queue(&mut self, now: Instant) {
        let queue = Arc::clone(&self.queue);
        let mut drain = queue.open_drain();
        let mut viable: BTreeSet<LocationId> = self.model.locations.ids().collect();
        let mut claimed = 0usize;

        while !viable.is_empty() {
            let Some(item) = drain.fetch_next() else {
                break;
            };
            if item.request_id().is_some_and(|id| self.requests.is_live(id)) {
                continue;
            }
            let device = item.device();
            if !self.model.devices.is_ready(device) {
                continue;
            }
            let Some(mut config) = self.model.resolve_config(item.config()) else {
                continue;
            };
            let Some(mut location) = self.model.config(config).map(|c| c.active_location(device)) else {
                continue;
            };
            if !self.model.locations.is_online(location) {
                if let Some(backup) = self.model.backup().filter(|b| *b != config) {
                    if let Some(cfg) = self.model.config(backup) {
                        config = backup;
                        location = cfg.active_location(device);
                    }
                }
            }

            let Some(binding) = self.model.binding_mut(config, device) else {
                continue;
            };
            if !binding.may_use(now) || !binding.registered || binding.maintenance {
                continue;
            }
            if !self.model.locations.is_online(location) {
                viable.remove(&location);
                continue;
            }
            if !viable.contains(&location) {
                continue;
            }

            let body = ElementBody::Data(item.content().to_vec());
            match self.add_element(config, device, body) {
                Some(request_id) => {
                    item.claim(request_id);
                    claimed += 1;
                    if let Some(binding) = self.model.binding_mut(config, device) {
                        binding.last_ping = Some(now);
                    }
                }
                None => {
                    viable.remove(&location);
                }
            }
        }

        if claimed > 0 {
            debug!("drained {claimed} queued item(s), {} left unvisited", drain.remaining());
        }
    }
}
