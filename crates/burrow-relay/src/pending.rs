//! Pending requests tracker
//!
//! Tracks public requests dispatched on a tunnel and routes responses back to
//! the waiting edge handlers. Each slot is a single-shot channel keyed by the
//! request id; a response either completes exactly one slot or is dropped.

use burrow_proto::TunnelResponse;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks in-flight requests awaiting responses on one tunnel
#[derive(Clone)]
pub struct PendingRequests {
    /// Maps request id -> oneshot sender for the response
    requests: Arc<DashMap<u64, oneshot::Sender<TunnelResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request.
    /// Returns a receiver for the response, or None if the id is already in
    /// flight (the caller draws a new id and retries).
    pub fn register(&self, id: u64) -> Option<oneshot::Receiver<TunnelResponse>> {
        match self.requests.entry(id) {
            dashmap::Entry::Occupied(_) => None,
            dashmap::Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                debug!("Registered pending request {}", id);
                Some(rx)
            }
        }
    }

    /// Deliver a response to its pending slot.
    /// Returns true if a waiter received it; false if no slot matched the id
    /// (the response is dropped) or the waiter already gave up.
    pub fn complete(&self, id: u64, response: TunnelResponse) -> bool {
        if let Some((_, tx)) = self.requests.remove(&id) {
            debug!("Routing response for request {}", id);
            if tx.send(response).is_err() {
                warn!("Waiter for request {} is gone, dropping response", id);
                return false;
            }
            return true;
        }
        warn!("No pending request with id {}, dropping response", id);
        false
    }

    /// Remove a pending request (deadline expiry or dispatch failure)
    pub fn cancel(&self, id: u64) {
        if self.requests.remove(&id).is_some() {
            debug!("Cancelled pending request {}", id);
        }
    }

    /// Abort every pending request on tunnel close. Dropping the senders
    /// wakes the waiting edge handlers with a channel error.
    pub fn abort_all(&self) {
        let aborted = self.requests.len();
        self.requests.clear();
        if aborted > 0 {
            debug!("Aborted {} pending requests", aborted);
        }
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
