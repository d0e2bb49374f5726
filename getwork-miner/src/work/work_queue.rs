//! Latest-work store that carves nonce ranges on demand.
//!
//! The protocol client delivers whole work units; compute consumers want
//! ranges sized to their measured speed. `WorkQueue` sits between the two:
//! it keeps only the newest work (older work is superseded, never queued)
//! and hands out consecutive slices of its nonce space. When the space runs
//! out it asks the client for fresh work and parks callers until it arrives.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AssignedWork, WorkRange};
use crate::getwork::ClientHandle;
use crate::queue_reader::RangeSource;
use crate::tracing::prelude::*;
use crate::types::{HashRate, RateAverager};

/// Range size used until a consumer's timing feedback picks one.
pub const DEFAULT_RANGE_SIZE: u64 = 1 << 22;

/// Shared work store implementing [`RangeSource`].
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    client: Option<ClientHandle>,
    rates: Mutex<RateAverager>,
}

#[derive(Default)]
struct QueueState {
    work: Option<Arc<AssignedWork>>,
    next_nonce: u64,
    /// Fresh work has been requested for the exhausted current work
    requested: bool,
    closed: bool,
}

impl QueueState {
    /// Next range of `size` nonces, as a whole multiple of `work_factor`:
    /// rounded up when carving, down where the nonce space runs out.
    fn carve(&mut self, size: u64, work_factor: u64) -> Option<WorkRange> {
        let work = self.work.as_ref()?;
        let remaining = work.nonce_space().saturating_sub(self.next_nonce);
        let size = (size.div_ceil(work_factor) * work_factor)
            .min(remaining / work_factor * work_factor);
        if size == 0 {
            return None;
        }
        let range = WorkRange {
            work: work.clone(),
            base: self.next_nonce as u32,
            size,
        };
        self.next_nonce += size;
        Some(range)
    }
}

impl WorkQueue {
    /// Create a queue. With a client handle, exhausting the current work
    /// triggers an immediate work request.
    pub fn new(client: Option<ClientHandle>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
            client,
            rates: Mutex::new(RateAverager::default()),
        }
    }

    /// Replace the current work. Ranges already handed out stay valid for
    /// their holders; new ranges come from the new work.
    pub fn store_work(&self, work: AssignedWork) {
        {
            let mut state = self.state.lock();
            state.work = Some(Arc::new(work));
            state.next_nonce = 0;
            state.requested = false;
        }
        self.changed.notify_waiters();
    }

    /// Stop handing out ranges. Pending and future fetches return `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Average of recently reported consumer rates.
    pub fn hashrate(&self) -> HashRate {
        self.rates.lock().average()
    }
}

#[async_trait]
impl RangeSource for WorkQueue {
    async fn fetch_range(&self, size: Option<u64>, work_factor: u64) -> Option<WorkRange> {
        let size = size.unwrap_or(DEFAULT_RANGE_SIZE).max(1);
        let work_factor = work_factor.max(1);
        loop {
            // Register interest before inspecting state so a store_work()
            // between the check and the await is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let should_request = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(range) = state.carve(size, work_factor) {
                    return Some(range);
                }
                state.work.is_some() && !std::mem::replace(&mut state.requested, true)
            };

            if should_request {
                if let Some(client) = &self.client {
                    debug!("Nonce space exhausted, requesting work");
                    if let Err(e) = client.request_work().await {
                        warn!(error = %e, "Failed to request work");
                    }
                }
            }

            notified.await;
        }
    }

    fn update_rate(&self, rate: HashRate) {
        let average = self.rates.lock().record(rate);
        trace!(%rate, %average, "Consumer rate");
    }
}
