//! Prefetching reader that keeps the next work range ready for a compute
//! thread.
//!
//! A compute kernel runs on a dedicated OS thread and must not wait on the
//! network between ranges. [`QueueReader`] keeps exactly one range fetched
//! (and optionally preprocessed) ahead of the consumer, so in steady state
//! the consumer's `next()` returns immediately.
//!
//! # Architecture
//!
//! ```text
//!  control plane (tokio task)                 compute thread
//!  ┌────────────────────────────┐             ┌──────────────────┐
//!  │ ReaderTask                 │   Slot      │ RangeIter::next()│
//!  │  fetch ─► preprocess ─► put├──(1 item)──►│  blocks on empty │
//!  │  timing window, sizing     │◄────────────┤  RequestMore     │
//!  └────────────────────────────┘  channel    │  RanExecution    │
//!                                             └──────────────────┘
//! ```
//!
//! The task is the only mutator of the timing window and execution size.
//! The compute thread talks to it through an unbounded channel; the slot
//! (mutex + condvar) is the single hand-off point in the other direction.
//!
//! # Sizing
//!
//! Every completed range contributes its execution time to a window of the
//! three most recent samples. Once the window is full, the work-size
//! callback receives the mean of the two *oldest* samples together with the
//! size of the range just completed. The newest sample only influences sizing
//! one cycle later, which keeps a single noisy measurement from swinging the
//! range size back and forth.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, OptionFuture};
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;
use crate::types::HashRate;
use crate::work::WorkRange;

/// Number of execution-time samples retained for sizing.
pub const TIMING_WINDOW: usize = 3;

/// Where a reader gets its ranges and reports consumer speed.
#[async_trait]
pub trait RangeSource: Send + Sync + 'static {
    /// Fetch the next range, sized by `size` nonces when given, otherwise
    /// by the source's default. The size is a whole multiple of
    /// `work_factor`. `None` means the source has closed.
    async fn fetch_range(&self, size: Option<u64>, work_factor: u64) -> Option<WorkRange>;

    /// Instantaneous rate measured over one completed range.
    fn update_rate(&self, rate: HashRate);
}

/// Items handed to consumers must report how many hashes they represent so
/// the reader can derive a rate from the execution time.
pub trait HashCount {
    fn hash_count(&self) -> u64;
}

impl HashCount for WorkRange {
    fn hash_count(&self) -> u64 {
        WorkRange::hash_count(self)
    }
}

/// Tuning function: `(average execution seconds, completed size) -> next size`.
pub type WorkSizeFn = Box<dyn Fn(f64, u64) -> u64 + Send + Sync>;

type Preprocessor<T> = Arc<dyn Fn(WorkRange) -> T + Send + Sync>;

/// Bounded window of execution times and the size derived from it.
#[derive(Debug, Default)]
pub struct ExecutionTiming {
    samples: VecDeque<f64>,
    average: Option<f64>,
    execution_size: Option<u64>,
}

impl ExecutionTiming {
    /// Record one execution of `size` hashes that took `dt` seconds.
    ///
    /// Returns the new execution size if this sample caused a recompute.
    pub fn record(&mut self, dt: f64, size: u64, tune: Option<&WorkSizeFn>) -> Option<u64> {
        self.samples.push_back(dt);
        while self.samples.len() > TIMING_WINDOW {
            self.samples.pop_front();
        }
        if self.samples.len() < TIMING_WINDOW {
            return None;
        }

        let average = (self.samples[0] + self.samples[1]) / 2.0;
        self.average = Some(average);

        let tune = tune?;
        let next = tune(average, size);
        self.execution_size = Some(next);
        Some(next)
    }

    /// Lagged average behind the current size, once the window has filled.
    pub fn average(&self) -> Option<f64> {
        self.average
    }

    /// Size to request next; `None` until the window first fills.
    pub fn execution_size(&self) -> Option<u64> {
        self.execution_size
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

enum SlotState<T> {
    Empty,
    Ready(T),
    Terminated,
}

/// One-item hand-off between the control plane and a compute thread.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Empty)
    }

    /// Store an item. Dropped if the slot has been terminated.
    fn put(&self, item: T) {
        let mut state = self.state.lock();
        match *state {
            SlotState::Terminated => {}
            SlotState::Ready(_) => {
                debug_assert!(false, "refill while an item is buffered");
                *state = SlotState::Ready(item);
            }
            SlotState::Empty => {
                *state = SlotState::Ready(item);
                self.ready.notify_one();
            }
        }
    }

    /// Block until an item is available; `None` once terminated.
    fn take_blocking(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Empty) {
                SlotState::Ready(item) => return Some(item),
                SlotState::Terminated => {
                    *state = SlotState::Terminated;
                    return None;
                }
                SlotState::Empty => self.ready.wait(&mut state),
            }
        }
    }

    /// Discard any buffered item and wake all waiters with termination.
    fn terminate(&self) {
        *self.state.lock() = SlotState::Terminated;
        self.ready.notify_all();
    }
}

/// Messages from the compute thread (and the handle) to the reader task.
#[derive(Debug)]
enum ReaderMessage {
    RequestMore,
    RanExecution { elapsed: Duration, hashes: u64 },
}

/// Configures and spawns a [`QueueReader`].
pub struct QueueReaderBuilder<T> {
    source: Arc<dyn RangeSource>,
    preprocessor: Preprocessor<T>,
    work_size: Option<WorkSizeFn>,
    work_factor: u64,
    shutdown: CancellationToken,
}

impl QueueReaderBuilder<WorkRange> {
    /// Start building a reader over `source` that hands out raw ranges.
    pub fn new(source: Arc<dyn RangeSource>) -> Self {
        Self {
            source,
            preprocessor: Arc::new(|range| range),
            work_size: None,
            work_factor: 1,
            shutdown: CancellationToken::new(),
        }
    }
}

impl<T: HashCount + Send + 'static> QueueReaderBuilder<T> {
    /// Transform each fetched range before buffering it, so the compute
    /// thread receives kernel-ready data.
    pub fn preprocessor<U, F>(self, f: F) -> QueueReaderBuilder<U>
    where
        F: Fn(WorkRange) -> U + Send + Sync + 'static,
    {
        QueueReaderBuilder {
            source: self.source,
            preprocessor: Arc::new(f),
            work_size: self.work_size,
            work_factor: self.work_factor,
            shutdown: self.shutdown,
        }
    }

    /// Tune range sizes from execution timing.
    pub fn work_size<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, u64) -> u64 + Send + Sync + 'static,
    {
        self.work_size = Some(Box::new(f));
        self
    }

    /// Only hand out ranges whose size is a multiple of `factor`, for
    /// kernels that process nonces in fixed-size batches.
    pub fn work_factor(mut self, factor: u64) -> Self {
        self.work_factor = factor.max(1);
        self
    }

    /// Shut the reader down when `token` is cancelled.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Spawn the reader task on the current tokio runtime.
    ///
    /// Returns the control-side handle and the consumer-side iterator. The
    /// iterator belongs on the compute thread.
    pub fn spawn(self) -> (QueueReader, RangeIter<T>) {
        let slot = Arc::new(Slot::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task = ReaderTask {
            source: self.source,
            preprocessor: self.preprocessor,
            work_size: self.work_size,
            work_factor: self.work_factor,
            timing: ExecutionTiming::default(),
            slot: slot.clone(),
            control_rx,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(task.run());

        let reader = QueueReader {
            control_tx: control_tx.clone(),
            shutdown: self.shutdown,
            terminate: Arc::new({
                let slot = slot.clone();
                move || slot.terminate()
            }),
        };
        let iter = RangeIter {
            slot,
            control_tx,
            current: None,
            started_at: None,
        };
        (reader, iter)
    }
}

/// Control-side handle to a running reader.
#[derive(Clone)]
pub struct QueueReader {
    control_tx: mpsc::UnboundedSender<ReaderMessage>,
    shutdown: CancellationToken,
    terminate: Arc<dyn Fn() + Send + Sync>,
}

impl QueueReader {
    /// Trigger the first fetch. Called once the kernel is ready to consume.
    pub fn start(&self) {
        self.request_more();
    }

    /// Ask for a refill. A no-op while an item is buffered, a fetch is
    /// outstanding, or the reader has shut down.
    pub fn request_more(&self) {
        let _ = self.control_tx.send(ReaderMessage::RequestMore);
    }

    /// Stop the reader. Any buffered item is discarded and a consumer
    /// blocked in `next()` wakes up to `None`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        (self.terminate)();
    }
}

/// Consumer-side iterator; lives on the compute thread.
///
/// Each call to `next()` reports the previous range's execution time, then
/// blocks until the next item is ready and immediately asks for a refill.
pub struct RangeIter<T> {
    slot: Arc<Slot<T>>,
    control_tx: mpsc::UnboundedSender<ReaderMessage>,
    current: Option<u64>,
    started_at: Option<Instant>,
}

impl<T: HashCount> Iterator for RangeIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let now = Instant::now();
        if let (Some(hashes), Some(started_at)) = (self.current.take(), self.started_at) {
            let _ = self.control_tx.send(ReaderMessage::RanExecution {
                elapsed: now.duration_since(started_at),
                hashes,
            });
        }
        self.started_at = Some(now);

        // Usually already populated; blocks only if the network is behind.
        let item = self.slot.take_blocking()?;
        self.current = Some(item.hash_count());

        // The slot is empty again; restock it.
        let _ = self.control_tx.send(ReaderMessage::RequestMore);
        Some(item)
    }
}

struct ReaderTask<T> {
    source: Arc<dyn RangeSource>,
    preprocessor: Preprocessor<T>,
    work_size: Option<WorkSizeFn>,
    work_factor: u64,
    timing: ExecutionTiming,
    slot: Arc<Slot<T>>,
    control_rx: mpsc::UnboundedReceiver<ReaderMessage>,
    shutdown: CancellationToken,
}

impl<T: HashCount + Send + 'static> ReaderTask<T> {
    async fn run(mut self) {
        trace!("Reader started.");
        let mut fetch: Option<BoxFuture<'static, Option<WorkRange>>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                msg = self.control_rx.recv() => match msg {
                    Some(ReaderMessage::RequestMore) => {
                        if fetch.is_none() && self.slot.is_empty() {
                            fetch = Some(self.start_fetch());
                        }
                    }
                    Some(ReaderMessage::RanExecution { elapsed, hashes }) => {
                        self.ran_execution(elapsed, hashes);
                    }
                    None => break,
                },

                Some(range) = OptionFuture::from(fetch.as_mut()) => {
                    fetch = None;
                    match range {
                        Some(range) => {
                            let item = (self.preprocessor)(range);
                            self.slot.put(item);
                        }
                        None => {
                            debug!("Range source closed");
                            break;
                        }
                    }
                }
            }
        }

        self.slot.terminate();
        trace!("Reader stopped.");
    }

    fn start_fetch(&self) -> BoxFuture<'static, Option<WorkRange>> {
        let source = self.source.clone();
        let size = self.timing.execution_size();
        let work_factor = self.work_factor;
        Box::pin(async move { source.fetch_range(size, work_factor).await })
    }

    fn ran_execution(&mut self, elapsed: Duration, hashes: u64) {
        if let Some(rate) = HashRate::from_execution(hashes, elapsed) {
            self.source.update_rate(rate);
        }

        let dt = elapsed.as_secs_f64();
        if let Some(size) = self.timing.record(dt, hashes, self.work_size.as_ref()) {
            trace!(
                size,
                average_secs = self.timing.average().unwrap_or_default(),
                "Execution size updated"
            );
        }
    }
}
