//! Daemon lifecycle management for getwork-miner.
//!
//! This module wires the protocol client, the shared work queue and one
//! prefetching reader per compute thread together, then runs until SIGINT
//! or SIGTERM.
//!
//! Each thread runs the portable CPU kernel from [`crate::kernel`]. Range
//! sizes follow its measured speed.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::getwork::{ClientEvent, ProtocolClient};
use crate::kernel::{cpu_kernel, NonceReporter};
use crate::queue_reader::{QueueReader, QueueReaderBuilder};
use crate::tracing::prelude::*;
use crate::work::WorkQueue;

/// Client event queue depth.
const EVENT_CAPACITY: usize = 100;

/// Execution time each range is sized to hit.
const TARGET_EXECUTION_SECS: f64 = 1.0;

/// Bounds on the range size asked of the work queue.
const MIN_RANGE_SIZE: u64 = 1 << 16;
const MAX_RANGE_SIZE: u64 = 1 << 32;

/// The main daemon that coordinates all mining operations.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let pool = self.config.pool_config()?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let (client, handle) = ProtocolClient::new(pool, event_tx, self.shutdown.clone())?;
        self.tracker.spawn(client.run());

        let queue = Arc::new(WorkQueue::new(Some(handle.clone())));
        self.tracker
            .spawn(forward_events(event_rx, queue.clone(), self.shutdown.clone()));

        let mut readers = Vec::new();
        let mut kernels = Vec::new();
        for id in 0..self.config.kernel.threads {
            let (reader, ranges) = QueueReaderBuilder::new(queue.clone())
                .work_size(tune_range_size)
                .work_factor(self.config.kernel.work_factor)
                .shutdown_token(self.shutdown.child_token())
                .spawn();
            let reporter = NonceReporter::new(handle.clone());
            let kernel = thread::Builder::new()
                .name(format!("kernel-{}", id))
                .spawn(move || cpu_kernel(id, ranges, reporter))
                .with_context(|| format!("spawning kernel thread {}", id))?;
            reader.start();
            readers.push(reader);
            kernels.push(kernel);
        }
        self.tracker.close();

        handle.connect().await?;
        info!(threads = self.config.kernel.threads, "Started.");
        info!(
            "For protocol debugging, set RUST_LOG=getwork_miner::getwork=trace \
             to see every request and response"
        );

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        // Initiate shutdown
        trace!("Shutting down.");
        if let Err(e) = handle.disconnect().await {
            debug!(error = %e, "Client already stopped");
        }
        self.shutdown.cancel();
        queue.close();
        readers.iter().for_each(QueueReader::shutdown);

        // Wait for all tasks and kernel threads to complete
        self.tracker.wait().await;
        tokio::task::spawn_blocking(move || {
            for kernel in kernels {
                if kernel.join().is_err() {
                    error!("Kernel thread panicked");
                }
            }
        })
        .await?;

        info!(hashrate = %queue.hashrate(), "Exiting.");
        Ok(())
    }
}

/// Hand work to the queue and log everything else the client reports.
async fn forward_events(
    mut events: mpsc::Receiver<ClientEvent>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ClientEvent::Work(work) => queue.store_work(work),
            ClientEvent::Push(_) => debug!("Work pushed by long poll"),
            ClientEvent::Connect => info!("Connected to coordinator"),
            ClientEvent::Disconnect => warn!("Lost connection to coordinator"),
            ClientEvent::Failure => warn!("Failed to connect to coordinator"),
            ClientEvent::Block(height) => info!(height, "New block"),
            ClientEvent::LongPoll(true) => info!("Long polling active"),
            ClientEvent::LongPoll(false) => info!("Long polling inactive"),
            // Already logged by the client.
            ClientEvent::Debug(_) | ClientEvent::Msg(_) => {}
        }
    }
}

/// Size the next range so it takes about [`TARGET_EXECUTION_SECS`] at the
/// speed the last ones ran.
fn tune_range_size(average_secs: f64, size: u64) -> u64 {
    if average_secs <= 0.0 {
        return size.clamp(MIN_RANGE_SIZE, MAX_RANGE_SIZE);
    }
    let scaled = size as f64 * TARGET_EXECUTION_SECS / average_secs;
    (scaled as u64).clamp(MIN_RANGE_SIZE, MAX_RANGE_SIZE)
}
