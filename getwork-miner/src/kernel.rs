//! Services a compute kernel uses from its own thread.
//!
//! Kernels pull ranges from a [`RangeIter`](crate::queue_reader::RangeIter)
//! and hand candidate nonces to a [`NonceReporter`], which re-checks each one
//! against the work's target before it goes to the coordinator. The CPU
//! kernel the daemon runs by default lives here as well.

use crate::getwork::ClientHandle;
use crate::queue_reader::RangeIter;
use crate::tracing::prelude::*;
use crate::work::WorkRange;

/// What became of a candidate nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The hash misses the target; nothing was submitted
    Invalid,
    Accepted,
    Rejected,
}

/// Submits the nonces a kernel finds.
#[derive(Debug, Clone)]
pub struct NonceReporter {
    client: ClientHandle,
}

impl NonceReporter {
    pub fn new(client: ClientHandle) -> Self {
        Self { client }
    }

    /// Check `nonce` against the target of the work `range` came from and
    /// submit the completed header if it qualifies.
    ///
    /// Blocks until the coordinator answers. Call from a kernel thread,
    /// never from inside the async runtime.
    pub fn found_nonce(&self, range: &WorkRange, nonce: u32) -> Verdict {
        let work = &range.work;
        let mut hash = work.hash(nonce);
        if !work.meets_target(&hash) {
            // Hardware errors land here.
            debug!(nonce, "Nonce does not meet target");
            return Verdict::Invalid;
        }

        let accepted = self
            .client
            .submit_blocking(work.result_header(nonce).to_vec());
        hash.reverse();
        let hash = hex::encode(hash);
        if accepted {
            info!(%hash, "Result accepted");
            Verdict::Accepted
        } else {
            warn!(%hash, "Result rejected");
            Verdict::Rejected
        }
    }
}

/// Search every range `ranges` yields on this thread, reporting hits.
pub fn cpu_kernel(id: usize, ranges: RangeIter<WorkRange>, reporter: NonceReporter) {
    debug!(id, "Kernel thread started");
    for range in ranges {
        let start = u64::from(range.base);
        for nonce in start..start + range.size {
            // Ranges never extend past the 32-bit nonce space.
            let nonce = nonce as u32;
            if range.work.meets_target(&range.work.hash(nonce)) {
                reporter.found_nonce(&range, nonce);
            }
        }
    }
    debug!(id, "Kernel thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::getwork::connection::mock::{self, MockServer};
    use crate::getwork::{Channel, ClientEvent, ProtocolClient};
    use crate::queue_reader::{QueueReaderBuilder, RangeSource};
    use crate::types::HashRate;
    use crate::work::{encode_result, genesis_work};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// A connected client whose poll timer stays quiet for the test.
    async fn connected() -> (NonceReporter, MockServer, mpsc::Receiver<ClientEvent>) {
        let (connector, mut server) = mock::pair();
        let (event_tx, mut events) = mpsc::channel(16);
        let pool = PoolConfig::parse("http://u:p@pool.test/;askrate=3600").unwrap();
        let (client, handle) =
            ProtocolClient::with_connector(pool, connector, event_tx, CancellationToken::new())
                .unwrap();
        tokio::spawn(client.run());

        handle.connect().await.unwrap();
        server.next().await.respond(mock::work_response());
        assert_eq!(events.recv().await, Some(ClientEvent::Connect));
        (NonceReporter::new(handle), server, events)
    }

    fn genesis_range() -> (WorkRange, u32) {
        let (work, nonce) = genesis_work();
        let range = WorkRange {
            work: Arc::new(work),
            base: 0,
            size: 1 << 32,
        };
        (range, nonce)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_found_nonce_submits_completed_header() {
        let (reporter, mut server, _events) = connected().await;
        let (range, nonce) = genesis_range();
        let expected = encode_result(&range.work.result_header(nonce)).unwrap();

        let verdict = tokio::task::spawn_blocking(move || reporter.found_nonce(&range, nonce));

        let submit = server.next().await;
        assert_eq!(submit.channel, Channel::Submit);
        assert_eq!(submit.body_json()["params"][0], expected.as_str());
        submit.respond(mock::response(200, r#"{"result": true, "error": null}"#));

        assert_eq!(verdict.await.unwrap(), Verdict::Accepted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_found_nonce_reports_rejection() {
        let (reporter, mut server, _events) = connected().await;
        let (range, nonce) = genesis_range();

        let verdict = tokio::task::spawn_blocking(move || reporter.found_nonce(&range, nonce));
        server
            .next()
            .await
            .respond(mock::response(200, r#"{"result": false, "error": null}"#));

        assert_eq!(verdict.await.unwrap(), Verdict::Rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nonce_missing_target_is_not_submitted() {
        let (reporter, mut server, _events) = connected().await;
        let (range, nonce) = genesis_range();

        let verdict =
            tokio::task::spawn_blocking(move || reporter.found_nonce(&range, nonce ^ 1));
        assert_eq!(verdict.await.unwrap(), Verdict::Invalid);
        assert!(server.try_next().is_none());
    }

    /// Hands out one range, then closes.
    struct OneRange(Mutex<Option<WorkRange>>);

    #[async_trait]
    impl RangeSource for OneRange {
        async fn fetch_range(&self, _size: Option<u64>, _work_factor: u64) -> Option<WorkRange> {
            self.0.lock().take()
        }

        fn update_rate(&self, _rate: HashRate) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cpu_kernel_submits_what_it_finds() {
        let (reporter, mut server, _events) = connected().await;
        let (work, nonce) = genesis_work();
        let range = WorkRange {
            work: Arc::new(work),
            base: nonce - 15,
            size: 32,
        };

        let source = Arc::new(OneRange(Mutex::new(Some(range))));
        let (reader, ranges) = QueueReaderBuilder::new(source).spawn();
        reader.start();
        let kernel = tokio::task::spawn_blocking(move || cpu_kernel(0, ranges, reporter));

        let submit = server.next().await;
        assert_eq!(submit.channel, Channel::Submit);
        submit.respond(mock::response(200, r#"{"result": true, "error": null}"#));

        // The source closes after one range, which ends the kernel loop.
        kernel.await.unwrap();
        assert!(server.try_next().is_none());
    }
}
