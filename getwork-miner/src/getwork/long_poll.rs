//! Long-poll subscription.
//!
//! A coordinator that advertises `X-Long-Polling` holds a GET to that URL
//! open until it has new work. The subscriber runs as its own task with its
//! own connection, re-issuing the request after every answer so the
//! subscription lasts for the whole session. Answers are posted back to the
//! client actor tagged with a generation number; the actor drops answers
//! from subscriptions it has already replaced.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{Channel, Connection, Connector, Endpoint};
use super::error::{GetworkError, GetworkResult};
use super::messages::{parse_response, parse_work};
use crate::config::LONG_POLL_TIMEOUT;
use crate::tracing::prelude::*;
use crate::work::AssignedWork;

/// Pause after a failed exchange, so a refused connection or a redirect
/// loop does not spin.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

/// One answer from a long-poll subscription.
#[derive(Debug)]
pub struct LongPollOutcome {
    pub generation: u64,
    pub result: GetworkResult<Option<AssignedWork>>,
}

/// Handle to a running long-poll task.
pub struct LongPollSubscriber {
    url: Url,
    generation: u64,
    cancel: CancellationToken,
}

impl LongPollSubscriber {
    /// Start polling `endpoint` on a new connection.
    ///
    /// The task stops when [`stop`](Self::stop) is called, when `parent` is
    /// cancelled, or when the outcome receiver is dropped.
    pub fn start(
        connector: &Arc<dyn Connector>,
        endpoint: Endpoint,
        generation: u64,
        outcomes: mpsc::UnboundedSender<LongPollOutcome>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let connection = Connection::open(connector, Channel::LongPoll, LONG_POLL_TIMEOUT);
        let url = endpoint.url.clone();

        debug!(%url, generation, "Starting long poll");
        tokio::spawn(run(connection, endpoint, generation, outcomes, cancel.clone()));

        Self {
            url,
            generation,
            cancel,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop the subscription. Its connection closes and any answer already
    /// in transit is discarded by generation.
    pub fn stop(self) {
        debug!(url = %self.url, generation = self.generation, "Stopping long poll");
        self.cancel.cancel();
    }
}

impl Drop for LongPollSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut connection: Connection,
    endpoint: Endpoint,
    generation: u64,
    outcomes: mpsc::UnboundedSender<LongPollOutcome>,
    cancel: CancellationToken,
) {
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = connection.request(endpoint.get()) => response,
        };

        let result = response.and_then(|response| {
            let result = parse_response(&response.body)?;
            result.as_ref().map(parse_work).transpose()
        });

        // Failures that would repeat on an immediate retry.
        let backoff = matches!(
            result,
            Err(GetworkError::Transport(_)
                | GetworkError::Unauthorized
                | GetworkError::TooManyRedirects
                | GetworkError::InvalidUrl(_))
        );
        if outcomes.send(LongPollOutcome { generation, result }).is_err() {
            break;
        }

        if backoff {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TRANSPORT_BACKOFF) => {}
            }
        }
    }
    connection.close();
    trace!(generation, "Long poll task exited");
}
