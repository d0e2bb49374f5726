//! Periodic work polling.
//!
//! The poller owns the fetch connection and at most one outstanding getwork
//! request. A timer fires `ask` at the current interval; the client changes
//! the interval as the session moves between connected, failing and
//! long-polling. Every completed ask, successful or not, re-arms the timer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::HeaderMap;
use tokio::time::{self, Instant};

use super::connection::{Channel, Connection, Connector, Endpoint};
use super::error::GetworkResult;
use super::messages::{parse_work, JsonRpcRequest};
use crate::config::REQUEST_TIMEOUT;
use crate::tracing::prelude::*;
use crate::work::AssignedWork;

/// Result of one ask: response headers and the work, if the coordinator had
/// any.
pub type PollOutcome = GetworkResult<(HeaderMap, Option<AssignedWork>)>;

type AskFuture = BoxFuture<'static, (Connection, PollOutcome)>;

pub struct PollCoordinator {
    connector: Arc<dyn Connector>,
    /// Idle fetch connection; moved into the ask future while one runs
    connection: Option<Connection>,
    interval: Option<Duration>,
    deadline: Option<Instant>,
    in_flight: Option<AskFuture>,
    endpoint: Endpoint,
    active: bool,
}

impl PollCoordinator {
    pub fn new(connector: Arc<dyn Connector>, endpoint: Endpoint) -> Self {
        Self {
            connector,
            connection: None,
            interval: None,
            deadline: None,
            in_flight: None,
            endpoint,
            active: false,
        }
    }

    /// Allow asks and timers. Polling begins with the next `ask` or
    /// `set_interval`.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Stop polling: cancel the timer, abandon any outstanding ask and close
    /// the fetch connection.
    pub fn stop(&mut self) {
        self.active = false;
        self.deadline = None;
        self.in_flight = None;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Replace the identity used by subsequent asks.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = endpoint;
    }

    /// Change the poll interval. `None` or zero disables periodic polling.
    pub fn set_interval(&mut self, interval: Option<Duration>) {
        self.interval = interval.filter(|i| !i.is_zero());
        self.rearm();
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether an ask is outstanding.
    pub fn is_asking(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Ask for work now. A no-op while another ask is outstanding.
    pub fn ask(&mut self) {
        if !self.active || self.in_flight.is_some() {
            return;
        }
        self.deadline = None;

        let mut connection = self.connection.take().unwrap_or_else(|| {
            Connection::open(&self.connector, Channel::Fetch, REQUEST_TIMEOUT)
        });
        let endpoint = self.endpoint.clone();

        trace!(url = %endpoint.url, "Asking for work");
        self.in_flight = Some(
            async move {
                let outcome = fetch(&mut connection, &endpoint).await;
                (connection, outcome)
            }
            .boxed(),
        );
    }

    /// Drive the timer and the outstanding ask, returning when an ask
    /// completes. Pending forever while idle with no timer armed.
    ///
    /// Cancel safe: dropping the returned future keeps the ask and the
    /// timer in place.
    pub async fn wait(&mut self) -> PollOutcome {
        loop {
            if let Some(ask) = self.in_flight.as_mut() {
                let (connection, outcome) = ask.await;
                self.in_flight = None;
                self.connection = Some(connection);
                self.rearm();
                return outcome;
            }

            match self.deadline {
                Some(deadline) => {
                    time::sleep_until(deadline).await;
                    self.deadline = None;
                    self.ask();
                }
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn rearm(&mut self) {
        self.deadline = match self.interval {
            Some(interval) if self.active && self.in_flight.is_none() => {
                Some(Instant::now() + interval)
            }
            _ => None,
        };
    }
}

async fn fetch(connection: &mut Connection, endpoint: &Endpoint) -> PollOutcome {
    let (headers, result) = connection
        .call(endpoint, &JsonRpcRequest::getwork(None))
        .await?;
    match result.as_ref().map(parse_work).transpose() {
        Ok(work) => Ok((headers, work)),
        Err(e) => {
            connection.close();
            Err(e)
        }
    }
}
