//! Getwork protocol client.
//!
//! [`ProtocolClient`] is an actor: one task owns every piece of session
//! state (poll timer, long-poll subscription, submission queue, block
//! height) and reacts to commands from [`ClientHandle`]s, completed
//! exchanges and long-poll answers. The application sees the session only
//! through [`ClientEvent`]s.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::connection::{Connector, Endpoint, HttpConnector};
use super::error::{GetworkError, GetworkResult};
use super::long_poll::{LongPollOutcome, LongPollSubscriber};
use super::messages::{ClientCommand, ClientEvent, X_BLOCKNUM, X_LONG_POLLING};
use super::poller::{PollCoordinator, PollOutcome};
use super::submit::{Completion, SubmissionPipeline};
use crate::config::{PoolConfig, Rate};
use crate::tracing::prelude::*;
use crate::work::AssignedWork;

/// Command queue depth between handles and the actor.
const COMMAND_CAPACITY: usize = 64;

/// Cloneable handle for talking to a running [`ProtocolClient`].
#[derive(Clone, Debug)]
pub struct ClientHandle {
    commands: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    async fn send(&self, command: ClientCommand) -> GetworkResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GetworkError::Disconnected)
    }

    /// Begin communicating with the coordinator.
    pub async fn connect(&self) -> GetworkResult<()> {
        self.send(ClientCommand::Connect).await
    }

    /// Cease communication. Pending submissions resolve as rejected and no
    /// further events are emitted until the next `connect`.
    pub async fn disconnect(&self) -> GetworkResult<()> {
        self.send(ClientCommand::Disconnect).await
    }

    /// Ask for work immediately rather than waiting for the poll timer.
    pub async fn request_work(&self) -> GetworkResult<()> {
        self.send(ClientCommand::RequestWork).await
    }

    /// Submit a result and wait for the coordinator's verdict.
    ///
    /// Returns `false` for rejections and for every kind of failure.
    pub async fn submit(&self, result: Vec<u8>) -> bool {
        let (reply, verdict) = oneshot::channel();
        if self
            .send(ClientCommand::Submit { result, reply })
            .await
            .is_err()
        {
            return false;
        }
        verdict.await.unwrap_or(false)
    }

    /// [`submit`](Self::submit) for compute threads outside the runtime.
    pub fn submit_blocking(&self, result: Vec<u8>) -> bool {
        let (reply, verdict) = oneshot::channel();
        if self
            .commands
            .blocking_send(ClientCommand::Submit { result, reply })
            .is_err()
        {
            return false;
        }
        verdict.blocking_recv().unwrap_or(false)
    }

    /// Change the advertised client version (`User-Agent`).
    pub async fn set_version(&self, shortname: &str, version: Option<&str>) -> GetworkResult<()> {
        self.send(ClientCommand::SetVersion {
            shortname: shortname.to_string(),
            version: version.map(str::to_string),
        })
        .await
    }
}

/// What woke the actor.
enum Step {
    Shutdown,
    Command(Option<ClientCommand>),
    Poll(PollOutcome),
    LongPoll(LongPollOutcome),
    Submitted(Completion),
}

/// The protocol client actor.
pub struct ProtocolClient {
    pool: PoolConfig,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ClientEvent>,
    commands: mpsc::Receiver<ClientCommand>,
    shutdown: CancellationToken,

    poller: PollCoordinator,
    submissions: SubmissionPipeline,
    long_poll: Option<LongPollSubscriber>,
    long_poll_generation: u64,
    long_poll_tx: mpsc::UnboundedSender<LongPollOutcome>,
    long_poll_rx: mpsc::UnboundedReceiver<LongPollOutcome>,

    /// Between `connect` and `disconnect`
    active: bool,
    /// The application has been told `Connect` for this session
    said_connected: bool,
    block: Option<u64>,
}

impl ProtocolClient {
    /// Create a client talking HTTP to the coordinator in `pool`.
    pub fn new(
        pool: PoolConfig,
        events: mpsc::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> GetworkResult<(Self, ClientHandle)> {
        Self::with_connector(pool, Arc::new(HttpConnector), events, shutdown)
    }

    /// Create a client whose connections come from `connector`.
    pub fn with_connector(
        pool: PoolConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> GetworkResult<(Self, ClientHandle)> {
        let endpoint = Endpoint::from_pool(&pool)?;
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (long_poll_tx, long_poll_rx) = mpsc::unbounded_channel();

        let client = Self {
            poller: PollCoordinator::new(connector.clone(), endpoint.clone()),
            submissions: SubmissionPipeline::new(connector.clone()),
            pool,
            endpoint,
            connector,
            events,
            commands,
            shutdown,
            long_poll: None,
            long_poll_generation: 0,
            long_poll_tx,
            long_poll_rx,
            active: false,
            said_connected: false,
            block: None,
        };
        let handle = ClientHandle {
            commands: command_tx,
        };
        Ok((client, handle))
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!(url = %self.pool.url, "Protocol client started");
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Step::Shutdown,
                command = self.commands.recv() => Step::Command(command),
                outcome = self.poller.wait() => Step::Poll(outcome),
                Some(outcome) = self.long_poll_rx.recv() => Step::LongPoll(outcome),
                completion = self.submissions.wait() => Step::Submitted(completion),
            };

            match step {
                Step::Shutdown | Step::Command(None) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Poll(outcome) => self.handle_poll(outcome).await,
                Step::LongPoll(outcome) => self.handle_long_poll(outcome).await,
                Step::Submitted(completion) => self.handle_submitted(completion).await,
            }
        }

        self.disconnect();
        debug!("Protocol client stopped");
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect => self.connect(),
            ClientCommand::Disconnect => self.disconnect(),
            ClientCommand::RequestWork => self.poller.ask(),
            ClientCommand::Submit { result, reply } => {
                if self.active {
                    self.submissions
                        .submit(&result, self.endpoint.clone(), reply);
                } else {
                    debug!("Submission while disconnected");
                    let _ = reply.send(false);
                }
            }
            ClientCommand::SetVersion { shortname, version } => {
                self.pool.set_version(&shortname, version.as_deref());
                match Endpoint::from_pool(&self.pool) {
                    Ok(endpoint) => {
                        self.poller.set_endpoint(endpoint.clone());
                        self.endpoint = endpoint;
                    }
                    Err(e) => warn!(error = %e, "Ignoring client version"),
                }
            }
        }
    }

    fn connect(&mut self) {
        if self.active {
            return;
        }
        info!(url = %self.pool.url, "Connecting");
        self.active = true;
        self.said_connected = false;
        self.poller.activate();
        self.poller.ask();
    }

    /// Tear the session down silently.
    fn disconnect(&mut self) {
        if !self.active {
            return;
        }
        info!("Disconnecting");
        self.active = false;
        self.poller.set_interval(None);
        self.poller.stop();
        if let Some(subscriber) = self.long_poll.take() {
            subscriber.stop();
        }
        self.submissions.reject_all();
    }

    async fn emit(&mut self, event: ClientEvent) {
        if !self.active {
            return;
        }
        match &event {
            ClientEvent::Debug(text) => debug!("{}", text),
            ClientEvent::Msg(text) => info!(message = %text, "Coordinator says"),
            ClientEvent::Work(_) | ClientEvent::Push(_) => trace!(?event, "Client event"),
            _ => debug!(?event, "Client event"),
        }
        if self.events.send(event).await.is_err() {
            trace!("Event receiver gone");
        }
    }

    fn use_rate(&mut self, rate: Rate) {
        let interval = self.pool.interval(rate);
        trace!(?rate, ?interval, "Poll interval");
        self.poller.set_interval(Some(interval));
    }

    async fn handle_poll(&mut self, outcome: PollOutcome) {
        match outcome {
            Ok((headers, work)) => {
                match work {
                    Some(work) => self.handle_work(work, false).await,
                    // Nothing has set an interval yet this session.
                    None if !self.said_connected => self.use_rate(Rate::Retry),
                    None => {}
                }
                self.handle_headers(&headers).await;
            }
            Err(e) => {
                warn!(error = %e, "Getwork request failed");
                if e.is_server_message() {
                    self.emit(ClientEvent::Msg(e.to_string())).await;
                } else {
                    self.emit(ClientEvent::Debug(e.to_string())).await;
                }
                self.failure().await;
            }
        }
    }

    async fn handle_work(&mut self, work: AssignedWork, pushed: bool) {
        if !self.said_connected {
            self.said_connected = true;
            self.emit(ClientEvent::Connect).await;
            self.use_rate(Rate::Ask);
        }

        if let Some(block) = work.block {
            self.note_block(block).await;
        }

        if pushed {
            self.emit(ClientEvent::Push(work.clone())).await;
        }
        self.emit(ClientEvent::Work(work)).await;
    }

    async fn note_block(&mut self, block: u64) {
        if self.block != Some(block) {
            self.block = Some(block);
            self.emit(ClientEvent::Block(block)).await;
        }
    }

    async fn handle_headers(&mut self, headers: &HeaderMap) {
        let block = headers
            .get(X_BLOCKNUM)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(block) = block {
            self.note_block(block).await;
        }

        let advertised = headers
            .get(X_LONG_POLLING)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        let Some(advertised) = advertised else {
            if let Some(subscriber) = self.long_poll.take() {
                subscriber.stop();
                self.use_rate(Rate::Ask);
                self.emit(ClientEvent::LongPoll(false)).await;
            }
            return;
        };

        let url = match long_poll_url(&self.pool.url, advertised) {
            Ok(url) => url,
            Err(e) => {
                self.emit(ClientEvent::Debug(e.to_string())).await;
                return;
            }
        };

        if self.long_poll.as_ref().is_some_and(|s| s.url() != &url) {
            if let Some(subscriber) = self.long_poll.take() {
                subscriber.stop();
            }
        }
        if self.long_poll.is_none() {
            self.long_poll_generation += 1;
            self.long_poll = Some(LongPollSubscriber::start(
                &self.connector,
                self.endpoint.with_url(url),
                self.long_poll_generation,
                self.long_poll_tx.clone(),
                &self.shutdown,
            ));
            self.use_rate(Rate::LongPollAsk);
            self.emit(ClientEvent::LongPoll(true)).await;
        }
    }

    async fn failure(&mut self) {
        if self.said_connected {
            self.said_connected = false;
            self.emit(ClientEvent::Disconnect).await;
        } else {
            self.emit(ClientEvent::Failure).await;
        }
        self.use_rate(Rate::Retry);
        if let Some(subscriber) = self.long_poll.take() {
            subscriber.stop();
            self.emit(ClientEvent::LongPoll(false)).await;
        }
    }

    async fn handle_long_poll(&mut self, outcome: LongPollOutcome) {
        let current = self
            .long_poll
            .as_ref()
            .is_some_and(|s| s.generation() == outcome.generation);
        if !current {
            trace!(generation = outcome.generation, "Discarding stale long-poll answer");
            return;
        }

        match outcome.result {
            Ok(Some(work)) => self.handle_work(work, true).await,
            Ok(None) => {}
            Err(e) if e.is_server_message() => self.emit(ClientEvent::Msg(e.to_string())).await,
            Err(e) if e.is_malformed() => trace!(error = %e, "Ignoring malformed long-poll answer"),
            Err(e) => {
                self.emit(ClientEvent::Debug(format!("Long poll: {}", e)))
                    .await
            }
        }
    }

    async fn handle_submitted(&mut self, completion: Completion) {
        if let Some(e) = completion.error {
            warn!(error = %e, "Submission failed");
            self.emit(ClientEvent::Debug(format!("Submission failed: {}", e)))
                .await;
        } else if let Some(reason) = completion.reject_reason {
            self.emit(ClientEvent::Debug(format!("Reject reason: {}", reason)))
                .await;
        }
    }
}

/// Resolve an advertised long-poll location. Scheme and host default to the
/// coordinator's; the path is taken as given, never relative to the
/// coordinator's own path.
fn long_poll_url(base: &Url, advertised: &str) -> GetworkResult<Url> {
    let absolute = advertised.starts_with('/') || advertised.contains("://");
    let joined = if absolute {
        base.join(advertised)
    } else {
        base.join(&format!("/{}", advertised))
    };
    let mut url = joined.map_err(|e| GetworkError::InvalidUrl(format!("{:?}: {}", advertised, e)))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::getwork::connection::mock::{self, MockExchange, MockServer};
    use crate::getwork::connection::{Channel, HttpResponse};
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;
    use test_case::test_case;
    use tokio::time::Instant;

    struct Harness {
        handle: ClientHandle,
        server: MockServer,
        events: mpsc::Receiver<ClientEvent>,
        shutdown: CancellationToken,
    }

    fn start(url: &str) -> Harness {
        let (connector, server) = mock::pair();
        let (event_tx, events) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let pool = PoolConfig::parse(url).unwrap();
        let (client, handle) =
            ProtocolClient::with_connector(pool, connector, event_tx, shutdown.clone()).unwrap();
        tokio::spawn(client.run());
        Harness {
            handle,
            server,
            events,
            shutdown,
        }
    }

    impl Harness {
        async fn event(&mut self) -> ClientEvent {
            tokio::time::timeout(Duration::from_secs(24 * 3600), self.events.recv())
                .await
                .expect("no event")
                .expect("client stopped")
        }

        /// Next event, skipping work deliveries.
        async fn event_skipping_work(&mut self) -> ClientEvent {
            loop {
                match self.event().await {
                    ClientEvent::Work(_) | ClientEvent::Push(_) => continue,
                    event => return event,
                }
            }
        }

        async fn next_on(&mut self, channel: Channel) -> MockExchange {
            let exchange = self.server.next().await;
            assert_eq!(exchange.channel, channel, "unexpected {:?}", exchange.request);
            exchange
        }

        async fn settle(&self) {
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }
    }

    fn work_with(headers: &[(&'static str, &str)]) -> HttpResponse {
        headers
            .iter()
            .fold(mock::work_response(), |r, &(k, v)| mock::with_header(r, k, v))
    }

    fn work_in_block(block: &str) -> HttpResponse {
        let body = json!({
            "result": {"data": "00".repeat(80), "target": "ff".repeat(32), "block": block},
            "error": null,
        });
        mock::response(200, body.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_emits_connect_then_work() {
        let mut h = start("http://worker:pw@pool.test:8332/");
        h.handle.connect().await.unwrap();

        let exchange = h.next_on(Channel::Fetch).await;
        assert_eq!(exchange.request.method, Method::POST);
        assert_eq!(
            exchange.request.headers.get("authorization").unwrap(),
            "Basic d29ya2VyOnB3"
        );
        assert!(exchange.request.headers.contains_key("user-agent"));
        exchange.respond(mock::work_response());

        assert_eq!(h.event().await, ClientEvent::Connect);
        assert!(matches!(h.event().await, ClientEvent::Work(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_then_disconnect() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .fail(GetworkError::Transport("refused".into()));
        assert!(matches!(h.event().await, ClientEvent::Debug(_)));
        assert_eq!(h.event().await, ClientEvent::Failure);

        // Retry comes after retryrate (default 15 s).
        let started = Instant::now();
        let retry = h.next_on(Channel::Fetch).await;
        assert!(Instant::now() - started >= Duration::from_secs(15));
        retry.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);
        assert!(matches!(h.event().await, ClientEvent::Work(_)));

        // Next poll after askrate (10 s) fails: now it is a disconnect.
        h.next_on(Channel::Fetch).await.respond(mock::response(401, ""));
        assert!(matches!(h.event().await, ClientEvent::Debug(_)));
        assert_eq!(h.event().await, ClientEvent::Disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_askrate_from_url() {
        let mut h = start("http://u:p@pool.test/;askrate=3");
        h.handle.connect().await.unwrap();
        h.next_on(Channel::Fetch).await.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);

        let started = Instant::now();
        let _poll = h.next_on(Channel::Fetch).await;
        let elapsed = Instant::now() - started;
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_message_is_msg() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();

        let body = json!({"result": null, "error": {"code": -1, "message": "Bad worker"}});
        h.next_on(Channel::Fetch)
            .await
            .respond(mock::response(500, body.to_string()));
        assert_eq!(h.event().await, ClientEvent::Msg("Bad worker".into()));
        assert_eq!(h.event().await, ClientEvent::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_first_poll_is_retried() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();

        let body = json!({"result": null, "error": null});
        h.next_on(Channel::Fetch)
            .await
            .respond(mock::response(200, body.to_string()));

        // No work and no session yet: try again after retryrate (15 s).
        let started = Instant::now();
        let retry = h.next_on(Channel::Fetch).await;
        let elapsed = Instant::now() - started;
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));

        retry.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);
        assert!(matches!(h.event().await, ClientEvent::Work(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_header_dedup() {
        let mut h = start("http://u:p@pool.test/;askrate=1");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-blocknum", "100")]));
        assert_eq!(h.event_skipping_work().await, ClientEvent::Connect);
        assert_eq!(h.event_skipping_work().await, ClientEvent::Block(100));

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-blocknum", "100")]));
        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-blocknum", "101")]));
        assert_eq!(h.event_skipping_work().await, ClientEvent::Block(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_field_dedup() {
        let mut h = start("http://u:p@pool.test/;askrate=1");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch).await.respond(work_in_block("7"));
        assert_eq!(h.event().await, ClientEvent::Connect);
        assert_eq!(h.event().await, ClientEvent::Block(7));
        assert!(matches!(h.event().await, ClientEvent::Work(_)));

        h.next_on(Channel::Fetch).await.respond(work_in_block("7"));
        assert!(matches!(h.event().await, ClientEvent::Work(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_push_and_interval() {
        let mut h = start("http://u:p@pool.test:8332/");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-long-polling", "/lp")]));
        assert_eq!(h.event_skipping_work().await, ClientEvent::Connect);
        assert_eq!(h.event_skipping_work().await, ClientEvent::LongPoll(true));

        let lp = h.next_on(Channel::LongPoll).await;
        assert_eq!(lp.request.method, Method::GET);
        assert_eq!(lp.request.url.as_str(), "http://pool.test:8332/lp");
        assert!(lp.request.headers.contains_key("authorization"));
        lp.respond(mock::work_response());

        assert!(matches!(h.event().await, ClientEvent::Push(_)));
        assert!(matches!(h.event().await, ClientEvent::Work(_)));

        // lpaskrate defaults to 0: with the subscription up, no polls happen.
        let again = h.next_on(Channel::LongPoll).await;
        let quiet = tokio::time::timeout(Duration::from_secs(3600), h.server.next()).await;
        assert!(quiet.is_err());
        drop(again);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_url_churn() {
        let mut h = start("http://u:p@pool.test/;lpaskrate=5");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-long-polling", "/lp1")]));
        let first = h.next_on(Channel::LongPoll).await;
        assert_eq!(first.request.url.path(), "/lp1");
        let first_id = first.transport_id;

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-long-polling", "http://other.test/lp2")]));
        let second = h.next_on(Channel::LongPoll).await;
        assert_eq!(second.request.url.as_str(), "http://other.test/lp2");
        assert_ne!(second.transport_id, first_id);

        h.settle().await;
        assert!(h.server.ledger.closed.lock().contains(&first_id));

        // An answer on the old subscription goes nowhere.
        first.respond(mock::work_response());
        h.settle().await;
        let mut saw_push = false;
        while let Ok(event) = h.events.try_recv() {
            saw_push |= matches!(event, ClientEvent::Push(_));
        }
        assert!(!saw_push);
        assert!(h
            .server
            .try_next()
            .map_or(true, |e| e.transport_id != first_id));
    }

    #[test_case("/lp", "http://pool.test:8332/lp"; "absolute path")]
    #[test_case("lp", "http://pool.test:8332/lp"; "bare path stays at the root")]
    #[test_case("lp?id=3#frag", "http://pool.test:8332/lp?id=3"; "query kept fragment dropped")]
    #[test_case("//lp.test/wait", "http://lp.test/wait"; "host from advertisement")]
    #[test_case("https://lp.test:9000/x", "https://lp.test:9000/x"; "full url")]
    fn test_long_poll_url(advertised: &str, expected: &str) {
        let base = Url::parse("http://pool.test:8332/rpc/v1").unwrap();
        assert_eq!(long_poll_url(&base, advertised).unwrap().as_str(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relative_long_poll_ignores_pool_path() {
        let mut h = start("http://u:p@pool.test/rpc/v1");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-long-polling", "longpoll")]));
        let lp = h.next_on(Channel::LongPoll).await;
        assert_eq!(lp.request.url.as_str(), "http://pool.test/longpoll");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_withdrawn() {
        let mut h = start("http://u:p@pool.test/;askrate=2&lpaskrate=0");
        h.handle.connect().await.unwrap();

        h.next_on(Channel::Fetch)
            .await
            .respond(work_with(&[("x-long-polling", "/lp")]));
        assert_eq!(h.event_skipping_work().await, ClientEvent::Connect);
        assert_eq!(h.event_skipping_work().await, ClientEvent::LongPoll(true));
        let _lp = h.next_on(Channel::LongPoll).await;

        h.handle.request_work().await.unwrap();
        h.next_on(Channel::Fetch).await.respond(mock::work_response());
        assert_eq!(h.event_skipping_work().await, ClientEvent::LongPoll(false));

        // Polling is back on askrate.
        let started = Instant::now();
        let _poll = h.next_on(Channel::Fetch).await;
        assert!(Instant::now() - started >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_exhaustion_is_failure() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();

        for _ in 0..4 {
            let exchange = h.next_on(Channel::Fetch).await;
            exchange.respond(mock::with_header(mock::response(307, ""), "location", "/next"));
        }
        assert_eq!(
            h.event().await,
            ClientEvent::Debug(GetworkError::TooManyRedirects.to_string())
        );
        assert_eq!(h.event().await, ClientEvent::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_reject_reason() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();
        h.next_on(Channel::Fetch).await.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);

        let handle = h.handle.clone();
        let verdict = tokio::spawn(async move { handle.submit(vec![1; 80]).await });

        let exchange = h.next_on(Channel::Submit).await;
        let response = mock::with_header(
            mock::response(200, r#"{"result": false, "error": null}"#),
            "x-reject-reason",
            "duplicate",
        );
        exchange.respond(response);

        assert!(!verdict.await.unwrap());
        assert_eq!(
            h.event_skipping_work().await,
            ClientEvent::Debug("Reject reason: duplicate".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_blocking_from_kernel_thread() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();
        h.next_on(Channel::Fetch).await.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);

        let handle = h.handle.clone();
        let verdict = tokio::task::spawn_blocking(move || handle.submit_blocking(vec![1; 80]));

        h.next_on(Channel::Submit)
            .await
            .respond(mock::response(200, r#"{"result": true, "error": null}"#));
        assert!(verdict.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_rejects_pending_and_goes_quiet() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.connect().await.unwrap();
        h.next_on(Channel::Fetch).await.respond(mock::work_response());
        assert_eq!(h.event().await, ClientEvent::Connect);

        let handle = h.handle.clone();
        let verdict = tokio::spawn(async move { handle.submit(vec![1; 80]).await });
        let _held = h.next_on(Channel::Submit).await;

        h.handle.disconnect().await.unwrap();
        assert!(!verdict.await.unwrap());

        let quiet = tokio::time::timeout(Duration::from_secs(3600), h.server.next()).await;
        assert!(quiet.is_err());
        assert!(matches!(h.events.try_recv(), Ok(ClientEvent::Work(_))));
        assert!(h.events.try_recv().is_err());

        // Submitting while disconnected is an immediate rejection.
        assert!(!h.handle.submit(vec![2; 80]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_version_changes_user_agent() {
        let mut h = start("http://u:p@pool.test/");
        h.handle.set_version("phoenix", Some("2.0")).await.unwrap();
        h.handle.connect().await.unwrap();

        let exchange = h.next_on(Channel::Fetch).await;
        assert_eq!(
            exchange.request.headers.get("user-agent").unwrap(),
            "phoenix/2.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_client() {
        let mut h = start("http://u:p@pool.test/");
        h.shutdown.cancel();
        h.settle().await;
        assert!(h.handle.request_work().await.is_err());
        assert!(h.events.recv().await.is_none());
    }
}
