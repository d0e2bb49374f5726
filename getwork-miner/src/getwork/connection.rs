//! HTTP connection management for the getwork protocol.
//!
//! Each logical direction (fetch, submit, long poll) owns one [`Connection`]
//! so that a held-open long poll or a slow submission never queues behind
//! another direction's traffic. A connection wraps a [`Transport`] that
//! performs single HTTP exchanges; the connection layers redirect following,
//! authorization detection, keep-alive bookkeeping and JSON-RPC parsing on
//! top.
//!
//! The [`Transport`] trait abstracts the exchange itself, so the client runs
//! over reqwest in production and over channels in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION, LOCATION, USER_AGENT};
use reqwest::{Method, StatusCode, Url, Version};
use serde_json::Value;

use super::error::{GetworkError, GetworkResult};
use super::messages::{parse_response, JsonRpcRequest};
use crate::config::{PoolConfig, MAX_REDIRECTS};
use crate::tracing::prelude::*;

/// TCP keep-alive probe interval for coordinator sockets.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Logical direction a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Fetch,
    Submit,
    LongPoll,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Fetch => "fetch",
            Channel::Submit => "submit",
            Channel::LongPoll => "longpoll",
        };
        f.write_str(name)
    }
}

/// Where requests go and the identity headers they carry.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    pub headers: HeaderMap,
}

impl Endpoint {
    /// Build the endpoint for a coordinator: its URL plus `Authorization`
    /// and `User-Agent` headers.
    pub fn from_pool(pool: &PoolConfig) -> GetworkResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&pool.auth)?);
        headers.insert(USER_AGENT, header_value(&pool.user_agent)?);
        Ok(Self {
            url: pool.url.clone(),
            headers,
        })
    }

    /// Same identity, different target.
    pub fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            headers: self.headers.clone(),
        }
    }

    /// A body-less GET to this endpoint.
    pub fn get(&self) -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: None,
        }
    }
}

fn header_value(value: &str) -> GetworkResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| GetworkError::Parse(format!("invalid header value: {:?}", value)))
}

/// One HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

/// One HTTP response, fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the server allows the socket to be reused.
    ///
    /// HTTP/1.0 closes unless keep-alive was negotiated; HTTP/1.1 stays open
    /// unless the server said `Connection: close`.
    pub fn keeps_alive(&self) -> bool {
        let connection = self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());

        match connection.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.version != Version::HTTP_10,
        }
    }

    /// Header value as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Single-exchange HTTP transport.
#[async_trait]
pub trait Transport: Send {
    /// Perform one request/response exchange without following redirects.
    async fn send(&mut self, request: &HttpRequest) -> GetworkResult<HttpResponse>;

    /// Drop the underlying socket. Always safe to call; the next `send`
    /// reconnects.
    fn close(&mut self);
}

/// Creates transports for connections.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, channel: Channel, timeout: Duration) -> Box<dyn Transport>;
}

/// Production connector backed by reqwest.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn open(&self, _channel: Channel, timeout: Duration) -> Box<dyn Transport> {
        Box::new(HttpTransport::new(timeout))
    }
}

/// reqwest-backed transport holding at most one pooled socket.
///
/// The client is built lazily on first use with no-delay and keep-alive set
/// on every socket it opens; closing drops it along with its socket.
pub struct HttpTransport {
    client: Option<reqwest::Client>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: None,
            timeout,
        }
    }

    fn client(&mut self) -> GetworkResult<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE))
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(1)
            .timeout(self.timeout)
            .http1_only()
            .build()
            .map_err(|e| GetworkError::Transport(e.to_string()))?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

fn classify(e: reqwest::Error) -> GetworkError {
    if e.is_timeout() {
        GetworkError::Timeout
    } else {
        GetworkError::Transport(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, request: &HttpRequest) -> GetworkResult<HttpResponse> {
        let client = self.client()?;
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status,
            version,
            headers,
            body,
        })
    }

    fn close(&mut self) {
        self.client = None;
    }
}

/// A reusable connection for one direction.
pub struct Connection {
    channel: Channel,
    transport: Box<dyn Transport>,
}

impl Connection {
    /// Open a connection through `connector`. No socket exists until the
    /// first request.
    pub fn open(connector: &Arc<dyn Connector>, channel: Channel, timeout: Duration) -> Self {
        Self {
            channel,
            transport: connector.open(channel, timeout),
        }
    }

    /// Close the socket; the next request starts clean.
    pub fn close(&mut self) {
        trace!(channel = %self.channel, "Closing connection");
        self.transport.close();
    }

    /// Perform an HTTP exchange, following up to [`MAX_REDIRECTS`]
    /// redirects.
    ///
    /// Any error closes the connection before it is returned.
    pub async fn request(&mut self, request: HttpRequest) -> GetworkResult<HttpResponse> {
        let result = self.exchange(request).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn exchange(&mut self, mut request: HttpRequest) -> GetworkResult<HttpResponse> {
        let mut follows = 0;
        loop {
            trace!(channel = %self.channel, method = %request.method, url = %request.url, "Request");
            let response = self.transport.send(&request).await?;
            trace!(channel = %self.channel, status = %response.status, "Response");

            if !response.keeps_alive() {
                self.transport.close();
            }

            if response.status == StatusCode::UNAUTHORIZED {
                return Err(GetworkError::Unauthorized);
            }

            let location = if response.status.is_redirection() {
                response.header(LOCATION.as_str()).map(str::to_owned)
            } else {
                None
            };
            let Some(location) = location else {
                return Ok(response);
            };

            if follows == MAX_REDIRECTS {
                return Err(GetworkError::TooManyRedirects);
            }
            follows += 1;

            request.url = request
                .url
                .join(&location)
                .map_err(|e| GetworkError::InvalidUrl(format!("{}: {}", location, e)))?;
            if response.status == StatusCode::SEE_OTHER {
                request.method = Method::GET;
                request.body = None;
            }
            debug!(channel = %self.channel, url = %request.url, "Following redirect");
        }
    }

    /// POST a JSON-RPC request and return the response headers and `result`.
    ///
    /// Server-reported errors and unparseable bodies close the connection
    /// like transport failures do.
    pub async fn call(
        &mut self,
        endpoint: &Endpoint,
        rpc: &JsonRpcRequest,
    ) -> GetworkResult<(HeaderMap, Option<Value>)> {
        let mut headers = endpoint.headers.clone();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let request = HttpRequest {
            method: Method::POST,
            url: endpoint.url.clone(),
            headers,
            body: Some(rpc.to_body()?),
        };

        let response = self.request(request).await?;
        match parse_response(&response.body) {
            Ok(result) => Ok((response.headers, result)),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }
}
