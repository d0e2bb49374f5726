//! Ordered result submission.
//!
//! Results go out one at a time on the submit connection, in the order they
//! were handed in. Each caller gets exactly one answer: `true` only if the
//! coordinator explicitly accepted the result, `false` for rejections,
//! errors, unencodable results and anything still queued at disconnect.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::oneshot;

use super::connection::{Channel, Connection, Connector, Endpoint};
use super::error::{GetworkError, GetworkResult};
use super::messages::{JsonRpcRequest, X_REJECT_REASON};
use crate::config::REQUEST_TIMEOUT;
use crate::tracing::prelude::*;
use crate::work::encode_result;

struct Entry {
    frame: String,
    endpoint: Endpoint,
    reply: oneshot::Sender<bool>,
}

type SubmitFuture = BoxFuture<'static, (Connection, GetworkResult<(HeaderMap, Option<Value>)>)>;

/// How one submission ended.
#[derive(Debug)]
pub struct Completion {
    pub accepted: bool,
    /// `X-Reject-Reason` sent with a rejection
    pub reject_reason: Option<String>,
    pub error: Option<GetworkError>,
}

pub struct SubmissionPipeline {
    connector: Arc<dyn Connector>,
    connection: Option<Connection>,
    queue: VecDeque<Entry>,
    in_flight: Option<(SubmitFuture, oneshot::Sender<bool>)>,
}

impl SubmissionPipeline {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: None,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Queue a result. The answer arrives on `reply` once every earlier
    /// result has been answered.
    pub fn submit(&mut self, result: &[u8], endpoint: Endpoint, reply: oneshot::Sender<bool>) {
        let Some(frame) = encode_result(result) else {
            warn!(len = result.len(), "Result too long to submit");
            let _ = reply.send(false);
            return;
        };
        self.queue.push_back(Entry {
            frame,
            endpoint,
            reply,
        });
        self.start_next();
    }

    /// Number of results not yet answered, including the one on the wire.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    fn start_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(entry) = self.queue.pop_front() else {
            return;
        };

        let mut connection = self.connection.take().unwrap_or_else(|| {
            Connection::open(&self.connector, Channel::Submit, REQUEST_TIMEOUT)
        });
        let Entry {
            frame,
            endpoint,
            reply,
        } = entry;

        let submission = async move {
            let outcome = connection
                .call(&endpoint, &JsonRpcRequest::submit(frame))
                .await;
            (connection, outcome)
        }
        .boxed();
        self.in_flight = Some((submission, reply));
    }

    /// Drive the submission on the wire, returning when it is answered. The
    /// next queued result starts before this returns. Pending forever while
    /// idle.
    ///
    /// Cancel safe.
    pub async fn wait(&mut self) -> Completion {
        let Some((submission, _)) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let (connection, outcome) = submission.await;
        self.connection = Some(connection);

        let completion = match outcome {
            Ok((headers, result)) => {
                let accepted = result == Some(Value::Bool(true));
                let reject_reason = if accepted {
                    None
                } else {
                    headers
                        .get(X_REJECT_REASON)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned)
                };
                Completion {
                    accepted,
                    reject_reason,
                    error: None,
                }
            }
            Err(e) => Completion {
                accepted: false,
                reject_reason: None,
                error: Some(e),
            },
        };

        if let Some((_, reply)) = self.in_flight.take() {
            let _ = reply.send(completion.accepted);
        }
        self.start_next();
        completion
    }

    /// Answer everything pending as rejected and close the connection.
    pub fn reject_all(&mut self) {
        if let Some((_, reply)) = self.in_flight.take() {
            let _ = reply.send(false);
        }
        for entry in self.queue.drain(..) {
            let _ = entry.reply.send(false);
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}
