//! Getwork mining protocol client.
//!
//! This module fetches work from a getwork coordinator (bitcoind or a pool
//! speaking the same dialect) and submits results back to it. The protocol
//! is JSON-RPC over HTTP with Basic authentication.
//!
//! # Protocol Overview
//!
//! Getwork is a pull protocol with an optional push channel:
//!
//! - **Poll**: `POST {"method": "getwork", "params": []}` returns a work unit
//!   (`data`, `target`, optional `mask` and `block`)
//! - **Submit**: `POST {"method": "getwork", "params": ["<hex>"]}` returns
//!   `true` if the result was accepted
//! - **Long poll**: a coordinator advertising `X-Long-Polling` answers a
//!   `GET` to that URL only once new work exists
//! - **Headers**: `X-Blocknum` announces the chain height,
//!   `X-Reject-Reason` explains a rejected result
//!
//! # Architecture
//!
//! The client is an active async task. Fetch, submit and long poll each
//! use their own HTTP connection so they never wait on each other. The
//! application drives the client through a [`ClientHandle`] and observes it
//! through [`ClientEvent`]s.
//!
//! # Usage
//!
//! ```rust,ignore
//! use getwork_miner::config::PoolConfig;
//! use getwork_miner::getwork::{ClientEvent, ProtocolClient};
//!
//! let (event_tx, mut event_rx) = mpsc::channel(100);
//! let pool = PoolConfig::parse("http://worker:x@pool.example.com:8332/")?;
//!
//! let (client, handle) = ProtocolClient::new(pool, event_tx, shutdown_token)?;
//! tokio::spawn(client.run());
//! handle.connect().await?;
//!
//! while let Some(event) = event_rx.recv().await {
//!     match event {
//!         ClientEvent::Work(work) => { /* hand to the work queue */ }
//!         ClientEvent::Block(height) => { /* chain moved */ }
//!         // ...
//!     }
//! }
//! ```

mod client;
pub(crate) mod connection;
mod error;
mod long_poll;
mod messages;
mod poller;
mod submit;

pub use client::{ClientHandle, ProtocolClient};
pub use connection::{Channel, Connector, Endpoint, HttpConnector, HttpRequest, HttpResponse, Transport};
pub use error::{GetworkError, GetworkResult};
pub use messages::{ClientCommand, ClientEvent};
