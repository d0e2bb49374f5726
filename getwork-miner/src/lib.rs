//! Getwork mining client.
//!
//! Fetches work from a getwork coordinator over HTTP, keeps a prefetched
//! nonce range ready for every compute thread, sizes ranges from measured
//! execution time, and submits results back in order.

pub mod config;
pub mod daemon;
pub mod error;
pub mod getwork;
pub mod kernel;
pub mod queue_reader;
pub mod tracing;
pub mod types;
pub mod work;
