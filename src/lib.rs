//! A concurrency runtime for orchestrating requests over a pluggable
//! transport: interceptors, bounded-parallel batches, per-key serial
//! queues, and single-flight caching.
//!
//! Issuing a request is delegated entirely to an injected [`Transport`] —
//! this crate's value is in scheduling, coalescing, retrying the caller's
//! *decision* to retry (via interceptors), and caching, not in I/O.
//!
//! ```no_run
//! use std::sync::Arc;
//! use request_runtime::config::GlobalConfig;
//! use request_runtime::descriptor::{Method, RequestDescriptor};
//! use request_runtime::facade::Client;
//! use request_runtime::transport::MockTransport;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let transport = Arc::new(MockTransport::new());
//! let client = Client::new_with_transport(transport, GlobalConfig::default());
//! let result = client.execute(RequestDescriptor::new("/status", Method::Get)).await;
//! # let _ = result;
//! # }
//! ```

pub mod cache;
pub mod cancellation;
pub mod collector;
pub mod concurrent;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod facade;
pub mod fingerprint;
pub mod interceptor;
pub mod pipeline;
pub mod semaphore;
pub mod serial;
pub mod transport;

pub use error::{ErrorKind, RequestError, Result};
pub use facade::{Client, ClientBuilder};
pub use pipeline::RequestPipeline;
