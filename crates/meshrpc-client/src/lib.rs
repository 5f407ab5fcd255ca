//! Meshrpc Client
//!
//! The client-side core of the meshrpc cluster RPC runtime. It turns
//! application-level request messages into frames on durable TCP connections
//! to peer nodes, correlates asynchronous responses back to their
//! originators, copes with node failures via retries and backoff, and feeds
//! per-node latency statistics into load-balancing decisions.
//!
//! # Architecture
//!
//! - [`NetworkClient`] - the public entry point: consumes membership
//!   snapshots, selects a node per request through a replaceable
//!   [`LoadBalancer`], and hands requests to the node's channel pool.
//! - [`pool::ChannelPool`] - per-node connection pool bounding outbound
//!   fan-out, queueing bursts, enforcing open/write deadlines and aging out
//!   stale sockets and stale queued writes. Each pooled connection pairs a
//!   writer half, checked in and out of the pool, with a reader task that
//!   demultiplexes responses by correlation id.
//! - [`balancer`] / [`backoff`] - node selection and failure masking.
//! - [`executor`] - the bounded worker pool response callbacks run on.
//!
//! # Threading
//!
//! `send_request` and `send_message` never block on I/O: they either hand the
//! request to an idle connection, enqueue it, or fail fast. Completion
//! callbacks run on the response executor (or inline on the submitting or
//! reader task when the executor queue is saturated); user code that blocks
//! should do its own offloading.
//!
//! # Example
//!
//! ```no_run
//! use meshrpc_client::{ClientConfig, NetworkClient, SendOptions};
//! use meshrpc_common::{Endpoint, Node};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NetworkClient::round_robin(ClientConfig::default());
//! client.update_endpoints(vec![Endpoint::new(Node::new(1, "10.0.0.1", 7100))]);
//!
//! let sum: u64 = client
//!     .request("add", Some(vec![1u64, 2, 3]), SendOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod balancer;
pub mod client;
pub mod config;
pub(crate) mod connection;
pub mod executor;
pub mod pool;
pub(crate) mod pool_registry;
pub mod request;

pub use backoff::{BackoffConfig, BackoffStrategy};
pub use balancer::{LoadBalancer, LoadBalancerFactory, RoundRobinFactory};
pub use client::{NetworkClient, SendOptions};
pub use config::{ClientConfig, PoolConfig, ResponseHandlerConfig, RetryPolicy, StatsConfig};
pub use executor::ResponseExecutor;
pub use request::{Callback, CompletionHandle, Request, RequestBody};

use std::time::SystemTime;

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
