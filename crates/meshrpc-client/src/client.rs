use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use meshrpc_common::{Endpoint, Node, Result, RpcError};
use meshrpc_stats::{HealthScoreCalculator, StatsRegistry, StatsSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::backoff::BackoffStrategy;
use crate::balancer::{LoadBalancer, LoadBalancerFactory, RoundRobinFactory};
use crate::config::ClientConfig;
use crate::executor::ResponseExecutor;
use crate::pool::ChannelPool;
use crate::pool_registry::PoolRegistry;
use crate::request::{Callback, CompletionHandle, Request, RequestBody};

/// The load-balancer slot: membership updates publish a new value, the send
/// path reads whichever is current.
enum BalancerSlot {
    /// No membership snapshot has arrived yet
    Absent,
    /// Balancer construction failed on the latest snapshot; sticky until the
    /// next one
    Invalid(String),
    Ready(Arc<dyn LoadBalancer>),
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Transient capability bits the chosen node must advertise
    pub capability: u64,
    /// Persistent capability bits the chosen node must advertise
    pub persistent_capability: u64,
    /// Frame priority; higher served first by compliant servers, and drained
    /// first from the local write queue
    pub priority: i32,
    /// Retry budget beyond the first attempt; defaults to the configured
    /// retry policy
    pub max_retry: Option<u32>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    slot: RwLock<BalancerSlot>,
    factory: Arc<dyn LoadBalancerFactory>,
    pools: PoolRegistry,
    stats: Arc<StatsRegistry>,
    backoff: Arc<BackoffStrategy>,
    shutdown: AtomicBool,
}

/// The cluster RPC client.
///
/// Consumes membership snapshots via [`update_endpoints`], selects a node per
/// request through the load balancer built by the configured factory, and
/// hands requests to the chosen node's channel pool. Cheap to clone; clones
/// share all state.
///
/// Must be created from within a Tokio runtime.
///
/// [`update_endpoints`]: NetworkClient::update_endpoints
#[derive(Clone)]
pub struct NetworkClient {
    inner: Arc<ClientInner>,
}

impl NetworkClient {
    /// A client whose load balancer is built by `factory`. The factory
    /// builder receives the client's backoff strategy so selection can skip
    /// nodes that are cooling down.
    pub fn new(
        config: ClientConfig,
        factory: impl FnOnce(Arc<BackoffStrategy>) -> Arc<dyn LoadBalancerFactory>,
    ) -> Self {
        let backoff = Arc::new(BackoffStrategy::default());
        let factory = factory(Arc::clone(&backoff));
        let stats = Arc::new(StatsRegistry::new(
            config.stats.request_statistics_window_ms,
            config.stats.refresh_interval_ms,
            HealthScoreCalculator::new(config.stats.outlier_multiplier, config.stats.outlier_constant),
        ));
        let executor = ResponseExecutor::new(config.response_handler.clone());

        let pool_config = config.pool.clone();
        let pool_stats = Arc::clone(&stats);
        let pool_backoff = Arc::clone(&backoff);
        let pools = PoolRegistry::new(
            Box::new(move |node: &Node| {
                ChannelPool::new(
                    node.clone(),
                    pool_config.clone(),
                    Arc::clone(&pool_stats),
                    Arc::clone(&pool_backoff),
                    Arc::clone(&executor),
                )
            }),
            Duration::from_millis(config.membership_grace_ms),
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                slot: RwLock::new(BalancerSlot::Absent),
                factory,
                pools,
                stats,
                backoff,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// A client with the default round-robin load balancer.
    pub fn round_robin(config: ClientConfig) -> Self {
        Self::new(config, |backoff| Arc::new(RoundRobinFactory::new(backoff)))
    }

    /// Applies a membership snapshot: rebuilds the load balancer and tears
    /// down pools of departed nodes after the grace period. A balancer
    /// construction failure is recorded and fails subsequent sends with
    /// `InvalidCluster` until the next snapshot.
    pub fn update_endpoints(&self, endpoints: Vec<Endpoint>) {
        let ids: HashSet<u32> = endpoints.iter().map(|e| e.node.id).collect();
        self.inner.pools.update_membership(&ids);

        let slot = match self.inner.factory.new_balancer(&endpoints) {
            Ok(balancer) => {
                info!(nodes = endpoints.len(), "load balancer rebuilt from membership snapshot");
                BalancerSlot::Ready(Arc::from(balancer))
            }
            Err(error) => {
                warn!(%error, "load balancer construction failed; failing sends until the next snapshot");
                BalancerSlot::Invalid(error.to_string())
            }
        };
        *self.inner.slot.write().unwrap_or_else(|e| e.into_inner()) = slot;
    }

    /// Sends `message` to a balancer-chosen node and invokes `callback` with
    /// the decoded response or the failure. Never blocks on I/O. The
    /// callback fires exactly once: on the response executor for outcomes
    /// decided by the pool layer, inline when node selection fails fast.
    ///
    /// With a retry budget (`options.max_retry` or the configured policy), a
    /// retryable failure re-selects a node and re-issues the request; the
    /// retry only happens when selection yields a *different* node (unless
    /// `duplicates_ok`), since re-sending to the node that just failed would
    /// fail the same way.
    pub fn send_request<M, R, F>(&self, name: &str, message: Option<M>, options: SendOptions, callback: F)
    where
        M: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<R>) + Send + 'static,
    {
        let decoding: Callback = Box::new(move |result: Result<Bytes>| {
            callback(result.and_then(|bytes| {
                serde_json::from_slice::<R>(&bytes)
                    .map_err(|e| RpcError::Deserialization(e.to_string()))
            }));
        });
        self.send_raw(name, message.map(lazy_body), options, decoding);
    }

    /// The untyped variant of [`send_request`]: the callback receives the
    /// raw response bytes.
    ///
    /// [`send_request`]: NetworkClient::send_request
    pub fn send_raw(
        &self,
        name: &str,
        body: Option<Arc<RequestBody>>,
        options: SendOptions,
        callback: Callback,
    ) {
        let inner = &self.inner;
        let (node, body) = match prepare(inner, body, &options) {
            Ok(prepared) => prepared,
            Err(error) => {
                callback(Err(error));
                return;
            }
        };

        let max_retry = options
            .max_retry
            .unwrap_or(inner.config.retry.max_retries);
        let name = name.to_string();
        let req = Request::new(
            node.clone(),
            Some(name.clone()),
            options.priority,
            Arc::clone(&body),
            true,
        );
        let callback = if max_retry > 0 {
            retrying_callback(Arc::clone(inner), name, body, options, max_retry, callback)
        } else {
            callback
        };

        let handle = CompletionHandle::new(callback);
        match inner.pools.pool_for(&node) {
            Ok(pool) => pool.send_request(req, handle),
            Err(error) => {
                handle.complete(Err(error));
            }
        }
    }

    /// Fire-and-forget: the message is written to a balancer-chosen node and
    /// nothing is reported back. Selection and enqueue failures are returned
    /// synchronously; anything after that is best-effort.
    pub fn send_message<M>(&self, name: &str, message: Option<M>, options: SendOptions) -> Result<()>
    where
        M: Serialize + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let (node, body) = prepare(inner, message.map(lazy_body), &options)?;
        let req = Request::new(node.clone(), Some(name.to_string()), options.priority, body, false);
        let pool = inner.pools.pool_for(&node)?;
        pool.send_request(req, CompletionHandle::none());
        Ok(())
    }

    /// Awaitable adapter over [`send_request`], bounded by the configured
    /// request timeout.
    ///
    /// [`send_request`]: NetworkClient::send_request
    pub async fn request<M, R>(&self, name: &str, message: Option<M>, options: SendOptions) -> Result<R>
    where
        M: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send_request(name, message, options, move |result: Result<R>| {
            let _ = tx.send(result);
        });

        let deadline = Duration::from_millis(self.inner.config.request_timeout_ms);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Io(io::Error::from(io::ErrorKind::ConnectionAborted))),
            Err(_) => Err(RpcError::Io(io::Error::from(io::ErrorKind::TimedOut))),
        }
    }

    /// Closes every pool and waits for socket teardown. Queued requests fail
    /// with `PoolClosed`; subsequent sends fail with `ClusterDisconnected`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.slot.write().unwrap_or_else(|e| e.into_inner()) = BalancerSlot::Absent;
        self.inner.pools.shutdown().await;
        info!("network client shut down");
    }

    /// Point-in-time statistics across all tracked nodes: latency
    /// percentiles, RPS, pending counts, pool gauges and health scores.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The health score for one node; lower is healthier.
    pub fn node_health_score(&self, node_id: u32) -> Option<f64> {
        self.inner.stats.health_score(node_id)
    }
}

fn lazy_body<M: Serialize + Send + Sync + 'static>(message: M) -> Arc<RequestBody> {
    Arc::new(RequestBody::lazy(move || {
        serde_json::to_vec(&message)
            .map(Bytes::from)
            .map_err(|e| e.to_string())
    }))
}

/// Steps 1-4 of the send path: connected check, null check, balancer slot
/// read, node selection.
fn prepare(
    inner: &ClientInner,
    body: Option<Arc<RequestBody>>,
    options: &SendOptions,
) -> Result<(Node, Arc<RequestBody>)> {
    if inner.shutdown.load(Ordering::SeqCst) {
        return Err(RpcError::ClusterDisconnected);
    }
    let body = body.ok_or(RpcError::NullArgument("message"))?;

    let node = {
        let slot = inner.slot.read().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            BalancerSlot::Absent => return Err(RpcError::ClusterDisconnected),
            BalancerSlot::Invalid(cause) => return Err(RpcError::InvalidCluster(cause.clone())),
            BalancerSlot::Ready(balancer) => balancer
                .next_node(options.capability, options.persistent_capability)
                .ok_or(RpcError::NoNodesAvailable)?,
        }
    };
    Ok((node, body))
}

/// Node selection for the retry path; all failures collapse to `None` so a
/// secondary error never replaces the original one.
fn pick_ready(inner: &ClientInner, options: &SendOptions) -> Option<Node> {
    let slot = inner.slot.read().unwrap_or_else(|e| e.into_inner());
    match &*slot {
        BalancerSlot::Ready(balancer) => {
            balancer.next_node(options.capability, options.persistent_capability)
        }
        _ => None,
    }
}

/// Wraps the user callback in the retry trampoline.
///
/// On failure, retry iff the error carries the failing request, the attempt
/// budget is not exhausted, and re-selection yields a different node (or
/// `duplicates_ok` permits the same one). Otherwise the *original* failure
/// propagates; errors during retry setup are swallowed in its favor.
fn retrying_callback(
    inner: Arc<ClientInner>,
    name: String,
    body: Arc<RequestBody>,
    options: SendOptions,
    max_retry: u32,
    callback: Callback,
) -> Callback {
    Box::new(move |result| {
        let error = match result {
            Ok(bytes) => return callback(Ok(bytes)),
            Err(error) => error,
        };

        let reissue = error
            .failed_request()
            .filter(|failed| failed.attempt < max_retry)
            .and_then(|failed| {
                let node = pick_ready(&inner, &options)?;
                if node.id != failed.node.id || inner.config.duplicates_ok {
                    Some((node, failed.attempt + 1))
                } else {
                    None
                }
            });

        match reissue {
            Some((node, attempt)) => match inner.pools.pool_for(&node) {
                Ok(pool) => {
                    debug!(node = %node, attempt, "re-issuing failed request");
                    let req = Request::attempt(
                        node,
                        Some(name.clone()),
                        options.priority,
                        Arc::clone(&body),
                        attempt,
                        true,
                    );
                    let next = retrying_callback(
                        Arc::clone(&inner),
                        name.clone(),
                        Arc::clone(&body),
                        options.clone(),
                        max_retry,
                        callback,
                    );
                    pool.send_request(req, CompletionHandle::new(next));
                }
                Err(_) => callback(Err(error)),
            },
            None => callback(Err(error)),
        }
    })
}
