use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::SinkExt;
use meshrpc_common::{Frame, Node, RpcError};
use meshrpc_stats::{PoolGaugeSource, PoolGauges, StatsRegistry};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::BackoffStrategy;
use crate::config::PoolConfig;
use crate::connection::{self, ConnHandle, ConnShared, FramedSink, PendingResponse};
use crate::executor::ResponseExecutor;
use crate::request::{CompletionHandle, Request};

/// Waiters drained per checkin before yielding back to the scheduler, so one
/// producer cannot starve the reader tasks sharing the runtime.
const MAX_DRAIN_PER_CHECKIN: usize = 64;

/// A pooled connection: the writer half plus its creation timestamp.
pub(crate) struct PoolEntry {
    pub sink: FramedSink,
    pub shared: Arc<ConnShared>,
    pub created_at: Instant,
}

impl PoolEntry {
    fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }
}

/// A request parked until a connection can take it.
struct QueuedWrite {
    req: Request,
    handle: CompletionHandle,
}

/// Bounded connection pool for a single destination node.
///
/// Owns up to `max_connections_per_node` sockets. A request either writes
/// immediately on an idle connection or joins the waiting-writes queue while
/// a new connection opens; whoever finishes a write next drains the queue.
/// Queued work is bounded in time two ways: the drain loop enforces the
/// write deadline (plus the open budget for the first write on a fresh
/// socket), and a periodic sweeper fails requests that sat in the queue past
/// the stale timeout.
///
/// `send_request` never blocks on I/O: it hands the socket work to a task
/// and returns.
pub struct ChannelPool {
    node: Node,
    config: PoolConfig,
    stats: Arc<StatsRegistry>,
    backoff: Arc<BackoffStrategy>,
    executor: Arc<ResponseExecutor>,
    idle: Mutex<VecDeque<PoolEntry>>,
    waiting: Mutex<VecDeque<QueuedWrite>>,
    /// Idle entries plus in-flight writes plus sockets being opened.
    /// Transiently overshoots the limit by one inside `open_channel`.
    pool_size: AtomicUsize,
    requests_sent: AtomicU64,
    closed: AtomicBool,
    soft_closed: AtomicBool,
    conns: Mutex<Vec<ConnHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelPool {
    pub fn new(
        node: Node,
        config: PoolConfig,
        stats: Arc<StatsRegistry>,
        backoff: Arc<BackoffStrategy>,
        executor: Arc<ResponseExecutor>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            node: node.clone(),
            config,
            stats: Arc::clone(&stats),
            backoff,
            executor,
            idle: Mutex::new(VecDeque::new()),
            waiting: Mutex::new(VecDeque::new()),
            pool_size: AtomicUsize::new(0),
            requests_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            soft_closed: AtomicBool::new(false),
            conns: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        });
        stats.register_pool(node.id, Arc::clone(&pool) as Arc<dyn PoolGaugeSource>);
        pool.spawn_sweeper();
        pool
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Submits a request to this pool. Never blocks: the request is written
    /// on an idle connection by a spawned task, or queued while a connection
    /// opens, or failed fast.
    pub fn send_request(self: &Arc<Self>, req: Request, handle: CompletionHandle) {
        if self.is_closed() {
            self.finish(
                handle,
                Err(RpcError::PoolClosed {
                    request: Some(req.failed_request()),
                }),
            );
            return;
        }

        if let Some(entry) = self.checkout_channel() {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut entry = entry;
                if pool.write_entry(&mut entry, req, handle).await {
                    pool.checkin_channel(entry, false).await;
                } else {
                    pool.discard_entry(entry);
                }
            });
            return;
        }

        let failed = req.failed_request();
        {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(limit) = self.config.max_write_queue_size {
                if waiting.len() >= limit {
                    drop(waiting);
                    self.finish(handle, Err(RpcError::QueueFull { limit }));
                    return;
                }
            }
            insert_by_priority(
                &mut waiting,
                QueuedWrite {
                    req,
                    handle: handle.clone(),
                },
            );
        }
        if self.is_closed() {
            // Lost the race with close(): nobody will drain the queue now
            self.fail_waiting_closed();
            return;
        }
        self.open_channel(failed, handle);
    }

    /// Pops idle entries until one is connected and still reusable.
    /// Disconnected and aged-out entries are closed and discarded.
    fn checkout_channel(&self) -> Option<PoolEntry> {
        loop {
            let entry = self
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()?;
            if !entry.shared.is_open() {
                self.pool_size.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            if !self.entry_reusable(&entry) {
                self.pool_size.fetch_sub(1, Ordering::SeqCst);
                entry.shared.drain();
                continue;
            }
            return Some(entry);
        }
    }

    /// Drains the waiting queue onto `entry`, then returns it to the idle
    /// pool if it is still reusable.
    ///
    /// Each waiter gets `write_timeout_ms` from its creation, plus the open
    /// budget when `is_first_write` is set: a waiter racing a fresh connect
    /// legitimately waited through the open phase. Expired waiters fail with
    /// `WriteTimeout` and are not written.
    pub(crate) async fn checkin_channel(self: &Arc<Self>, mut entry: PoolEntry, is_first_write: bool) {
        let budget_ms = self.config.write_timeout_ms
            + if is_first_write {
                self.config.connect_timeout_ms
            } else {
                0
            };

        let mut drained = 0usize;
        loop {
            let waiter = self
                .waiting
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(waiter) = waiter else { break };
            if waiter.handle.is_consumed() {
                continue;
            }
            if waiter.req.age_ms() >= budget_ms {
                let failed = waiter.req.failed_request();
                self.finish(
                    waiter.handle,
                    Err(RpcError::WriteTimeout {
                        timeout_ms: budget_ms,
                        request: Some(failed),
                    }),
                );
                continue;
            }
            if !self.write_entry(&mut entry, waiter.req, waiter.handle).await {
                self.discard_entry(entry);
                return;
            }
            drained += 1;
            if drained % MAX_DRAIN_PER_CHECKIN == 0 {
                tokio::task::yield_now().await;
            }
        }

        if self.is_closed() || !entry.shared.is_open() || !self.entry_reusable(&entry) {
            self.discard_entry(entry);
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
    }

    /// Writes one request on `entry`. Returns whether the socket survived.
    async fn write_entry(
        &self,
        entry: &mut PoolEntry,
        req: Request,
        handle: CompletionHandle,
    ) -> bool {
        let body = match req.body.encoded() {
            Ok(body) => body,
            Err(error) => {
                self.finish(handle, Err(error));
                return true;
            }
        };
        let failed = req.failed_request();
        let frame = Frame {
            id: req.id,
            name: req.name.clone(),
            priority: req.priority,
            body,
        };

        if req.expects_response {
            entry.shared.register_pending(
                req.id,
                PendingResponse {
                    handle: handle.clone(),
                    failed: failed.clone(),
                },
            );
            self.stats.begin_request(self.node.id, req.id);
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        match entry.sink.send(frame).await {
            Ok(()) => true,
            Err(error) => {
                if req.expects_response {
                    entry.shared.take_pending(&req.id);
                    self.stats.fail_request(self.node.id, req.id);
                }
                self.backoff.notify_failure(self.node.id);
                entry.shared.shut_down(false);
                self.finish(
                    handle,
                    Err(RpcError::WriteError {
                        message: error.to_string(),
                        request: Some(failed),
                    }),
                );
                false
            }
        }
    }

    /// Claims a connection slot and opens a socket for the request that
    /// found no idle entry. Over the limit, the claim is released and the
    /// waiter stays queued: an in-flight completion will drain it.
    fn open_channel(self: &Arc<Self>, failed: meshrpc_common::FailedRequest, handle: CompletionHandle) {
        let size = self.pool_size.fetch_add(1, Ordering::SeqCst) + 1;
        if size > self.config.max_connections_per_node {
            self.pool_size.fetch_sub(1, Ordering::SeqCst);
            warn!(
                node = %self.node,
                max_connections = self.config.max_connections_per_node,
                "connection limit reached; request stays queued"
            );
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let connect = connection::connect(
                pool.node.clone(),
                Arc::clone(&pool.stats),
                Arc::clone(&pool.backoff),
                Arc::clone(&pool.executor),
            );
            match tokio::time::timeout(pool.config.connect_timeout(), connect).await {
                Ok(Ok((sink, conn))) => {
                    let shared = Arc::clone(&conn.shared);
                    pool.register_conn(conn);
                    let entry = PoolEntry {
                        sink,
                        shared,
                        created_at: Instant::now(),
                    };
                    pool.checkin_channel(entry, true).await;
                }
                Ok(Err(source)) => {
                    debug!(node = %pool.node, error = %source, "connect failed");
                    pool.fail_open(
                        RpcError::ConnectError {
                            source,
                            request: Some(failed),
                        },
                        handle,
                    );
                }
                Err(_) => {
                    debug!(node = %pool.node, timeout_ms = pool.config.connect_timeout_ms, "connect timed out");
                    pool.fail_open(
                        RpcError::ConnectTimeout {
                            timeout_ms: pool.config.connect_timeout_ms,
                            request: Some(failed),
                        },
                        handle,
                    );
                }
            }
        });
    }

    /// Connect failure: releases the slot, tells the backoff strategy, and
    /// fails the originating request only. Other queued waiters stay: another
    /// connect or the sweeper will get to them.
    fn fail_open(&self, error: RpcError, handle: CompletionHandle) {
        self.backoff.notify_failure(self.node.id);
        self.pool_size.fetch_sub(1, Ordering::SeqCst);
        self.finish(handle, Err(error));
    }

    fn register_conn(&self, conn: ConnHandle) {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.retain(|c| c.shared.is_open());
        if self.is_closed() {
            conn.shared.shut_down(true);
        }
        conns.push(conn);
    }

    fn entry_reusable(&self, entry: &PoolEntry) -> bool {
        self.config.close_channel_time_ms < 0
            || (entry.age_ms() as i64) < self.config.close_channel_time_ms
    }

    /// Releases the entry's pool slot. The connection finishes serving the
    /// responses already in flight on it, then closes.
    fn discard_entry(&self, entry: PoolEntry) {
        self.pool_size.fetch_sub(1, Ordering::SeqCst);
        entry.shared.drain();
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        if self.config.stale_request_timeout_mins == 0
            || self.config.stale_request_cleanup_freq_mins == 0
        {
            return;
        }
        let period = Duration::from_secs(self.config.stale_request_cleanup_freq_mins * 60);
        let pool = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.sweep_stale_writes();
            }
        });
        *self.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// One sweeper pass: fails queued requests older than the stale timeout.
    /// Failures raised by user callbacks are contained by the executor, so
    /// the sweeper itself never dies.
    pub fn sweep_stale_writes(&self) -> usize {
        let timeout_ms = self.config.stale_request_timeout_mins * 60_000;
        if timeout_ms == 0 {
            return 0;
        }

        let mut expired = Vec::new();
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|waiter| {
                if waiter.handle.is_consumed() {
                    return false;
                }
                let age_ms = waiter.req.age_ms();
                if age_ms > timeout_ms {
                    expired.push((age_ms, waiter.req.failed_request(), waiter.handle.clone()));
                    false
                } else {
                    true
                }
            });

        let count = expired.len();
        for (age_ms, failed, handle) in expired {
            warn!(node = %self.node, age_ms, "failing stale queued request");
            self.finish(
                handle,
                Err(RpcError::StaleRequest {
                    age_ms,
                    request: Some(failed),
                }),
            );
        }
        count
    }

    fn fail_waiting_closed(&self) {
        let waiters: Vec<QueuedWrite> = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for waiter in waiters {
            let failed = waiter.req.failed_request();
            self.finish(
                waiter.handle,
                Err(RpcError::PoolClosed {
                    request: Some(failed),
                }),
            );
        }
    }

    /// Shuts the pool down: fails every queued waiter, closes every socket
    /// and waits for their readers to finish. Idempotent; requests in flight
    /// on a socket complete with `PoolClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            sweeper.abort();
        }

        self.fail_waiting_closed();

        let idle: Vec<PoolEntry> = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        self.pool_size.fetch_sub(idle.len(), Ordering::SeqCst);
        for entry in &idle {
            entry.shared.shut_down(true);
        }
        drop(idle);

        let conns: Vec<ConnHandle> = self
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for conn in &conns {
            conn.shared.shut_down(true);
        }
        for conn in conns {
            let _ = conn.reader.await;
        }

        if !self.soft_closed.load(Ordering::SeqCst) {
            self.stats.unregister_pool(self.node.id);
        }
    }

    /// Detaches this pool's gauges from the statistics registry without
    /// closing any socket. Idempotent; `close` skips deregistration after
    /// this has run.
    pub fn unregister_gauges(&self) {
        if !self.soft_closed.swap(true, Ordering::SeqCst) {
            self.stats.unregister_pool(self.node.id);
        }
    }

    fn finish(&self, handle: CompletionHandle, result: Result<Bytes, RpcError>) {
        self.executor.execute(Box::new(move || {
            handle.complete(result);
        }));
    }
}

impl PoolGaugeSource for ChannelPool {
    fn pool_gauges(&self) -> PoolGauges {
        PoolGauges {
            open_channels: self.pool_size.load(Ordering::SeqCst),
            max_channels: self.config.max_connections_per_node,
            write_queue_size: self.waiting.lock().unwrap_or_else(|e| e.into_inner()).len(),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
        }
    }
}

fn insert_by_priority(queue: &mut VecDeque<QueuedWrite>, write: QueuedWrite) {
    let pos = queue
        .iter()
        .position(|w| w.req.priority < write.req.priority)
        .unwrap_or(queue.len());
    queue.insert(pos, write);
}
