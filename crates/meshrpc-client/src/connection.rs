use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use meshrpc_common::{FailedRequest, Frame, FrameCodec, Node, RpcError};
use meshrpc_stats::StatsRegistry;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::backoff::BackoffStrategy;
use crate::executor::ResponseExecutor;
use crate::request::CompletionHandle;

pub(crate) type FramedSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

/// A request written on this connection that still awaits its response.
pub(crate) struct PendingResponse {
    pub handle: CompletionHandle,
    pub failed: FailedRequest,
}

/// State shared between a connection's pooled writer half and its reader
/// task.
///
/// Responses come back on the socket the request was written to, so the
/// correlation table is per connection: the writer registers an entry before
/// each write, the reader resolves it when the matching frame arrives, and
/// whatever is left when the socket dies is failed by the reader on exit.
pub(crate) struct ConnShared {
    pub node: Node,
    pending: Mutex<HashMap<Uuid, PendingResponse>>,
    /// Cleared by the reader task on exit
    open: AtomicBool,
    /// Set when the entry leaves the pool for good: the reader closes the
    /// socket once the last pending response resolves
    draining: AtomicBool,
    /// Set by pool shutdown so orphaned requests fail with `PoolClosed`
    /// instead of a write error
    closing: AtomicBool,
    shutdown: Notify,
}

impl ConnShared {
    fn new(node: Node) -> Self {
        Self {
            node,
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn register_pending(&self, id: Uuid, pending: PendingResponse) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, pending);
    }

    pub fn take_pending(&self, id: &Uuid) -> Option<PendingResponse> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    fn pending_is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Marks the connection as out of the pool. The reader keeps running
    /// until the responses already in flight resolve, then closes the socket.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        if self.pending_is_empty() {
            self.shut_down(false);
        }
    }

    /// Forces the reader to exit and the socket to close.
    pub fn shut_down(&self, pool_closing: bool) {
        if pool_closing {
            self.closing.store(true, Ordering::Release);
        }
        self.open.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }
}

/// A live connection: the writer half the pool checks in and out, the shared
/// correlation state and the reader task's handle.
pub(crate) struct ConnHandle {
    pub shared: Arc<ConnShared>,
    pub reader: JoinHandle<()>,
}

/// Opens a TCP connection to `node` and spawns its reader task.
pub(crate) async fn connect(
    node: Node,
    stats: Arc<StatsRegistry>,
    backoff: Arc<BackoffStrategy>,
    executor: Arc<ResponseExecutor>,
) -> io::Result<(FramedSink, ConnHandle)> {
    let stream = TcpStream::connect(node.address()).await?;
    stream.set_nodelay(true)?;

    let (sink, stream) = Framed::new(stream, FrameCodec).split();
    let shared = Arc::new(ConnShared::new(node));
    let reader = tokio::spawn(run_reader(
        stream,
        Arc::clone(&shared),
        stats,
        backoff,
        executor,
    ));

    Ok((sink, ConnHandle { shared, reader }))
}

/// Reads response frames until the socket dies or the pool shuts the
/// connection down, resolving completions by correlation id. On exit, fails
/// every response still pending on this socket.
async fn run_reader(
    mut stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    shared: Arc<ConnShared>,
    stats: Arc<StatsRegistry>,
    backoff: Arc<BackoffStrategy>,
    executor: Arc<ResponseExecutor>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => {
                    match shared.take_pending(&frame.id) {
                        Some(pending) => {
                            stats.end_request(shared.node.id, frame.id);
                            backoff.notify_success(shared.node.id);
                            let body = frame.body;
                            executor.execute(Box::new(move || {
                                pending.handle.complete(Ok(body));
                            }));
                        }
                        None => {
                            trace!(node = %shared.node, id = %frame.id, "response for unknown correlation id");
                        }
                    }
                    if shared.draining.load(Ordering::Acquire) && shared.pending_is_empty() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    // EOF and reset are the normal end of a connection
                    if !matches!(
                        &error,
                        RpcError::Io(io_error)
                            if io_error.kind() == io::ErrorKind::UnexpectedEof
                            || io_error.kind() == io::ErrorKind::ConnectionReset
                    ) {
                        debug!(node = %shared.node, %error, "error reading from connection");
                    }
                    break;
                }
                None => break,
            }
        }
    }

    shared.open.store(false, Ordering::Release);

    let orphans: Vec<(Uuid, PendingResponse)> = shared
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();

    if orphans.is_empty() {
        return;
    }

    let pool_closing = shared.closing.load(Ordering::Acquire);
    if !pool_closing {
        backoff.notify_failure(shared.node.id);
    }
    for (id, pending) in orphans {
        stats.fail_request(shared.node.id, id);
        let error = if pool_closing {
            RpcError::PoolClosed {
                request: Some(pending.failed.clone()),
            }
        } else {
            RpcError::WriteError {
                message: "connection closed before the response arrived".to_string(),
                request: Some(pending.failed.clone()),
            }
        };
        executor.execute(Box::new(move || {
            pending.handle.complete(Err(error));
        }));
    }
}
