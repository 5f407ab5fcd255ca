use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use meshrpc_common::{FailedRequest, Node, RpcError};
use uuid::Uuid;

use crate::now_ms;

/// The terminal continuation of a request: invoked exactly once with the raw
/// response bytes or the failure.
pub type Callback = Box<dyn FnOnce(Result<Bytes, RpcError>) + Send + 'static>;

/// A clonable at-most-once slot around a request's completion callback.
///
/// Several paths race to finish a request: the drain loop, a failed connect,
/// the stale sweeper, the response reader and pool shutdown. Whichever gets
/// there first consumes the callback; everyone else finds the slot empty and
/// does nothing. This is what guarantees a single terminal invocation.
pub struct CompletionHandle {
    callback: Arc<Mutex<Option<Callback>>>,
}

impl Clone for CompletionHandle {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl CompletionHandle {
    pub fn new(callback: Callback) -> Self {
        Self {
            callback: Arc::new(Mutex::new(Some(callback))),
        }
    }

    /// A handle for write-only messages: completing it is a no-op, but it
    /// still tracks whether a terminal outcome was delivered.
    pub fn none() -> Self {
        Self::new(Box::new(|_| {}))
    }

    /// Invokes the callback if nobody has yet. Returns whether this call won.
    pub fn complete(&self, result: Result<Bytes, RpcError>) -> bool {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Whether a terminal outcome was already delivered.
    pub fn is_consumed(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// A lazily-serialized request payload.
///
/// Serialization runs at most once, on first access, and the encoded bytes
/// are shared by every retry of the request.
pub struct RequestBody {
    encode: Box<dyn Fn() -> Result<Bytes, String> + Send + Sync>,
    cell: OnceLock<Result<Bytes, String>>,
}

impl RequestBody {
    /// A body that is already bytes.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            encode: Box::new(move || Ok(bytes.clone())),
            cell: OnceLock::new(),
        }
    }

    /// A body produced by `encode` on first access.
    pub fn lazy(encode: impl Fn() -> Result<Bytes, String> + Send + Sync + 'static) -> Self {
        Self {
            encode: Box::new(encode),
            cell: OnceLock::new(),
        }
    }

    /// The encoded payload, serializing on first call.
    pub fn encoded(&self) -> Result<Bytes, RpcError> {
        self.cell
            .get_or_init(|| (self.encode)())
            .clone()
            .map_err(RpcError::Serialization)
    }

    /// Whether serialization has already run.
    pub fn is_encoded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("encoded", &self.is_encoded())
            .finish()
    }
}

/// One attempt at delivering a message to one node.
///
/// A fresh submission is attempt 0; each retry builds a new record with a new
/// correlation id and `attempt + 1`, sharing the same body. The correlation
/// id is unique per attempt so late responses from a failed attempt can never
/// satisfy its retry.
#[derive(Debug)]
pub struct Request {
    pub id: Uuid,
    pub name: Option<String>,
    pub priority: i32,
    pub node: Node,
    pub body: Arc<RequestBody>,
    /// Wall-clock creation time of this attempt
    pub created_at_ms: u64,
    /// Monotonic creation time, used for queue-age deadlines
    pub created_at: Instant,
    pub attempt: u32,
    pub expects_response: bool,
}

impl Request {
    pub fn new(
        node: Node,
        name: Option<String>,
        priority: i32,
        body: Arc<RequestBody>,
        expects_response: bool,
    ) -> Self {
        Self::attempt(node, name, priority, body, 0, expects_response)
    }

    pub fn attempt(
        node: Node,
        name: Option<String>,
        priority: i32,
        body: Arc<RequestBody>,
        attempt: u32,
        expects_response: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            priority,
            node,
            body,
            created_at_ms: now_ms(),
            created_at: Instant::now(),
            attempt,
            expects_response,
        }
    }

    /// Age of this attempt in milliseconds.
    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// The description attached to errors for this request.
    pub fn failed_request(&self) -> FailedRequest {
        FailedRequest {
            node: self.node.clone(),
            attempt: self.attempt,
            name: self.name.clone(),
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_completion_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let handle = CompletionHandle::new(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!handle.is_consumed());
        assert!(handle.complete(Ok(Bytes::new())));
        assert!(handle.is_consumed());
        assert!(!handle.complete(Err(RpcError::NoNodesAvailable)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_clones_share_the_slot() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let handle = CompletionHandle::new(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        let other = handle.clone();

        assert!(other.complete(Ok(Bytes::new())));
        assert!(handle.is_consumed());
        assert!(!handle.complete(Ok(Bytes::new())));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_none_handle_tracks_consumption() {
        let handle = CompletionHandle::none();
        assert!(!handle.is_consumed());
        assert!(handle.complete(Ok(Bytes::new())));
        assert!(handle.is_consumed());
    }

    #[test]
    fn test_body_encodes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let body = RequestBody::lazy(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"payload"))
        });

        assert!(!body.is_encoded());
        assert_eq!(body.encoded().unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(body.encoded().unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(body.is_encoded());
    }

    #[test]
    fn test_body_encode_failure_is_sticky() {
        let body = RequestBody::lazy(|| Err("unsupported value".to_string()));
        assert!(matches!(
            body.encoded(),
            Err(RpcError::Serialization(message)) if message == "unsupported value"
        ));
        assert!(body.encoded().is_err());
    }

    #[test]
    fn test_attempts_get_distinct_ids() {
        let node = Node::new(1, "localhost", 9001);
        let body = Arc::new(RequestBody::from_bytes(Bytes::from_static(b"x")));

        let first = Request::new(node.clone(), Some("echo".into()), 0, Arc::clone(&body), true);
        let retry = Request::attempt(node, Some("echo".into()), 0, body, 1, true);

        assert_ne!(first.id, retry.id);
        assert_eq!(first.attempt, 0);
        assert_eq!(retry.attempt, 1);
    }

    #[test]
    fn test_failed_request_snapshot() {
        let node = Node::new(3, "localhost", 9001);
        let body = Arc::new(RequestBody::from_bytes(Bytes::new()));
        let req = Request::attempt(node, Some("echo".into()), 5, body, 2, true);

        let fr = req.failed_request();
        assert_eq!(fr.node.id, 3);
        assert_eq!(fr.attempt, 2);
        assert_eq!(fr.priority, 5);
        assert_eq!(fr.name.as_deref(), Some("echo"));
    }
}
