use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use meshrpc_common::{Endpoint, Node, Result};

use crate::backoff::BackoffStrategy;

/// Selects the destination node for a request.
///
/// Implementations are snapshot-immutable: one balancer is built per
/// membership snapshot and replaced wholesale when the membership changes, so
/// `next_node` takes `&self` and must be safe to call from many tasks.
pub trait LoadBalancer: Send + Sync {
    /// The next node able to serve both capability masks, or `None` when no
    /// such node exists in the snapshot.
    fn next_node(&self, capability: u64, persistent_capability: u64) -> Option<Node>;
}

/// Builds a [`LoadBalancer`] from a membership snapshot.
///
/// A construction failure is sticky: the client records it and fails sends
/// with the recorded cause until the next snapshot arrives.
pub trait LoadBalancerFactory: Send + Sync {
    fn new_balancer(&self, endpoints: &[Endpoint]) -> Result<Box<dyn LoadBalancer>>;
}

/// Round-robin over capability-matching endpoints, skipping nodes the
/// backoff strategy currently masks.
///
/// When every matching node is masked the rotation falls back to ignoring
/// the masks: a cluster that is entirely cooling down still gets offered
/// traffic rather than reporting an outage.
pub struct RoundRobinLoadBalancer {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
    backoff: Arc<BackoffStrategy>,
}

impl RoundRobinLoadBalancer {
    pub fn new(endpoints: Vec<Endpoint>, backoff: Arc<BackoffStrategy>) -> Self {
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
            backoff,
        }
    }

    fn rotate(&self, capability: u64, persistent_capability: u64, honor_backoff: bool) -> Option<Node> {
        let len = self.endpoints.len();
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let endpoint = &self.endpoints[idx];
            if !endpoint.can_serve(capability, persistent_capability) {
                continue;
            }
            if honor_backoff && !self.backoff.can_serve(endpoint.node.id) {
                continue;
            }
            return Some(endpoint.node.clone());
        }
        None
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn next_node(&self, capability: u64, persistent_capability: u64) -> Option<Node> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.rotate(capability, persistent_capability, true)
            .or_else(|| self.rotate(capability, persistent_capability, false))
    }
}

/// The default [`LoadBalancerFactory`], producing [`RoundRobinLoadBalancer`]s
/// that share the client's backoff strategy.
pub struct RoundRobinFactory {
    backoff: Arc<BackoffStrategy>,
}

impl RoundRobinFactory {
    pub fn new(backoff: Arc<BackoffStrategy>) -> Self {
        Self { backoff }
    }
}

impl LoadBalancerFactory for RoundRobinFactory {
    fn new_balancer(&self, endpoints: &[Endpoint]) -> Result<Box<dyn LoadBalancer>> {
        Ok(Box::new(RoundRobinLoadBalancer::new(
            endpoints.to_vec(),
            Arc::clone(&self.backoff),
        )))
    }
}
