use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use meshrpc_common::{Node, Result, RpcError};
use tracing::info;

use crate::pool::ChannelPool;

pub(crate) type ChannelPoolFactory = Box<dyn Fn(&Node) -> Arc<ChannelPool> + Send + Sync>;

/// Maps each node to its channel pool, creating pools lazily through the
/// factory. Routing is keyed by node id, so a node whose address changed must
/// be removed and re-added by the membership layer.
pub(crate) struct PoolRegistry {
    pools: RwLock<HashMap<u32, Arc<ChannelPool>>>,
    factory: ChannelPoolFactory,
    /// How long pools of departed nodes keep serving before closing
    grace: Duration,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(factory: ChannelPoolFactory, grace: Duration) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            factory,
            grace,
            closed: AtomicBool::new(false),
        }
    }

    /// The pool for `node`, created on first use.
    pub fn pool_for(&self, node: &Node) -> Result<Arc<ChannelPool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ClusterDisconnected);
        }

        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node.id)
        {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            pools
                .entry(node.id)
                .or_insert_with(|| (self.factory)(node)),
        ))
    }

    /// Applies a membership snapshot: pools for nodes no longer present are
    /// closed after the grace period, pools for surviving nodes are kept.
    pub fn update_membership(&self, current: &HashSet<u32>) {
        let departed: Vec<Arc<ChannelPool>> = {
            let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
            let departed_ids: Vec<u32> = pools
                .keys()
                .filter(|id| !current.contains(id))
                .copied()
                .collect();
            departed_ids
                .into_iter()
                .filter_map(|id| pools.remove(&id))
                .collect()
        };

        let grace = self.grace;
        for pool in departed {
            info!(node = %pool.node(), grace_ms = grace.as_millis() as u64, "node left membership; closing pool after grace period");
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                pool.close().await;
            });
        }
    }

    /// The number of live pools.
    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Closes every pool and waits for their sockets to tear down. New
    /// `pool_for` calls fail with `ClusterDisconnected` from here on.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<ChannelPool>> = self
            .pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        join_all(pools.iter().map(|pool| pool.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffStrategy;
    use crate::config::{PoolConfig, ResponseHandlerConfig};
    use crate::executor::ResponseExecutor;
    use meshrpc_stats::{HealthScoreCalculator, StatsRegistry};

    fn registry(grace: Duration) -> PoolRegistry {
        let stats = Arc::new(StatsRegistry::new(60_000, 0, HealthScoreCalculator::default()));
        let backoff = Arc::new(BackoffStrategy::default());
        let executor = ResponseExecutor::new(ResponseHandlerConfig::default());
        let factory: ChannelPoolFactory = Box::new(move |node| {
            ChannelPool::new(
                node.clone(),
                PoolConfig::default(),
                Arc::clone(&stats),
                Arc::clone(&backoff),
                Arc::clone(&executor),
            )
        });
        PoolRegistry::new(factory, grace)
    }

    fn node(id: u32) -> Node {
        Node::new(id, "127.0.0.1", 9000 + id as u16)
    }

    #[tokio::test]
    async fn test_pools_are_created_lazily_and_cached() {
        let registry = registry(Duration::from_millis(10));
        assert_eq!(registry.len(), 0);

        let a = registry.pool_for(&node(1)).unwrap();
        let b = registry.pool_for(&node(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.pool_for(&node(2)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_membership_diff_closes_departed_pools() {
        let registry = registry(Duration::from_millis(10));
        let pool1 = registry.pool_for(&node(1)).unwrap();
        let pool2 = registry.pool_for(&node(2)).unwrap();

        registry.update_membership(&HashSet::from([2]));
        assert_eq!(registry.len(), 1);

        // Departed pool closes after the grace period
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pool1.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("departed pool should close");
        assert!(!pool2.is_closed());

        // The surviving pool is the same instance
        let again = registry.pool_for(&node(2)).unwrap();
        assert!(Arc::ptr_eq(&pool2, &again));
    }

    #[tokio::test]
    async fn test_departed_pool_survives_through_grace_period() {
        let registry = registry(Duration::from_millis(200));
        let pool = registry.pool_for(&node(1)).unwrap();

        registry.update_membership(&HashSet::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_and_rejects_new_pools() {
        let registry = registry(Duration::from_millis(10));
        let pool = registry.pool_for(&node(1)).unwrap();

        registry.shutdown().await;
        assert!(pool.is_closed());
        assert_eq!(registry.len(), 0);
        assert!(matches!(
            registry.pool_for(&node(1)),
            Err(RpcError::ClusterDisconnected)
        ));
    }
}
