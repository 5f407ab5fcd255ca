// Copyright 2025 Meshrpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::health::HealthScoreCalculator;
use crate::snapshot::{NodeStatsSnapshot, PoolGauges, StatsSnapshot};
use crate::tracker::NodeTracker;

/// Anything that can report pool gauges for a node.
///
/// Channel pools implement this and register themselves; deregistering
/// detaches observability without touching the pool itself, so a caller can
/// silence metric export ahead of a full shutdown.
pub trait PoolGaugeSource: Send + Sync {
    fn pool_gauges(&self) -> PoolGauges;
}

/// Thread-safe registry of per-node trackers and pool gauge sources.
///
/// Trackers are created lazily, one per node id, with get-or-insert under the
/// write lock so exactly one tracker ever exists per node.
pub struct StatsRegistry {
    window_ms: u64,
    refresh_interval_ms: u64,
    trackers: RwLock<HashMap<u32, Arc<NodeTracker>>>,
    gauges: RwLock<HashMap<u32, Arc<dyn PoolGaugeSource>>>,
    health: HealthScoreCalculator,
}

impl StatsRegistry {
    pub fn new(window_ms: u64, refresh_interval_ms: u64, health: HealthScoreCalculator) -> Self {
        Self {
            window_ms,
            refresh_interval_ms,
            trackers: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            health,
        }
    }

    /// The tracker for `node_id`, created on first use.
    pub fn tracker_for(&self, node_id: u32) -> Arc<NodeTracker> {
        if let Some(tracker) = self
            .trackers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node_id)
        {
            return Arc::clone(tracker);
        }

        let mut trackers = self.trackers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(trackers.entry(node_id).or_insert_with(|| {
            Arc::new(NodeTracker::new(self.window_ms, self.refresh_interval_ms))
        }))
    }

    /// Records that a request was written to `node_id` and awaits a response.
    pub fn begin_request(&self, node_id: u32, id: Uuid) {
        self.tracker_for(node_id).begin_request(id);
    }

    /// Records that the response for `id` arrived.
    pub fn end_request(&self, node_id: u32, id: Uuid) {
        self.tracker_for(node_id).end_request(id);
    }

    /// Clears `id` from pending without a latency sample (failed in flight).
    pub fn fail_request(&self, node_id: u32, id: Uuid) {
        self.tracker_for(node_id).fail_request(id);
    }

    /// Attaches a pool's gauges to the node's exported statistics.
    pub fn register_pool(&self, node_id: u32, source: Arc<dyn PoolGaugeSource>) {
        self.gauges
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id, source);
    }

    /// Detaches a pool's gauges. Idempotent.
    pub fn unregister_pool(&self, node_id: u32) {
        self.gauges
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id);
    }

    /// The health score for one node, or `None` if it was never tracked.
    pub fn health_score(&self, node_id: u32) -> Option<f64> {
        let tracker = Arc::clone(
            self.trackers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&node_id)?,
        );
        Some(self.score_of(&tracker))
    }

    fn score_of(&self, tracker: &NodeTracker) -> f64 {
        let pending = tracker.pending_summary();
        let finished = tracker.latency_summary();
        self.health.score(&pending, &finished)
    }

    /// A point-in-time view across every tracked node.
    pub fn snapshot(&self) -> StatsSnapshot {
        let trackers: Vec<(u32, Arc<NodeTracker>)> = self
            .trackers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, t)| (*id, Arc::clone(t)))
            .collect();
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());

        let mut nodes = HashMap::with_capacity(trackers.len());
        let mut total_score = 0.0;
        for (node_id, tracker) in &trackers {
            let latency = tracker.latency_summary();
            let pending = (*tracker.pending_summary()).clone();
            let health_score = self.health.score(&pending, &latency);
            total_score += health_score;
            nodes.insert(
                *node_id,
                NodeStatsSnapshot {
                    node_id: *node_id,
                    latency,
                    pending,
                    health_score,
                    gauges: gauges.get(node_id).map(|s| s.pool_gauges()),
                },
            );
        }

        let cluster_health = if nodes.is_empty() {
            0.0
        } else {
            total_score / nodes.len() as f64
        };

        StatsSnapshot {
            nodes,
            cluster_health,
        }
    }
}
