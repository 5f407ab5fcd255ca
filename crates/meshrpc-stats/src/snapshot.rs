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

use serde::{Deserialize, Serialize};

/// Windowed latency summary for one node, all values in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub median: u64,
    pub p75: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    /// Finished requests in the last second
    pub rps: u64,
    /// Samples inside the window the summary was computed from
    pub sample_count: usize,
}

/// In-flight load summary for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingSummary {
    /// Requests written but not yet answered
    pub count: usize,
    /// Median age of those requests in milliseconds
    pub median_age_ms: u64,
}

/// Gauges exported by a single channel pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolGauges {
    pub open_channels: usize,
    pub max_channels: usize,
    pub write_queue_size: usize,
    pub requests_sent: u64,
}

/// Everything observable about one node at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatsSnapshot {
    pub node_id: u32,
    pub latency: LatencySummary,
    pub pending: PendingSummary,
    /// Lower is healthier
    pub health_score: f64,
    /// Absent when the node's pool has deregistered its gauges
    pub gauges: Option<PoolGauges>,
}

/// A point-in-time view across all tracked nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub nodes: HashMap<u32, NodeStatsSnapshot>,
    /// Mean of the per-node health scores; 0 when no nodes are tracked
    pub cluster_health: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_to_json() {
        let mut nodes = HashMap::new();
        nodes.insert(
            1,
            NodeStatsSnapshot {
                node_id: 1,
                latency: LatencySummary {
                    median: 4,
                    p75: 6,
                    p90: 9,
                    p95: 11,
                    p99: 30,
                    rps: 120,
                    sample_count: 512,
                },
                pending: PendingSummary {
                    count: 3,
                    median_age_ms: 2,
                },
                health_score: 6.5,
                gauges: Some(PoolGauges {
                    open_channels: 2,
                    max_channels: 4,
                    write_queue_size: 0,
                    requests_sent: 4096,
                }),
            },
        );
        let snapshot = StatsSnapshot {
            nodes,
            cluster_health: 6.5,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: StatsSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.nodes.len(), 1);
        assert_eq!(decoded.nodes[&1].latency.p99, 30);
        assert_eq!(decoded.nodes[&1].gauges.as_ref().unwrap().requests_sent, 4096);
    }

    #[test]
    fn test_defaults_are_zeroed() {
        let summary = LatencySummary::default();
        assert_eq!(summary.median, 0);
        assert_eq!(summary.rps, 0);
        assert_eq!(summary.sample_count, 0);

        let pending = PendingSummary::default();
        assert_eq!(pending.count, 0);
        assert_eq!(pending.median_age_ms, 0);
    }
}
