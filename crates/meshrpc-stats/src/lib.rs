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

//! Rolling request statistics for the meshrpc client.
//!
//! Tracks, per node, a sliding window of finished request latencies and the
//! start times of requests still in flight, and answers percentile, RPS and
//! pending-load queries from them. Statistics are read far more often than
//! they change (the load balancer consults them per request), so every
//! derived view sits behind a TTL cache that allows at most one concurrent
//! recomputation; other readers get the previous value.
//!
//! # Components
//!
//! - [`tracker`] - per-node finished window and pending map
//! - [`cache`] - the CAS-gated TTL cache used by all derived views
//! - [`registry`] - node-id keyed tracker map plus pool gauge registration
//! - [`snapshot`] - serializable summaries exported to observability
//! - [`health`] - the scalar health score load balancers consume

pub mod cache;
pub mod health;
pub mod registry;
pub mod snapshot;
pub mod tracker;

pub use cache::CachedStat;
pub use health::HealthScoreCalculator;
pub use registry::{PoolGaugeSource, StatsRegistry};
pub use snapshot::{LatencySummary, NodeStatsSnapshot, PendingSummary, PoolGauges, StatsSnapshot};
pub use tracker::NodeTracker;

use std::time::SystemTime;

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
