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

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cache::CachedStat;
use crate::now_ms;
use crate::snapshot::{LatencySummary, PendingSummary};

/// A `(finish_wall_ms, latency_ms)` sample.
type FinishedSample = (u64, u64);

/// Rolling request statistics for a single node.
///
/// Two sub-structures: a time-ordered window of finished request latencies,
/// trimmed on read to `[now - window, now]`, and a map from correlation id to
/// start wall-time for requests still in flight. A correlation id lives in at
/// most one of the two: `end_request` removes from pending before appending
/// to finished.
///
/// All derived views (trimmed snapshot, sorted timings, pending summary, and
/// each requested percentile) are cached with [`CachedStat`], so hot readers
/// cost an `Arc` clone.
pub struct NodeTracker {
    window_ms: u64,
    refresh_interval_ms: u64,
    finished: Mutex<VecDeque<FinishedSample>>,
    pending: Mutex<HashMap<Uuid, u64>>,
    finished_snapshot: CachedStat<Vec<FinishedSample>>,
    sorted_timings: CachedStat<Vec<u64>>,
    pending_summary: CachedStat<PendingSummary>,
    // keyed by p scaled to thousandths, one independent cache per parameter
    percentiles: Mutex<HashMap<u32, Arc<CachedStat<u64>>>>,
}

impl NodeTracker {
    pub fn new(window_ms: u64, refresh_interval_ms: u64) -> Self {
        Self {
            window_ms,
            refresh_interval_ms,
            finished: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            finished_snapshot: CachedStat::new(refresh_interval_ms, Vec::new()),
            sorted_timings: CachedStat::new(refresh_interval_ms, Vec::new()),
            pending_summary: CachedStat::new(refresh_interval_ms, PendingSummary::default()),
            percentiles: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `id` as in flight, stamped with the current wall clock.
    pub fn begin_request(&self, id: Uuid) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, now_ms());
    }

    /// Completes `id`: removes it from pending and, if it was there, appends
    /// its latency to the finished window. Returns the measured latency.
    pub fn end_request(&self, id: Uuid) -> Option<u64> {
        let start = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)?;

        let now = now_ms();
        let latency = now.saturating_sub(start);
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.push_back((now, latency));
        // Keep memory bounded: anything already outside the window will never
        // be read again.
        let horizon = now.saturating_sub(self.window_ms);
        while finished.front().is_some_and(|(t, _)| *t < horizon) {
            finished.pop_front();
        }
        Some(latency)
    }

    /// Drops `id` from pending without recording a latency sample, for
    /// requests that failed after being written.
    pub fn fail_request(&self, id: Uuid) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Finished samples inside the window, time-ordered, through the cache.
    fn snapshot_finished(&self) -> Arc<Vec<FinishedSample>> {
        self.finished_snapshot.get(|| {
            let horizon = now_ms().saturating_sub(self.window_ms);
            self.finished
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter(|(t, _)| *t >= horizon)
                .copied()
                .collect()
        })
    }

    fn snapshot_sorted_timings(&self) -> Arc<Vec<u64>> {
        self.sorted_timings.get(|| {
            let mut timings: Vec<u64> =
                self.snapshot_finished().iter().map(|(_, l)| *l).collect();
            timings.sort_unstable();
            timings
        })
    }

    /// The latency value at `⌊p · n⌋` over the windowed samples, 0 when the
    /// window is empty. `p` is clamped to `[0, 1]`.
    pub fn percentile(&self, p: f64) -> u64 {
        let p = p.clamp(0.0, 1.0);
        let key = (p * 1000.0) as u32;

        let cache = {
            let mut percentiles = self.percentiles.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                percentiles
                    .entry(key)
                    .or_insert_with(|| Arc::new(CachedStat::new(self.refresh_interval_ms, 0))),
            )
        };

        *cache.get(|| {
            let timings = self.snapshot_sorted_timings();
            if timings.is_empty() {
                return 0;
            }
            let index = ((p * timings.len() as f64) as usize).min(timings.len() - 1);
            timings[index]
        })
    }

    /// Finished requests in the last second, by binary search over the
    /// time-ordered window.
    pub fn rps(&self) -> u64 {
        let snapshot = self.snapshot_finished();
        let cutoff = now_ms().saturating_sub(1000);
        let first_recent = snapshot.partition_point(|(t, _)| *t < cutoff);
        (snapshot.len() - first_recent) as u64
    }

    /// Count and median age of requests still in flight.
    pub fn pending_summary(&self) -> Arc<PendingSummary> {
        self.pending_summary.get(|| {
            let now = now_ms();
            let mut ages: Vec<u64> = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .map(|start| now.saturating_sub(*start))
                .collect();
            ages.sort_unstable();
            let median_age_ms = if ages.is_empty() {
                0
            } else {
                ages[ages.len() / 2]
            };
            PendingSummary {
                count: ages.len(),
                median_age_ms,
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The full latency summary exported to observability.
    pub fn latency_summary(&self) -> LatencySummary {
        LatencySummary {
            median: self.percentile(0.5),
            p75: self.percentile(0.75),
            p90: self.percentile(0.9),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
            rps: self.rps(),
            sample_count: self.snapshot_finished().len(),
        }
    }
}
