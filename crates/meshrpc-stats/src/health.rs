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

use crate::snapshot::{LatencySummary, PendingSummary};

/// Derives a scalar health score for a node from its pending load and its
/// historical latency, both taken at the median. Lower is healthier.
///
/// Load balancers compare scores across nodes (and against
/// `outlier_multiplier * cluster mean + outlier_constant`) to mask slow
/// nodes; the calculator itself only promises a scalar that grows with
/// pending age and finished latency.
#[derive(Debug, Clone)]
pub struct HealthScoreCalculator {
    pub outlier_multiplier: f64,
    pub outlier_constant: f64,
}

impl Default for HealthScoreCalculator {
    fn default() -> Self {
        Self {
            outlier_multiplier: 2.0,
            outlier_constant: 10.0,
        }
    }
}

impl HealthScoreCalculator {
    pub fn new(outlier_multiplier: f64, outlier_constant: f64) -> Self {
        Self {
            outlier_multiplier,
            outlier_constant,
        }
    }

    /// The node's health score: median pending age weighted by the outlier
    /// multiplier, plus median finished latency.
    pub fn score(&self, pending: &PendingSummary, finished: &LatencySummary) -> f64 {
        pending.median_age_ms as f64 * self.outlier_multiplier + finished.median as f64
    }

    /// Whether `score` marks the node as an outlier against the cluster mean.
    pub fn is_outlier(&self, score: f64, cluster_mean: f64) -> bool {
        score > cluster_mean * self.outlier_multiplier + self.outlier_constant
    }
}
