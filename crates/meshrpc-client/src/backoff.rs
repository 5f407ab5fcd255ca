use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff tuning: how long a failing node is masked from selection.
///
/// The cooldown grows exponentially with consecutive failures and is capped:
/// `base * multiplier^(failures - 1)`, at most `max`. A jitter fraction is
/// added so a fleet of clients does not unmask a recovering node in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub multiplier: f64,
    /// Fraction of the cooldown added as random jitter, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_cooldown_ms: 1000,
            max_cooldown_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Cooldown for the given consecutive-failure count, without jitter.
    pub fn cooldown(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(consecutive_failures as i32 - 1);
        let cooldown_ms = (self.base_cooldown_ms as f64 * factor) as u64;
        Duration::from_millis(cooldown_ms.min(self.max_cooldown_ms))
    }
}

#[derive(Debug)]
struct FailureState {
    consecutive_failures: u32,
    masked_until: Instant,
}

/// Tracks node failures reported by the pool layer and masks unhealthy nodes
/// from load-balancer selection for a cooldown.
///
/// The pool notifies it of connect and write failures; the connection reader
/// notifies it of successful responses, which clears the node's state.
#[derive(Debug, Default)]
pub struct BackoffStrategy {
    config: BackoffConfig,
    state: Mutex<HashMap<u32, FailureState>>,
}

impl BackoffStrategy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure against `node_id` and extends its mask.
    pub fn notify_failure(&self, node_id: u32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(node_id).or_insert(FailureState {
            consecutive_failures: 0,
            masked_until: Instant::now(),
        });
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let cooldown = self.config.cooldown(entry.consecutive_failures);
        let jitter_ms = (cooldown.as_millis() as f64 * self.config.jitter) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        entry.masked_until = Instant::now() + cooldown + jitter;
    }

    /// Clears the failure state for `node_id`.
    pub fn notify_success(&self, node_id: u32) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id);
    }

    /// Whether `node_id` is currently selectable.
    pub fn can_serve(&self, node_id: u32) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get(&node_id) {
            Some(entry) => Instant::now() >= entry.masked_until,
            None => true,
        }
    }

    /// Consecutive failures recorded for `node_id`.
    pub fn consecutive_failures(&self, node_id: u32) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node_id)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
