//! Flush decisions.
//!
//! Kept free of locks and clocks so every strategy can be tested on plain
//! snapshots. Trigger precedence is critical request, early adaptive fire,
//! size, then timer.

use super::types::{AdaptiveConfig, BatchingStrategy, ModelConfig};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// State of one model queue at decision time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub critical_pending: usize,
    pub timer_expired: bool,
}

/// Why a batch fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    Critical,
    EarlyAdaptive,
    IdealSize,
    MaxSize,
    Timer,
    Shutdown,
}

impl FireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireReason::Critical => "critical",
            FireReason::EarlyAdaptive => "early_adaptive",
            FireReason::IdealSize => "ideal_size",
            FireReason::MaxSize => "max_size",
            FireReason::Timer => "timer",
            FireReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Items per second over the given `(batch size, duration)` records
pub fn recent_throughput(recent: &VecDeque<(usize, Duration)>) -> Option<f64> {
    let items: usize = recent.iter().map(|(size, _)| size).sum();
    let secs: f64 = recent.iter().map(|(_, took)| took.as_secs_f64()).sum();
    (items > 0 && secs > 0.0).then(|| items as f64 / secs)
}

/// Decide whether a model queue should fire now
pub fn should_fire(
    strategy: BatchingStrategy,
    model: &ModelConfig,
    adaptive: &AdaptiveConfig,
    snapshot: QueueSnapshot,
    throughput: Option<f64>,
) -> Option<FireReason> {
    if snapshot.pending == 0 {
        return None;
    }

    let by_size = (snapshot.pending >= model.max_batch_size).then_some(FireReason::MaxSize);

    let decision = match strategy {
        BatchingStrategy::SizeBased => by_size,
        BatchingStrategy::TimeBased => None,
        BatchingStrategy::PriorityBased => {
            if snapshot.critical_pending > 0 {
                Some(FireReason::Critical)
            } else {
                by_size
            }
        }
        BatchingStrategy::Adaptive => {
            let early_at = ((model.ideal_batch_size as f64) * adaptive.early_fire_ratio).ceil() as usize;
            let hot = throughput.is_some_and(|t| t > adaptive.throughput_threshold);

            if snapshot.critical_pending > 0 {
                Some(FireReason::Critical)
            } else if hot && snapshot.pending >= early_at.max(1) && snapshot.pending < model.ideal_batch_size {
                Some(FireReason::EarlyAdaptive)
            } else if snapshot.pending >= model.ideal_batch_size {
                Some(FireReason::IdealSize)
            } else {
                by_size
            }
        }
    };

    decision.or(snapshot.timer_expired.then_some(FireReason::Timer))
}
