//! Consensus progress metrics.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Round latency samples retained for the rolling average.
const LATENCY_WINDOW: usize = 100;

/// Counters describing consensus progress. Observability only; nothing in
/// the protocol reads these.
#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    /// Rounds entered across all heights
    pub total_rounds: u64,
    /// Rounds that ended in a finalize
    pub successful_rounds: u64,
    /// Heights that hit the round cap
    pub failed_heights: u64,
    /// View changes (round increments without finalize)
    pub view_changes: u64,
    /// Most recent round latencies in milliseconds
    latencies_ms: VecDeque<u64>,
    /// Voters over active validators for the last decided height
    last_participation: Option<(usize, usize)>,
}

impl ConsensusMetrics {
    /// Records entry into a round.
    pub fn record_round_start(&mut self) {
        self.total_rounds += 1;
    }

    /// Records a view change.
    pub fn record_view_change(&mut self) {
        self.view_changes += 1;
    }

    /// Records a finalized height with the round's wall-clock latency and
    /// the commit participation (voters, active validators).
    pub fn record_finalize(&mut self, latency: Duration, voters: usize, active: usize) {
        self.successful_rounds += 1;
        self.latencies_ms.push_back(latency.as_millis() as u64);
        while self.latencies_ms.len() > LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.last_participation = Some((voters, active));
    }

    /// Records a height that exceeded the round cap.
    pub fn record_height_failed(&mut self) {
        self.failed_heights += 1;
    }

    /// Average round latency over the retained window, in milliseconds.
    pub fn avg_round_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<u64>() as f64 / self.latencies_ms.len() as f64
    }

    /// Commit participation rate for the last decided height, in [0, 1].
    pub fn participation_rate(&self) -> f64 {
        match self.last_participation {
            Some((voters, active)) if active > 0 => voters as f64 / active as f64,
            _ => 0.0,
        }
    }

    /// Point-in-time copy of the counters, for status reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_rounds: self.total_rounds,
            successful_rounds: self.successful_rounds,
            failed_heights: self.failed_heights,
            view_changes: self.view_changes,
            avg_round_latency_ms: self.avg_round_latency_ms(),
            participation_rate: self.participation_rate(),
        }
    }
}

/// Serializable view of [`ConsensusMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Rounds entered across all heights
    pub total_rounds: u64,
    /// Rounds that ended in a finalize
    pub successful_rounds: u64,
    /// Heights that hit the round cap
    pub failed_heights: u64,
    /// View changes
    pub view_changes: u64,
    /// Average round latency over the retained window
    pub avg_round_latency_ms: f64,
    /// Commit participation for the last decided height
    pub participation_rate: f64,
}
