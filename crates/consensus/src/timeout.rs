//! Phase timeout scheduling.
//!
//! Each phase arms a wall-clock timer on entry and cancels it on phase
//! completion; a fired timer reaches the engine as a [`TimeoutInfo`] on the
//! scheduler's channel and triggers the nil-vote/view-change path. A timer
//! is never armed twice for the same (phase, height, round), and timers
//! for rounds the engine has moved past are discarded when they fire.
//!
//! Backoff is linear: `base + round * delta`, so later rounds in a
//! struggling height get progressively more time.

use crate::types::Phase;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Per-phase base timeouts plus the per-round linear backoff delta.
#[derive(Debug, Clone)]
pub struct PhaseTimeouts {
    /// Propose-phase base timeout
    pub propose: Duration,
    /// Prevote-phase base timeout
    pub prevote: Duration,
    /// Precommit-phase base timeout
    pub precommit: Duration,
    /// Commit-phase base timeout
    pub commit: Duration,
    /// Added per round: `base + round * delta`
    pub delta: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            propose: Duration::from_millis(3_000),
            prevote: Duration::from_millis(2_000),
            precommit: Duration::from_millis(2_000),
            commit: Duration::from_millis(2_000),
            delta: Duration::from_millis(500),
        }
    }
}

impl PhaseTimeouts {
    /// Short timeouts for tests.
    pub fn fast() -> Self {
        Self {
            propose: Duration::from_millis(80),
            prevote: Duration::from_millis(60),
            precommit: Duration::from_millis(60),
            commit: Duration::from_millis(60),
            delta: Duration::from_millis(20),
        }
    }

    /// Timeout for a phase at a round, with linear backoff.
    pub fn timeout_for(&self, phase: Phase, round: u64) -> Duration {
        let base = match phase {
            Phase::Propose => self.propose,
            Phase::Prevote => self.prevote,
            Phase::Precommit => self.precommit,
            Phase::Commit => self.commit,
            Phase::Idle | Phase::Finalize => return Duration::ZERO,
        };
        base.saturating_add(self.delta.saturating_mul(round.min(u32::MAX as u64) as u32))
    }
}

/// A fired phase timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    /// Phase the timer was armed for
    pub phase: Phase,
    /// Height when armed
    pub height: u64,
    /// Round when armed
    pub round: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct PendingTimeout {
    phase: Phase,
    height: u64,
    round: u64,
}

/// Schedules and cancels phase timers, delivering fires over an mpsc
/// channel to the engine's caller.
pub struct TimeoutScheduler {
    config: PhaseTimeouts,
    timeout_tx: mpsc::Sender<TimeoutInfo>,
    pending: Arc<Mutex<Vec<PendingTimeout>>>,
}

impl TimeoutScheduler {
    /// Creates a scheduler delivering fires on `timeout_tx`.
    pub fn new(config: PhaseTimeouts, timeout_tx: mpsc::Sender<TimeoutInfo>) -> Self {
        Self {
            config,
            timeout_tx,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Discards timers for rounds before (height, round).
    pub fn advance_to(&self, height: u64, round: u64) {
        self.pending
            .lock()
            .retain(|t| t.height > height || (t.height == height && t.round >= round));
    }

    /// Arms a timer for (phase, height, round). A timer already pending
    /// for the same triple is left alone.
    pub fn schedule(&self, phase: Phase, height: u64, round: u64) {
        let duration = self.config.timeout_for(phase, round);
        if duration.is_zero() {
            return;
        }

        {
            let mut pending = self.pending.lock();
            let key = PendingTimeout {
                phase,
                height,
                round,
            };
            if pending.contains(&key) {
                return;
            }
            pending.push(key);
        }

        debug!(
            phase = %phase,
            height = height,
            round = round,
            duration_ms = duration.as_millis(),
            "scheduling phase timeout"
        );

        let timeout_tx = self.timeout_tx.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            let still_pending = {
                let mut lock = pending.lock();
                let key = PendingTimeout {
                    phase,
                    height,
                    round,
                };
                if let Some(pos) = lock.iter().position(|t| *t == key) {
                    lock.remove(pos);
                    true
                } else {
                    false
                }
            };

            if still_pending {
                trace!(phase = %phase, height = height, round = round, "phase timeout fired");
                let _ = timeout_tx
                    .send(TimeoutInfo {
                        phase,
                        height,
                        round,
                    })
                    .await;
            }
        });
    }

    /// Cancels the timer for (phase, height, round) if still pending.
    pub fn cancel(&self, phase: Phase, height: u64, round: u64) {
        let mut pending = self.pending.lock();
        pending.retain(|t| !(t.phase == phase && t.height == height && t.round == round));
    }

    /// Cancels everything (node shutdown).
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }

    /// Number of armed timers.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let config = PhaseTimeouts::default();
        assert_eq!(
            config.timeout_for(Phase::Propose, 0),
            Duration::from_millis(3_000)
        );
        assert_eq!(
            config.timeout_for(Phase::Propose, 2),
            Duration::from_millis(4_000)
        );
        assert_eq!(config.timeout_for(Phase::Idle, 5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = TimeoutScheduler::new(PhaseTimeouts::fast(), tx);
        scheduler.schedule(Phase::Propose, 1, 0);

        let info = rx.recv().await.unwrap();
        assert_eq!(info.phase, Phase::Propose);
        assert_eq!(info.height, 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_timeout_does_not_fire() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = TimeoutScheduler::new(PhaseTimeouts::fast(), tx);
        scheduler.schedule(Phase::Prevote, 1, 0);
        scheduler.cancel(Phase::Prevote, 1, 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_duplicate_arming() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = TimeoutScheduler::new(PhaseTimeouts::fast(), tx);
        scheduler.schedule(Phase::Propose, 1, 0);
        scheduler.schedule(Phase::Propose, 1, 0);
        assert_eq!(scheduler.pending_count(), 1);

        let _ = rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_advance_discards_stale() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = TimeoutScheduler::new(PhaseTimeouts::fast(), tx);
        scheduler.schedule(Phase::Propose, 1, 0);
        scheduler.advance_to(1, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }
}
