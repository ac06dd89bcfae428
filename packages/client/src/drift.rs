//! Drift correction against the authoritative playback target.
//!
//! Compares the local player's reported position with a command's target
//! position and picks the cheapest correction that gets back in sync:
//! nothing for sub-half-second drift, a temporary rate nudge below two
//! seconds, a hard seek beyond that. Play/pause state is reconciled after
//! any correction. The rate-reset timer is an owned task, replaced (never
//! stacked) when a newer command arrives before it fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::PlayerError;
use crate::player::PlayerDriver;

/// Below this drift the position is left alone
pub const MINOR_DRIFT_SECS: f64 = 0.5;
/// At or above this drift the player hard-seeks
pub const MAJOR_DRIFT_SECS: f64 = 2.0;
/// Temporary rate when the local player is ahead of the target
pub const SLOW_DOWN_RATE: f64 = 0.95;
/// Temporary rate when the local player is behind the target
pub const CATCH_UP_RATE: f64 = 1.05;

/// The state a received command wants the player in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetState {
    pub position: f64,
    pub playing: bool,
}

/// Chosen correction for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftAction {
    /// Drift below the minor threshold; only play/pause may change
    KeepPosition,
    /// Temporary rate scale until the drift is consumed
    RateAdjust { rate: f64, duration: Duration },
    /// Drift too large to nudge away
    HardSeek,
}

/// Pure correction policy; deterministic for a given position pair.
pub fn classify(local_position: f64, target_position: f64) -> DriftAction {
    let drift = (local_position - target_position).abs();
    if drift < MINOR_DRIFT_SECS {
        return DriftAction::KeepPosition;
    }
    if drift < MAJOR_DRIFT_SECS {
        let rate = if local_position > target_position {
            SLOW_DOWN_RATE
        } else {
            CATCH_UP_RATE
        };
        // Time to consume the drift at a 5% speed difference
        let duration = Duration::from_secs_f64(drift / (rate - 1.0).abs());
        return DriftAction::RateAdjust { rate, duration };
    }
    DriftAction::HardSeek
}

pub struct DriftController {
    player: Arc<dyn PlayerDriver>,
    rate_reset: Option<JoinHandle<()>>,
}

impl DriftController {
    pub fn new(player: Arc<dyn PlayerDriver>) -> Self {
        Self {
            player,
            rate_reset: None,
        }
    }

    /// Reconcile the local player against a command's target state.
    pub async fn apply(&mut self, target: TargetState) -> Result<DriftAction, PlayerError> {
        let status = self.player.status().await?;
        let action = classify(status.position, target.position);

        match action {
            DriftAction::KeepPosition => {}
            DriftAction::RateAdjust { rate, duration } => {
                self.cancel_pending_reset();
                self.player.set_rate(rate).await?;
                let player = self.player.clone();
                self.rate_reset = Some(tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    if let Err(e) = player.set_rate(1.0).await {
                        tracing::warn!("Failed to reset playback rate: {}", e);
                    }
                }));
                tracing::debug!(
                    "Nudging rate to {} for {:?} to close {:.2}s of drift",
                    rate,
                    duration,
                    (status.position - target.position).abs()
                );
            }
            DriftAction::HardSeek => {
                // A superseded nudge must not fire after the seek
                self.cancel_pending_reset();
                self.player.seek(target.position).await?;
                tracing::debug!(
                    "Hard seek {:.2}s -> {:.2}s",
                    status.position,
                    target.position
                );
            }
        }

        if status.playing != target.playing {
            if target.playing {
                self.player.play(None).await?;
            } else {
                self.player.pause().await?;
            }
        }

        Ok(action)
    }

    /// Drop any pending rate-reset task, e.g. on disconnect.
    pub fn cancel_pending_reset(&mut self) {
        if let Some(task) = self.rate_reset.take() {
            task.abort();
        }
    }
}

impl Drop for DriftController {
    fn drop(&mut self) {
        self.cancel_pending_reset();
    }
}
