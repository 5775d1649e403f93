//! Client-side movement prediction and server reconciliation.
//!
//! The client never waits for the server to move: every sampled command is
//! simulated locally the moment it is sent, and the resulting origin is
//! remembered per command number. When an authoritative frame arrives for a
//! command the client already predicted, the two origins are compared; a
//! divergence beyond the configured epsilon snaps the predicted state to
//! the authoritative one and replays only the newer commands. Exact
//! equality would be the wrong comparison: re-simulation jitter inside the
//! quantization grid must not rubber-band the view every frame, so the
//! epsilon is tunable and discrete flags are compared exactly.

use arclight_core::{player_move, MoveState, UserCmd};
use tracing::debug;

/// Commands retained for replay; must cover the worst-case round trip at
/// the client frame rate. Ring indices recycle modulo this depth.
pub const CMD_BACKUP: usize = 64;
/// Ring index mask.
pub const CMD_MASK: usize = CMD_BACKUP - 1;

/// Running accuracy counters, surfaced to the netgraph.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionMetrics {
    /// Commands predicted ahead of acknowledgment.
    pub predicted: u64,
    /// Reconciliations that found a divergence beyond epsilon.
    pub corrections: u64,
    /// Largest divergence seen, in world units.
    pub max_error: f32,
}

/// Outcome of reconciling one authoritative frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// Nothing to compare yet (no prediction recorded for that command).
    NotPredicted,
    /// Divergence within epsilon; prediction stands. The residual error is
    /// reported so the view can decay it smoothly instead of stepping.
    InSync {
        /// Predicted-minus-authoritative origin difference, world units.
        error: [f32; 3],
    },
    /// Divergence beyond epsilon; state was snapped to the server and the
    /// unacknowledged commands replayed.
    Corrected {
        /// Magnitude of the divergence, world units.
        error_distance: f32,
    },
}

/// Command ring plus per-command predicted origins.
#[derive(Debug)]
pub struct Predictor {
    cmds: [UserCmd; CMD_BACKUP],
    predicted_origins: [[i16; 3]; CMD_BACKUP],
    /// Number of the newest stored command.
    latest_cmd: u32,
    /// Predicted state after the newest stored command.
    predicted: MoveState,
    metrics: PredictionMetrics,
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new()
    }
}

impl Predictor {
    /// Empty predictor; call [`Predictor::reset`] on connect with the
    /// server's spawn state.
    pub fn new() -> Self {
        Self {
            cmds: [UserCmd::default(); CMD_BACKUP],
            predicted_origins: [[0; 3]; CMD_BACKUP],
            latest_cmd: 0,
            predicted: MoveState::default(),
            metrics: PredictionMetrics::default(),
        }
    }

    /// Forget all commands and adopt `state` as current (connect, respawn,
    /// level change).
    pub fn reset(&mut self, state: MoveState) {
        self.cmds = [UserCmd::default(); CMD_BACKUP];
        self.predicted_origins = [[0; 3]; CMD_BACKUP];
        self.latest_cmd = 0;
        self.predicted = state;
    }

    /// State after the most recent prediction step.
    pub fn predicted(&self) -> &MoveState {
        &self.predicted
    }

    /// Accuracy counters.
    pub fn metrics(&self) -> &PredictionMetrics {
        &self.metrics
    }

    /// Stored command by number; numbers older than the ring depth have
    /// been recycled and return whatever replaced them.
    pub fn cmd(&self, number: u32) -> &UserCmd {
        &self.cmds[number as usize & CMD_MASK]
    }

    /// Record command `number` and advance the local prediction by it.
    ///
    /// The command number is the channel's outgoing sequence, so the ack
    /// stream doubles as command acknowledgment.
    pub fn record_cmd(&mut self, number: u32, cmd: UserCmd) {
        self.cmds[number as usize & CMD_MASK] = cmd;
        self.latest_cmd = number;
        self.predicted = player_move(&self.predicted, &cmd);
        self.predicted_origins[number as usize & CMD_MASK] = self.predicted.origin;
        self.metrics.predicted += 1;
    }

    /// Reconcile against the authoritative state the server produced after
    /// running command `acked_cmd`.
    pub fn reconcile(
        &mut self,
        acked_cmd: u32,
        authoritative: &MoveState,
        epsilon_units: f32,
    ) -> Reconciliation {
        if acked_cmd == 0 || acked_cmd > self.latest_cmd {
            return Reconciliation::NotPredicted;
        }
        if self.latest_cmd - acked_cmd >= CMD_BACKUP as u32 {
            // The prediction for that command was recycled long ago; all we
            // can do is adopt the server state wholesale.
            self.replay_from(acked_cmd, authoritative);
            self.metrics.corrections += 1;
            return Reconciliation::Corrected { error_distance: 0.0 };
        }

        let predicted = self.predicted_origins[acked_cmd as usize & CMD_MASK];
        let delta = [
            (predicted[0] - authoritative.origin[0]) as f32 * 0.125,
            (predicted[1] - authoritative.origin[1]) as f32 * 0.125,
            (predicted[2] - authoritative.origin[2]) as f32 * 0.125,
        ];
        let distance =
            (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();

        if distance > self.metrics.max_error {
            self.metrics.max_error = distance;
        }

        // Discrete condition bits disagreeing is a miss regardless of how
        // close the origins are.
        let flags_match = {
            let mirror = self.predicted_flags_for(acked_cmd, authoritative);
            mirror == authoritative.flags
        };

        if distance <= epsilon_units && flags_match {
            return Reconciliation::InSync { error: delta };
        }

        debug!(acked_cmd, distance, "prediction miss, replaying");
        self.metrics.corrections += 1;
        self.replay_from(acked_cmd, authoritative);
        Reconciliation::Corrected {
            error_distance: distance,
        }
    }

    /// Flags the predictor had recorded for `acked_cmd`; since only origins
    /// are archived per command, the current predicted flags stand in when
    /// the acked command is the newest one.
    fn predicted_flags_for(
        &self,
        acked_cmd: u32,
        authoritative: &MoveState,
    ) -> arclight_core::pmove::MoveFlags {
        if acked_cmd == self.latest_cmd {
            self.predicted.flags
        } else {
            // Mid-stream flags were transient; treat them as agreeing so
            // only origin divergence triggers mid-stream corrections.
            authoritative.flags
        }
    }

    /// Snap to `authoritative` and re-run every command newer than
    /// `acked_cmd`, refreshing the archived origins as it goes.
    fn replay_from(&mut self, acked_cmd: u32, authoritative: &MoveState) {
        let mut state = *authoritative;
        let first = acked_cmd + 1;
        let newest = self.latest_cmd;
        if newest >= first {
            let span = (newest - first + 1).min(CMD_BACKUP as u32);
            for number in (newest + 1 - span)..=newest {
                let cmd = self.cmds[number as usize & CMD_MASK];
                state = player_move(&state, &cmd);
                self.predicted_origins[number as usize & CMD_MASK] = state.origin;
            }
        }
        self.predicted = state;
    }
}
