//! Deterministic player-movement simulator.
//!
//! The server runs this over each received [`UserCmd`] to produce
//! authoritative state; the client runs the identical code over its
//! unacknowledged commands to predict ahead of the server. Positions and
//! velocities are held in 1/8-unit fixed point and re-quantized after every
//! step, so replaying the same commands from the same start always lands on
//! the same state, bit for bit.
//!
//! Collision against world geometry is an external collaborator; the
//! simulator models an infinite floor at height zero, which is all the
//! protocol core needs to exercise prediction and reconciliation.

use bitflags::bitflags;

use crate::{short_to_angle, UserCmd, YAW};

/// Ground friction coefficient.
const FRICTION: f32 = 6.0;
/// Ground acceleration coefficient.
const ACCELERATE: f32 = 10.0;
/// Air acceleration coefficient.
const AIR_ACCELERATE: f32 = 1.0;
/// Hard cap on horizontal wish speed, units/second.
const MAX_SPEED: f32 = 300.0;
/// Speed below which friction drags to a dead stop.
const STOP_SPEED: f32 = 100.0;
/// Instant vertical velocity applied by a jump, units/second.
const JUMP_VELOCITY: f32 = 270.0;

/// Movement behavior selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MoveKind {
    /// Walking/falling player under full physics.
    #[default]
    Normal = 0,
    /// No acceleration from input; gravity still applies (death, stun).
    Dead = 1,
    /// No movement at all (intermission, match freeze).
    Frozen = 2,
}

impl MoveKind {
    /// Decode a wire byte, defaulting to [`MoveKind::Frozen`] for unknown
    /// values so a corrupt field can never animate a player.
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => MoveKind::Normal,
            1 => MoveKind::Dead,
            _ => MoveKind::Frozen,
        }
    }
}

bitflags! {
    /// Movement condition bits, compared exactly during reconciliation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveFlags: u8 {
        /// Standing on the floor.
        const ON_GROUND = 1 << 0;
        /// Jump key has not been released since the last jump.
        const JUMP_HELD = 1 << 1;
    }
}

/// Movement simulator state, in wire precision.
///
/// `origin` and `velocity` are 1/8-unit fixed point; `delta_angles` are
/// wire angles added to the client's view angles so the server can spin a
/// player (spawn orientation, teleporters) without fighting prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveState {
    /// Behavior selector.
    pub kind: MoveKind,
    /// Position, 1/8-unit fixed point.
    pub origin: [i16; 3],
    /// Velocity, 1/8 units/second fixed point.
    pub velocity: [i16; 3],
    /// Condition bits.
    pub flags: MoveFlags,
    /// Downward acceleration, units/second^2.
    pub gravity: i16,
    /// Server-imposed view angle offset, wire units.
    pub delta_angles: [i16; 3],
}

impl MoveState {
    /// Spawn state: standing on the floor with default gravity.
    pub fn spawn() -> Self {
        Self {
            gravity: 800,
            flags: MoveFlags::ON_GROUND,
            ..Self::default()
        }
    }

    /// Position in world units.
    pub fn origin_units(&self) -> [f32; 3] {
        [
            self.origin[0] as f32 * 0.125,
            self.origin[1] as f32 * 0.125,
            self.origin[2] as f32 * 0.125,
        ]
    }
}

fn quantize(value: f32) -> i16 {
    (value * 8.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Advance `state` by one command and return the resulting state.
pub fn player_move(state: &MoveState, cmd: &UserCmd) -> MoveState {
    let mut next = *state;
    if state.kind == MoveKind::Frozen || cmd.msec == 0 {
        return next;
    }

    let dt = cmd.msec as f32 / 1000.0;
    let mut origin = [
        state.origin[0] as f32 * 0.125,
        state.origin[1] as f32 * 0.125,
        state.origin[2] as f32 * 0.125,
    ];
    let mut velocity = [
        state.velocity[0] as f32 * 0.125,
        state.velocity[1] as f32 * 0.125,
        state.velocity[2] as f32 * 0.125,
    ];

    let on_ground = state.flags.contains(MoveFlags::ON_GROUND);

    if state.kind == MoveKind::Normal {
        // Wish direction from the command yaw, flattened to the floor plane.
        let yaw = short_to_angle(cmd.angles[YAW].wrapping_add(state.delta_angles[YAW]))
            .to_radians();
        let forward = [yaw.cos(), yaw.sin()];
        let right = [yaw.sin(), -yaw.cos()];
        let mut wish = [
            forward[0] * cmd.forward_move as f32 + right[0] * cmd.side_move as f32,
            forward[1] * cmd.forward_move as f32 + right[1] * cmd.side_move as f32,
        ];
        let mut wish_speed = (wish[0] * wish[0] + wish[1] * wish[1]).sqrt();
        if wish_speed > 0.0 {
            wish[0] /= wish_speed;
            wish[1] /= wish_speed;
        }
        if wish_speed > MAX_SPEED {
            wish_speed = MAX_SPEED;
        }

        if on_ground {
            apply_friction(&mut velocity, dt);
            accelerate(&mut velocity, &wish, wish_speed, ACCELERATE, dt);

            if cmd.up_move > 0 {
                if !state.flags.contains(MoveFlags::JUMP_HELD) {
                    velocity[2] = JUMP_VELOCITY;
                    next.flags.remove(MoveFlags::ON_GROUND);
                }
                next.flags.insert(MoveFlags::JUMP_HELD);
            } else {
                next.flags.remove(MoveFlags::JUMP_HELD);
            }
        } else {
            accelerate(&mut velocity, &wish, wish_speed, AIR_ACCELERATE, dt);
        }
    }

    if !next.flags.contains(MoveFlags::ON_GROUND) {
        velocity[2] -= state.gravity as f32 * dt;
    }

    origin[0] += velocity[0] * dt;
    origin[1] += velocity[1] * dt;
    origin[2] += velocity[2] * dt;

    // Floor contact; real collision geometry lives outside this core.
    if origin[2] <= 0.0 && velocity[2] <= 0.0 {
        origin[2] = 0.0;
        velocity[2] = 0.0;
        next.flags.insert(MoveFlags::ON_GROUND);
    } else if velocity[2] > 0.0 {
        next.flags.remove(MoveFlags::ON_GROUND);
    }

    next.origin = [quantize(origin[0]), quantize(origin[1]), quantize(origin[2])];
    next.velocity = [
        quantize(velocity[0]),
        quantize(velocity[1]),
        quantize(velocity[2]),
    ];
    next
}

fn apply_friction(velocity: &mut [f32; 3], dt: f32) {
    let speed = (velocity[0] * velocity[0] + velocity[1] * velocity[1]).sqrt();
    if speed < 1.0 {
        velocity[0] = 0.0;
        velocity[1] = 0.0;
        return;
    }
    let control = speed.max(STOP_SPEED);
    let drop = control * FRICTION * dt;
    let scale = ((speed - drop).max(0.0)) / speed;
    velocity[0] *= scale;
    velocity[1] *= scale;
}

fn accelerate(velocity: &mut [f32; 3], wish: &[f32; 2], wish_speed: f32, accel: f32, dt: f32) {
    let current = velocity[0] * wish[0] + velocity[1] * wish[1];
    let add = wish_speed - current;
    if add <= 0.0 {
        return;
    }
    let speed = (accel * dt * wish_speed).min(add);
    velocity[0] += speed * wish[0];
    velocity[1] += speed * wish[1];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angle_to_short;

    fn run_cmd(forward: i16) -> UserCmd {
        UserCmd {
            msec: 50,
            forward_move: forward,
            ..UserCmd::default()
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let cmds: Vec<UserCmd> = (0..40)
            .map(|i| UserCmd {
                msec: 16,
                forward_move: 200,
                side_move: if i % 3 == 0 { -100 } else { 50 },
                up_move: if i == 10 { 300 } else { 0 },
                angles: [0, angle_to_short(i as f32 * 7.0), 0],
                ..UserCmd::default()
            })
            .collect();

        let mut a = MoveState::spawn();
        let mut b = MoveState::spawn();
        for cmd in &cmds {
            a = player_move(&a, cmd);
        }
        for cmd in &cmds {
            b = player_move(&b, cmd);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn forward_input_moves_along_yaw() {
        let mut state = MoveState::spawn();
        for _ in 0..20 {
            state = player_move(&state, &run_cmd(300));
        }
        assert!(state.origin[0] > 0, "expected +x movement, got {:?}", state.origin);
        assert_eq!(state.origin[2], 0);
        assert!(state.flags.contains(MoveFlags::ON_GROUND));
    }

    #[test]
    fn friction_stops_a_coasting_player() {
        let mut state = MoveState::spawn();
        for _ in 0..10 {
            state = player_move(&state, &run_cmd(300));
        }
        for _ in 0..60 {
            state = player_move(&state, &run_cmd(0));
        }
        assert_eq!(state.velocity, [0, 0, 0]);
    }

    #[test]
    fn jump_leaves_ground_and_lands() {
        let mut state = MoveState::spawn();
        let jump = UserCmd {
            msec: 16,
            up_move: 300,
            ..UserCmd::default()
        };
        state = player_move(&state, &jump);
        assert!(!state.flags.contains(MoveFlags::ON_GROUND));
        assert!(state.velocity[2] > 0);

        // Holding jump must not re-trigger at the apex.
        let held = state.flags.contains(MoveFlags::JUMP_HELD);
        assert!(held);

        for _ in 0..200 {
            state = player_move(&state, &run_cmd(0));
            if state.flags.contains(MoveFlags::ON_GROUND) {
                break;
            }
        }
        assert!(state.flags.contains(MoveFlags::ON_GROUND));
        assert_eq!(state.origin[2], 0);
    }

    #[test]
    fn frozen_player_ignores_input() {
        let mut state = MoveState::spawn();
        state.kind = MoveKind::Frozen;
        let after = player_move(&state, &run_cmd(300));
        assert_eq!(state, after);
    }

    #[test]
    fn dead_player_falls_but_does_not_steer() {
        let mut state = MoveState::spawn();
        state.kind = MoveKind::Dead;
        state.origin[2] = 8 * 100; // 100 units up
        state.flags.remove(MoveFlags::ON_GROUND);
        let after = player_move(&state, &run_cmd(300));
        assert_eq!(after.velocity[0], 0);
        assert!(after.velocity[2] < 0);
    }
}
