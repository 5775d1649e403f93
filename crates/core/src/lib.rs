#![warn(missing_docs)]
//! Core simulation primitives shared by the client and server.
//!
//! Everything here is plain data plus the deterministic player-movement
//! simulator. Both sides of the wire run the exact same code, which is what
//! makes client-side prediction reconcilable against authoritative state.

pub mod pmove;

use bitflags::bitflags;

pub use pmove::{player_move, MoveKind, MoveState};

/// Highest entity number plus one; entity numbers index fixed-size tables.
pub const MAX_ENTITIES: usize = 1024;

/// Entity number 0 is the world and never appears in replication traffic.
pub const ENTITY_WORLD: u16 = 0;

/// Three-component world vector.
pub type Vec3 = [f32; 3];

/// Index into [`Vec3`] / angle triples.
pub const PITCH: usize = 0;
/// Yaw component index.
pub const YAW: usize = 1;
/// Roll component index.
pub const ROLL: usize = 2;

/// Convert a wire angle (1/65536th of a turn) to degrees.
pub fn short_to_angle(value: i16) -> f32 {
    value as f32 * (360.0 / 65536.0)
}

/// Convert degrees to a wire angle (1/65536th of a turn).
pub fn angle_to_short(degrees: f32) -> i16 {
    ((degrees * (65536.0 / 360.0)) as i32 & 0xffff) as u16 as i16
}

bitflags! {
    /// Visual effect bits carried on every replicated entity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EffectFlags: u32 {
        /// Item-style constant rotation.
        const ROTATE = 1 << 0;
        /// Pulsing glow shell.
        const PULSE = 1 << 1;
        /// Smoke trail behind the entity.
        const TRAIL_SMOKE = 1 << 2;
        /// Energy bolt trail.
        const TRAIL_ENERGY = 1 << 3;
        /// One-shot teleport flash.
        const TELEPORT = 1 << 4;
        /// Corpse / gib treatment.
        const GIB = 1 << 5;
    }
}

bitflags! {
    /// Button bits sampled into every [`UserCmd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ButtonFlags: u8 {
        /// Primary fire.
        const ATTACK = 1 << 0;
        /// Use / interact.
        const USE = 1 << 1;
        /// Set when any button at all was down during the sample window,
        /// so the server can detect activity without decoding intent.
        const ANY = 1 << 7;
    }
}

/// Transient per-frame entity event codes (muzzle flash, footstep, ...).
///
/// Events are not state: they fire on the frame they are set and the server
/// clears them after each broadcast.
pub mod entity_event {
    /// No event this frame.
    pub const NONE: u8 = 0;
    /// Item respawned at this entity.
    pub const ITEM_RESPAWN: u8 = 1;
    /// Entity teleported; effects should not interpolate across the jump.
    pub const TELEPORT: u8 = 2;
    /// Footstep at the entity origin.
    pub const FOOTSTEP: u8 = 3;
    /// Hard landing.
    pub const FALL: u8 = 4;
}

/// Replicated state of one networked object.
///
/// Entities never reference each other by pointer: `owner` is an entity
/// number indexing the same fixed table this state lives in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    /// Entity number, unique within a server frame (`1..MAX_ENTITIES`).
    pub number: u16,
    /// World position.
    pub origin: Vec3,
    /// Orientation in degrees (pitch, yaw, roll).
    pub angles: Vec3,
    /// Position on the previous server frame, used by the renderer to lerp
    /// and as the beam start point.
    pub old_origin: Vec3,
    /// Index into the model configuration strings.
    pub model_index: u8,
    /// Animation frame.
    pub frame: u16,
    /// Index into the skin table.
    pub skin: u8,
    /// Effect bits.
    pub effects: EffectFlags,
    /// Looping sound index, 0 for silent.
    pub sound: u8,
    /// Transient event code, see [`entity_event`].
    pub event: u8,
    /// Encoded collision extents, consumed by the (external) collision layer.
    pub solid: u16,
    /// Owning entity number, 0 for none.
    pub owner: u16,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            number: ENTITY_WORLD,
            origin: [0.0; 3],
            angles: [0.0; 3],
            old_origin: [0.0; 3],
            model_index: 0,
            frame: 0,
            skin: 0,
            effects: EffectFlags::empty(),
            sound: 0,
            event: entity_event::NONE,
            solid: 0,
            owner: ENTITY_WORLD,
        }
    }
}

/// One quantum of player input, sent to the server for authoritative
/// simulation and replayed locally for prediction.
///
/// Angles are stored in wire units (1/65536th of a turn) so that a command
/// replayed from the ring buffer is bit-identical to the one the server ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserCmd {
    /// Duration this command covers, in milliseconds.
    pub msec: u8,
    /// Button bits.
    pub buttons: ButtonFlags,
    /// View angles in wire units (pitch, yaw, roll).
    pub angles: [i16; 3],
    /// Forward speed request, units/second.
    pub forward_move: i16,
    /// Sideways speed request, units/second.
    pub side_move: i16,
    /// Vertical speed request (jump / crouch), units/second.
    pub up_move: i16,
    /// One-shot impulse (weapon switch etc.), 0 for none.
    pub impulse: u8,
}

/// Replicated per-player state: the movement core plus view fields.
///
/// Everything is stored in wire precision so delta comparison and
/// prediction replay are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerState {
    /// Movement simulator state.
    pub move_state: MoveState,
    /// Server-forced view angles in wire units, normally zero.
    pub view_angles: [i16; 3],
    /// Eye height above the origin, in 1/8 units.
    pub view_height: i8,
    /// Field of view in degrees.
    pub fov: u8,
    /// Index of the rendered weapon model.
    pub weapon_model: u8,
}
