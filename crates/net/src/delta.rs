//! Field-level delta encoding for entities, user commands, and player state.
//!
//! Each record is transmitted as a bitmask naming the fields that follow,
//! then only those fields. The decoder merges onto a caller-supplied `from`
//! state, so an empty mask reproduces `from` exactly and
//! `apply(a, diff(a, b))` reproduces `b` field for field.

use arclight_core::{EffectFlags, EntityState, MoveKind, PlayerState, UserCmd, PITCH, ROLL, YAW};
use bitflags::bitflags;

use crate::error::ProtocolError;
use crate::msg::MessageBuffer;

bitflags! {
    /// Entity delta field mask, serialized as one to three bytes with two
    /// continuation bits. `REMOVE` lives in the first byte so a removal
    /// header is always a single byte plus the entity number.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityBits: u32 {
        /// `origin[0]` follows.
        const ORIGIN_X = 1 << 0;
        /// `origin[1]` follows.
        const ORIGIN_Y = 1 << 1;
        /// `origin[2]` follows.
        const ORIGIN_Z = 1 << 2;
        /// `angles[YAW]` follows.
        const ANGLE_YAW = 1 << 3;
        /// `frame` follows.
        const FRAME = 1 << 4;
        /// `event` follows.
        const EVENT = 1 << 5;
        /// Entity left the frame; no fields follow.
        const REMOVE = 1 << 6;
        /// Second mask byte present.
        const MORE_A = 1 << 7;

        /// Entity number is 16-bit instead of 8-bit.
        const NUMBER16 = 1 << 8;
        /// `angles[PITCH]` follows.
        const ANGLE_PITCH = 1 << 9;
        /// `angles[ROLL]` follows.
        const ANGLE_ROLL = 1 << 10;
        /// `model_index` follows.
        const MODEL = 1 << 11;
        /// `skin` follows.
        const SKIN = 1 << 12;
        /// `effects` follows.
        const EFFECTS = 1 << 13;
        /// `sound` follows.
        const SOUND = 1 << 14;
        /// Third mask byte present.
        const MORE_B = 1 << 15;

        /// `solid` follows.
        const SOLID = 1 << 16;
        /// `old_origin` follows (always set on freshly spawned entities so
        /// the renderer never lerps from a stale position).
        const OLD_ORIGIN = 1 << 17;
        /// `owner` follows.
        const OWNER = 1 << 18;
    }
}

bitflags! {
    /// User-command delta field mask; `msec` and `buttons`' activity bit
    /// travel outside the mask on every command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdBits: u8 {
        /// `angles[PITCH]` follows.
        const ANGLE_PITCH = 1 << 0;
        /// `angles[YAW]` follows.
        const ANGLE_YAW = 1 << 1;
        /// `angles[ROLL]` follows.
        const ANGLE_ROLL = 1 << 2;
        /// `forward_move` follows.
        const FORWARD = 1 << 3;
        /// `side_move` follows.
        const SIDE = 1 << 4;
        /// `up_move` follows.
        const UP = 1 << 5;
        /// `buttons` follows.
        const BUTTONS = 1 << 6;
        /// `impulse` follows.
        const IMPULSE = 1 << 7;
    }
}

bitflags! {
    /// Player-state delta field mask, serialized as a 16-bit little-endian
    /// word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlayerBits: u16 {
        /// `move_state.kind` follows.
        const MOVE_KIND = 1 << 0;
        /// `move_state.origin` follows.
        const ORIGIN = 1 << 1;
        /// `move_state.velocity` follows.
        const VELOCITY = 1 << 2;
        /// `move_state.flags` follows.
        const MOVE_FLAGS = 1 << 3;
        /// `move_state.gravity` follows.
        const GRAVITY = 1 << 4;
        /// `move_state.delta_angles` follows.
        const DELTA_ANGLES = 1 << 5;
        /// `view_angles` follows.
        const VIEW_ANGLES = 1 << 6;
        /// `view_height` follows.
        const VIEW_HEIGHT = 1 << 7;
        /// `fov` follows.
        const FOV = 1 << 8;
        /// `weapon_model` follows.
        const WEAPON = 1 << 9;
    }
}

/// Compute the field mask for an entity transition.
fn entity_diff_bits(from: &EntityState, to: &EntityState, new_entity: bool) -> EntityBits {
    let mut bits = EntityBits::empty();

    if to.origin[0] != from.origin[0] {
        bits |= EntityBits::ORIGIN_X;
    }
    if to.origin[1] != from.origin[1] {
        bits |= EntityBits::ORIGIN_Y;
    }
    if to.origin[2] != from.origin[2] {
        bits |= EntityBits::ORIGIN_Z;
    }
    if to.angles[YAW] != from.angles[YAW] {
        bits |= EntityBits::ANGLE_YAW;
    }
    if to.angles[PITCH] != from.angles[PITCH] {
        bits |= EntityBits::ANGLE_PITCH;
    }
    if to.angles[ROLL] != from.angles[ROLL] {
        bits |= EntityBits::ANGLE_ROLL;
    }
    if to.frame != from.frame {
        bits |= EntityBits::FRAME;
    }
    if to.model_index != from.model_index {
        bits |= EntityBits::MODEL;
    }
    if to.skin != from.skin {
        bits |= EntityBits::SKIN;
    }
    if to.effects != from.effects {
        bits |= EntityBits::EFFECTS;
    }
    if to.sound != from.sound {
        bits |= EntityBits::SOUND;
    }
    if to.solid != from.solid {
        bits |= EntityBits::SOLID;
    }
    if to.owner != from.owner {
        bits |= EntityBits::OWNER;
    }
    // Events are transient: transmitted whenever set, never compared.
    if to.event != 0 {
        bits |= EntityBits::EVENT;
    }
    if new_entity {
        bits |= EntityBits::OLD_ORIGIN;
    }
    bits
}

/// Write the mask bytes and entity number that start every entity update.
pub fn write_entity_header(msg: &mut MessageBuffer, mut bits: EntityBits, number: u16) {
    if number >= 256 {
        bits |= EntityBits::NUMBER16;
    }

    let raw = bits.bits();
    if raw & 0x00ff_0000 != 0 {
        bits |= EntityBits::MORE_A | EntityBits::MORE_B;
    } else if raw & 0x0000_ff00 != 0 {
        bits |= EntityBits::MORE_A;
    }
    let raw = bits.bits();

    msg.write_u8((raw & 0xff) as i32);
    if bits.contains(EntityBits::MORE_A) {
        msg.write_u8(((raw >> 8) & 0xff) as i32);
    }
    if bits.contains(EntityBits::MORE_B) {
        msg.write_u8(((raw >> 16) & 0xff) as i32);
    }

    if bits.contains(EntityBits::NUMBER16) {
        msg.write_i16(number as i32);
    } else {
        msg.write_u8(number as i32);
    }
}

/// Read an entity update header. Returns the entity number and field mask;
/// number 0 with an empty mask is the list terminator.
pub fn read_entity_header(msg: &mut MessageBuffer) -> Result<(u16, EntityBits), ProtocolError> {
    let mut raw = match msg.read_u8() {
        -1 => return Err(ProtocolError::UnexpectedEnd),
        byte => byte as u32,
    };
    if raw & EntityBits::MORE_A.bits() != 0 {
        raw |= (msg.read_u8().max(0) as u32) << 8;
    }
    if raw & EntityBits::MORE_B.bits() != 0 {
        raw |= (msg.read_u8().max(0) as u32) << 16;
    }
    let bits = EntityBits::from_bits_truncate(raw);

    let number = if bits.contains(EntityBits::NUMBER16) {
        msg.read_i16() as u16
    } else {
        msg.read_u8().max(0) as u16
    };
    if msg.overflowed() {
        return Err(ProtocolError::UnexpectedEnd);
    }
    Ok((number, bits))
}

/// Write the delta from `from` to `to`.
///
/// Nothing is emitted when the states are identical unless `force` is set
/// (baseline spawns and uncompressed frames always force). `new_entity`
/// additionally transmits `old_origin` so a recycled entity number never
/// inherits the previous occupant's interpolation origin.
pub fn write_delta_entity(
    msg: &mut MessageBuffer,
    from: &EntityState,
    to: &EntityState,
    force: bool,
    new_entity: bool,
) {
    debug_assert!(to.number != 0, "entity number unset");

    let bits = entity_diff_bits(from, to, new_entity);
    if bits.is_empty() && !force {
        return;
    }

    write_entity_header(msg, bits, to.number);

    if bits.contains(EntityBits::MODEL) {
        msg.write_u8(to.model_index as i32);
    }
    if bits.contains(EntityBits::FRAME) {
        msg.write_i16(to.frame as i32);
    }
    if bits.contains(EntityBits::SKIN) {
        msg.write_u8(to.skin as i32);
    }
    if bits.contains(EntityBits::EFFECTS) {
        msg.write_i32(to.effects.bits() as i32);
    }
    if bits.contains(EntityBits::ORIGIN_X) {
        msg.write_coord(to.origin[0]);
    }
    if bits.contains(EntityBits::ORIGIN_Y) {
        msg.write_coord(to.origin[1]);
    }
    if bits.contains(EntityBits::ORIGIN_Z) {
        msg.write_coord(to.origin[2]);
    }
    if bits.contains(EntityBits::ANGLE_PITCH) {
        msg.write_angle(to.angles[PITCH]);
    }
    if bits.contains(EntityBits::ANGLE_YAW) {
        msg.write_angle(to.angles[YAW]);
    }
    if bits.contains(EntityBits::ANGLE_ROLL) {
        msg.write_angle(to.angles[ROLL]);
    }
    if bits.contains(EntityBits::OLD_ORIGIN) {
        msg.write_pos(&to.old_origin);
    }
    if bits.contains(EntityBits::SOUND) {
        msg.write_u8(to.sound as i32);
    }
    if bits.contains(EntityBits::EVENT) {
        msg.write_u8(to.event as i32);
    }
    if bits.contains(EntityBits::SOLID) {
        msg.write_i16(to.solid as i32);
    }
    if bits.contains(EntityBits::OWNER) {
        msg.write_i16(to.owner as i32);
    }
}

/// Merge an entity delta onto `from`, producing the updated state.
///
/// Fields without a mask bit keep their `from` value; `event` resets to
/// zero unless transmitted, because events are strictly per-frame.
pub fn read_delta_entity(
    msg: &mut MessageBuffer,
    from: &EntityState,
    number: u16,
    bits: EntityBits,
) -> Result<EntityState, ProtocolError> {
    let mut to = *from;
    to.number = number;
    to.event = 0;

    if bits.contains(EntityBits::MODEL) {
        to.model_index = msg.read_u8() as u8;
    }
    if bits.contains(EntityBits::FRAME) {
        to.frame = msg.read_i16() as u16;
    }
    if bits.contains(EntityBits::SKIN) {
        to.skin = msg.read_u8() as u8;
    }
    if bits.contains(EntityBits::EFFECTS) {
        to.effects = EffectFlags::from_bits_truncate(msg.read_i32() as u32);
    }
    if bits.contains(EntityBits::ORIGIN_X) {
        to.origin[0] = msg.read_coord();
    }
    if bits.contains(EntityBits::ORIGIN_Y) {
        to.origin[1] = msg.read_coord();
    }
    if bits.contains(EntityBits::ORIGIN_Z) {
        to.origin[2] = msg.read_coord();
    }
    if bits.contains(EntityBits::ANGLE_PITCH) {
        to.angles[PITCH] = msg.read_angle();
    }
    if bits.contains(EntityBits::ANGLE_YAW) {
        to.angles[YAW] = msg.read_angle();
    }
    if bits.contains(EntityBits::ANGLE_ROLL) {
        to.angles[ROLL] = msg.read_angle();
    }
    if bits.contains(EntityBits::OLD_ORIGIN) {
        to.old_origin = msg.read_pos();
    }
    if bits.contains(EntityBits::SOUND) {
        to.sound = msg.read_u8() as u8;
    }
    if bits.contains(EntityBits::EVENT) {
        to.event = msg.read_u8() as u8;
    }
    if bits.contains(EntityBits::SOLID) {
        to.solid = msg.read_i16() as u16;
    }
    if bits.contains(EntityBits::OWNER) {
        to.owner = msg.read_i16() as u16;
    }

    if msg.overflowed() {
        return Err(ProtocolError::UnexpectedEnd);
    }
    Ok(to)
}

/// Write a user command as a delta against the previous one in the batch.
pub fn write_delta_cmd(msg: &mut MessageBuffer, from: &UserCmd, to: &UserCmd) {
    let mut bits = CmdBits::empty();
    if to.angles[PITCH] != from.angles[PITCH] {
        bits |= CmdBits::ANGLE_PITCH;
    }
    if to.angles[YAW] != from.angles[YAW] {
        bits |= CmdBits::ANGLE_YAW;
    }
    if to.angles[ROLL] != from.angles[ROLL] {
        bits |= CmdBits::ANGLE_ROLL;
    }
    if to.forward_move != from.forward_move {
        bits |= CmdBits::FORWARD;
    }
    if to.side_move != from.side_move {
        bits |= CmdBits::SIDE;
    }
    if to.up_move != from.up_move {
        bits |= CmdBits::UP;
    }
    if to.buttons != from.buttons {
        bits |= CmdBits::BUTTONS;
    }
    if to.impulse != from.impulse {
        bits |= CmdBits::IMPULSE;
    }

    msg.write_u8(bits.bits() as i32);

    if bits.contains(CmdBits::ANGLE_PITCH) {
        msg.write_i16(to.angles[PITCH] as i32);
    }
    if bits.contains(CmdBits::ANGLE_YAW) {
        msg.write_i16(to.angles[YAW] as i32);
    }
    if bits.contains(CmdBits::ANGLE_ROLL) {
        msg.write_i16(to.angles[ROLL] as i32);
    }
    if bits.contains(CmdBits::FORWARD) {
        msg.write_i16(to.forward_move as i32);
    }
    if bits.contains(CmdBits::SIDE) {
        msg.write_i16(to.side_move as i32);
    }
    if bits.contains(CmdBits::UP) {
        msg.write_i16(to.up_move as i32);
    }
    if bits.contains(CmdBits::BUTTONS) {
        msg.write_u8(to.buttons.bits() as i32);
    }
    if bits.contains(CmdBits::IMPULSE) {
        msg.write_u8(to.impulse as i32);
    }

    msg.write_u8(to.msec as i32);
}

/// Read a user command delta against `from`.
pub fn read_delta_cmd(msg: &mut MessageBuffer, from: &UserCmd) -> UserCmd {
    let mut cmd = *from;
    let bits = CmdBits::from_bits_truncate(msg.read_u8().max(0) as u8);

    if bits.contains(CmdBits::ANGLE_PITCH) {
        cmd.angles[PITCH] = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::ANGLE_YAW) {
        cmd.angles[YAW] = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::ANGLE_ROLL) {
        cmd.angles[ROLL] = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::FORWARD) {
        cmd.forward_move = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::SIDE) {
        cmd.side_move = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::UP) {
        cmd.up_move = msg.read_i16() as i16;
    }
    if bits.contains(CmdBits::BUTTONS) {
        cmd.buttons = arclight_core::ButtonFlags::from_bits_truncate(msg.read_u8() as u8);
    }
    if bits.contains(CmdBits::IMPULSE) {
        cmd.impulse = msg.read_u8() as u8;
    }

    cmd.msec = msg.read_u8().max(0) as u8;
    cmd
}

/// Write a player-state delta.
pub fn write_delta_player(msg: &mut MessageBuffer, from: &PlayerState, to: &PlayerState) {
    let mut bits = PlayerBits::empty();
    if to.move_state.kind != from.move_state.kind {
        bits |= PlayerBits::MOVE_KIND;
    }
    if to.move_state.origin != from.move_state.origin {
        bits |= PlayerBits::ORIGIN;
    }
    if to.move_state.velocity != from.move_state.velocity {
        bits |= PlayerBits::VELOCITY;
    }
    if to.move_state.flags != from.move_state.flags {
        bits |= PlayerBits::MOVE_FLAGS;
    }
    if to.move_state.gravity != from.move_state.gravity {
        bits |= PlayerBits::GRAVITY;
    }
    if to.move_state.delta_angles != from.move_state.delta_angles {
        bits |= PlayerBits::DELTA_ANGLES;
    }
    if to.view_angles != from.view_angles {
        bits |= PlayerBits::VIEW_ANGLES;
    }
    if to.view_height != from.view_height {
        bits |= PlayerBits::VIEW_HEIGHT;
    }
    if to.fov != from.fov {
        bits |= PlayerBits::FOV;
    }
    if to.weapon_model != from.weapon_model {
        bits |= PlayerBits::WEAPON;
    }

    msg.write_i16(bits.bits() as i32);

    if bits.contains(PlayerBits::MOVE_KIND) {
        msg.write_u8(to.move_state.kind as u8 as i32);
    }
    if bits.contains(PlayerBits::ORIGIN) {
        for c in to.move_state.origin {
            msg.write_i16(c as i32);
        }
    }
    if bits.contains(PlayerBits::VELOCITY) {
        for c in to.move_state.velocity {
            msg.write_i16(c as i32);
        }
    }
    if bits.contains(PlayerBits::MOVE_FLAGS) {
        msg.write_u8(to.move_state.flags.bits() as i32);
    }
    if bits.contains(PlayerBits::GRAVITY) {
        msg.write_i16(to.move_state.gravity as i32);
    }
    if bits.contains(PlayerBits::DELTA_ANGLES) {
        for c in to.move_state.delta_angles {
            msg.write_i16(c as i32);
        }
    }
    if bits.contains(PlayerBits::VIEW_ANGLES) {
        for c in to.view_angles {
            msg.write_i16(c as i32);
        }
    }
    if bits.contains(PlayerBits::VIEW_HEIGHT) {
        msg.write_i8(to.view_height as i32);
    }
    if bits.contains(PlayerBits::FOV) {
        msg.write_u8(to.fov as i32);
    }
    if bits.contains(PlayerBits::WEAPON) {
        msg.write_u8(to.weapon_model as i32);
    }
}

/// Merge a player-state delta onto `from`.
pub fn read_delta_player(
    msg: &mut MessageBuffer,
    from: &PlayerState,
) -> Result<PlayerState, ProtocolError> {
    let mut to = *from;
    let bits = PlayerBits::from_bits_truncate(msg.read_i16() as u16);

    if bits.contains(PlayerBits::MOVE_KIND) {
        to.move_state.kind = MoveKind::from_wire(msg.read_u8() as u8);
    }
    if bits.contains(PlayerBits::ORIGIN) {
        for c in &mut to.move_state.origin {
            *c = msg.read_i16() as i16;
        }
    }
    if bits.contains(PlayerBits::VELOCITY) {
        for c in &mut to.move_state.velocity {
            *c = msg.read_i16() as i16;
        }
    }
    if bits.contains(PlayerBits::MOVE_FLAGS) {
        to.move_state.flags =
            arclight_core::pmove::MoveFlags::from_bits_truncate(msg.read_u8() as u8);
    }
    if bits.contains(PlayerBits::GRAVITY) {
        to.move_state.gravity = msg.read_i16() as i16;
    }
    if bits.contains(PlayerBits::DELTA_ANGLES) {
        for c in &mut to.move_state.delta_angles {
            *c = msg.read_i16() as i16;
        }
    }
    if bits.contains(PlayerBits::VIEW_ANGLES) {
        for c in &mut to.view_angles {
            *c = msg.read_i16() as i16;
        }
    }
    if bits.contains(PlayerBits::VIEW_HEIGHT) {
        to.view_height = msg.read_i8() as i8;
    }
    if bits.contains(PlayerBits::FOV) {
        to.fov = msg.read_u8() as u8;
    }
    if bits.contains(PlayerBits::WEAPON) {
        to.weapon_model = msg.read_u8() as u8;
    }

    if msg.overflowed() {
        return Err(ProtocolError::UnexpectedEnd);
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_core::{ButtonFlags, MoveState};

    fn sample_entity() -> EntityState {
        EntityState {
            number: 5,
            origin: [100.0, -48.5, 24.0],
            angles: [0.0, 90.0, 0.0],
            old_origin: [99.0, -48.5, 24.0],
            model_index: 3,
            frame: 12,
            skin: 1,
            effects: EffectFlags::ROTATE,
            sound: 0,
            event: 0,
            solid: 0x2244,
            owner: 0,
        }
    }

    /// Encode then decode a transition and return the merged result.
    fn round_trip(from: &EntityState, to: &EntityState, new_entity: bool) -> EntityState {
        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, from, to, true, new_entity);
        let (number, bits) = read_entity_header(&mut msg).unwrap();
        assert_eq!(number, to.number);
        read_delta_entity(&mut msg, from, number, bits).unwrap()
    }

    #[test]
    fn zero_diff_delta_is_identity() {
        let state = sample_entity();
        let back = round_trip(&state, &state, false);
        assert_eq!(back, state);
    }

    #[test]
    fn zero_diff_without_force_writes_nothing() {
        let state = sample_entity();
        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, &state, &state, false, false);
        assert!(msg.is_empty());
    }

    #[test]
    fn apply_diff_reproduces_target() {
        let from = sample_entity();
        let mut to = from;
        to.origin = [228.25, -48.5, 0.0];
        to.angles[YAW] = 180.0;
        to.model_index = 7;
        to.frame = 500;
        to.effects = EffectFlags::PULSE | EffectFlags::TRAIL_SMOKE;
        to.owner = 260;

        let back = round_trip(&from, &to, false);

        // Quantized fields land on their wire grid; everything else exact.
        assert_eq!(back.model_index, to.model_index);
        assert_eq!(back.frame, to.frame);
        assert_eq!(back.effects, to.effects);
        assert_eq!(back.owner, to.owner);
        for i in 0..3 {
            assert!((back.origin[i] - to.origin[i]).abs() <= 0.125);
        }
        assert!((back.angles[YAW] - to.angles[YAW]).abs() <= 360.0 / 256.0);
        // Untouched fields carried over from the base.
        assert_eq!(back.skin, from.skin);
        assert_eq!(back.solid, from.solid);
    }

    #[test]
    fn delta_from_quantized_base_is_stable() {
        // Once a state has been through the wire, re-encoding against the
        // decoded copy must produce an empty delta for unchanged fields.
        let from = EntityState::default();
        let mut to = sample_entity();
        to.event = 0;
        let decoded = round_trip(&from, &to, true);

        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, &decoded, &decoded, false, false);
        assert!(msg.is_empty());
    }

    #[test]
    fn new_entity_always_carries_old_origin() {
        let from = EntityState::default();
        let mut to = sample_entity();
        to.old_origin = [1.0, 2.0, 3.0];

        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, &from, &to, true, true);
        let (_, bits) = read_entity_header(&mut msg).unwrap();
        assert!(bits.contains(EntityBits::OLD_ORIGIN));
    }

    #[test]
    fn event_is_transient_not_sticky() {
        let mut from = sample_entity();
        from.event = arclight_core::entity_event::FOOTSTEP;
        let mut to = from;
        to.event = 0;

        // No fields differ besides the event clearing, so nothing is sent;
        // the decoder still must not carry the old event forward.
        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, &from, &to, true, false);
        let (number, bits) = read_entity_header(&mut msg).unwrap();
        let back = read_delta_entity(&mut msg, &from, number, bits).unwrap();
        assert_eq!(back.event, 0);
    }

    #[test]
    fn header_escalates_to_three_bytes_only_when_needed() {
        let mut msg = MessageBuffer::default();
        write_entity_header(&mut msg, EntityBits::ORIGIN_X, 5);
        assert_eq!(msg.len(), 2); // one mask byte + 8-bit number

        msg.clear();
        write_entity_header(&mut msg, EntityBits::MODEL, 5);
        assert_eq!(msg.len(), 3); // two mask bytes + 8-bit number

        msg.clear();
        write_entity_header(&mut msg, EntityBits::OWNER, 300);
        assert_eq!(msg.len(), 5); // three mask bytes + 16-bit number
    }

    #[test]
    fn remove_header_round_trips() {
        let mut msg = MessageBuffer::default();
        write_entity_header(&mut msg, EntityBits::REMOVE, 700);
        let (number, bits) = read_entity_header(&mut msg).unwrap();
        assert_eq!(number, 700);
        assert!(bits.contains(EntityBits::REMOVE));
    }

    #[test]
    fn truncated_entity_update_is_an_error() {
        let from = sample_entity();
        let mut to = from;
        to.origin[0] += 10.0;

        let mut msg = MessageBuffer::default();
        write_delta_entity(&mut msg, &from, &to, false, false);
        let truncated: Vec<u8> = msg.as_slice()[..msg.len() - 1].to_vec();

        let mut short = MessageBuffer::from_bytes(&truncated);
        let (number, bits) = read_entity_header(&mut short).unwrap();
        assert_eq!(
            read_delta_entity(&mut short, &from, number, bits),
            Err(ProtocolError::UnexpectedEnd)
        );
    }

    #[test]
    fn cmd_delta_round_trips() {
        let from = UserCmd::default();
        let cmd = UserCmd {
            msec: 16,
            buttons: ButtonFlags::ATTACK | ButtonFlags::ANY,
            angles: [1000, -2000, 0],
            forward_move: 127,
            side_move: -64,
            up_move: 300,
            impulse: 7,
        };

        let mut msg = MessageBuffer::default();
        write_delta_cmd(&mut msg, &from, &cmd);
        let back = read_delta_cmd(&mut msg, &from);
        assert_eq!(back, cmd);
    }

    #[test]
    fn unchanged_cmd_costs_two_bytes() {
        let cmd = UserCmd {
            msec: 16,
            forward_move: 200,
            ..UserCmd::default()
        };
        let mut msg = MessageBuffer::default();
        write_delta_cmd(&mut msg, &cmd, &cmd);
        assert_eq!(msg.len(), 2); // empty mask + msec
        let back = read_delta_cmd(&mut msg, &cmd);
        assert_eq!(back, cmd);
    }

    #[test]
    fn player_delta_round_trips() {
        let from = PlayerState::default();
        let to = PlayerState {
            move_state: MoveState {
                origin: [800, -400, 0],
                velocity: [120, 0, -56],
                gravity: 800,
                ..MoveState::spawn()
            },
            view_angles: [0, 16384, 0],
            view_height: 22,
            fov: 90,
            weapon_model: 2,
        };

        let mut msg = MessageBuffer::default();
        write_delta_player(&mut msg, &from, &to);
        let back = read_delta_player(&mut msg, &from).unwrap();
        assert_eq!(back, to);
    }

    #[test]
    fn player_zero_diff_is_identity() {
        let state = PlayerState {
            move_state: MoveState::spawn(),
            fov: 90,
            ..PlayerState::default()
        };
        let mut msg = MessageBuffer::default();
        write_delta_player(&mut msg, &state, &state);
        assert_eq!(msg.len(), 2); // just the empty mask word
        let back = read_delta_player(&mut msg, &state).unwrap();
        assert_eq!(back, state);
    }
}
