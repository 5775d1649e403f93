//! Frame snapshots, baselines, and packet-entities encoding.
//!
//! The server keeps, per client, a ring of the last [`FRAME_BACKUP`] frames
//! it sent. Each new frame is encoded as per-entity deltas against the
//! newest frame the client has acknowledged; if that frame has aged out of
//! the ring the whole snapshot is encoded against nothing. Entities present
//! in the old frame but missing from the new one are removed explicitly;
//! entities absent from an update are implicitly unchanged.
//!
//! The entity list is emitted in ascending entity-number order and closed
//! with a zero terminator instead of a length prefix; the decoder relies on
//! that ordering and treats any regression as a fatal protocol error.

use arclight_core::{EntityState, PlayerState, MAX_ENTITIES};
use tracing::warn;

use crate::delta::{
    read_delta_entity, read_entity_header, write_delta_entity, write_entity_header, EntityBits,
};
use crate::error::ProtocolError;
use crate::msg::MessageBuffer;

/// Depth of the retained frame history ring.
pub const FRAME_BACKUP: usize = 16;
/// Ring index mask.
pub const FRAME_MASK: usize = FRAME_BACKUP - 1;

/// One client-visible world state at one server tick.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    /// Server frame number; 0 means the slot has never held a frame.
    pub number: u32,
    /// Frame number the deltas were computed against, if any.
    pub delta_base: Option<u32>,
    /// False when delta reconstruction failed; invalid frames are stored
    /// for sequencing but never rendered or acknowledged.
    pub valid: bool,
    /// Authoritative player state for the receiving client.
    pub player: PlayerState,
    /// Visible entities, ascending by entity number.
    pub entities: Vec<EntityState>,
}

/// Per-entity "last acknowledged state" table, the delta base of last
/// resort. Indexed by entity number.
#[derive(Debug)]
pub struct BaselineTable {
    slots: Box<[EntityState]>,
}

impl Default for BaselineTable {
    fn default() -> Self {
        Self {
            slots: vec![EntityState::default(); MAX_ENTITIES].into_boxed_slice(),
        }
    }
}

impl BaselineTable {
    /// Baseline for `number`, the default state if none was ever set.
    pub fn get(&self, number: u16) -> &EntityState {
        &self.slots[number as usize]
    }

    /// Install the spawn baseline for an entity.
    pub fn set(&mut self, state: EntityState) {
        self.slots[state.number as usize] = state;
    }

    /// The baselines that have been set, ascending by entity number.
    pub fn iter_set(&self) -> impl Iterator<Item = &EntityState> {
        self.slots.iter().filter(|state| state.number != 0)
    }

    /// Drop every baseline (level change).
    pub fn clear(&mut self) {
        self.slots.fill(EntityState::default());
    }
}

/// Ring buffer of the last [`FRAME_BACKUP`] snapshots.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    frames: [FrameSnapshot; FRAME_BACKUP],
}

impl SnapshotHistory {
    /// Store `frame` in its ring slot, evicting whatever aged out.
    pub fn store(&mut self, frame: FrameSnapshot) {
        let slot = frame.number as usize & FRAME_MASK;
        self.frames[slot] = frame;
    }

    /// Look up frame `number`; `None` if it has been evicted from the ring
    /// or was never stored.
    pub fn get(&self, number: u32) -> Option<&FrameSnapshot> {
        let slot = &self.frames[number as usize & FRAME_MASK];
        (slot.number == number && number != 0).then_some(slot)
    }

    /// Forget everything (disconnect, level change).
    pub fn clear(&mut self) {
        self.frames = Default::default();
    }
}

/// Client-side per-entity tracking: spawn baseline plus the last two
/// server states, for delta merging and render interpolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackedEntity {
    /// Spawn baseline received during the handshake.
    pub baseline: EntityState,
    /// State in the newest frame that included this entity.
    pub current: EntityState,
    /// State one frame earlier, for interpolation. Reset to `current` on
    /// spawn and teleport so the renderer never lerps across a reuse.
    pub prev: EntityState,
    /// Frame number that last included this entity; entities not in the
    /// current frame are not part of the world.
    pub server_frame: u32,
}

/// Fixed arena of [`TrackedEntity`] indexed by entity number.
#[derive(Debug)]
pub struct EntityTable {
    entries: Box<[TrackedEntity]>,
}

impl Default for EntityTable {
    fn default() -> Self {
        Self {
            entries: vec![TrackedEntity::default(); MAX_ENTITIES].into_boxed_slice(),
        }
    }
}

impl EntityTable {
    /// Entity slot for `number`.
    pub fn get(&self, number: u16) -> &TrackedEntity {
        &self.entries[number as usize]
    }

    /// Mutable entity slot for `number`.
    pub fn get_mut(&mut self, number: u16) -> &mut TrackedEntity {
        &mut self.entries[number as usize]
    }

    /// Reset all tracking (level change).
    pub fn clear(&mut self) {
        self.entries.fill(TrackedEntity::default());
    }
}

/// Encode the entity list of `to` as deltas against `from` (or against the
/// spawn baselines when `from` is `None`).
///
/// Both entity lists are ascending by entity number, so a single merge walk
/// classifies every entity as changed, new, or removed.
pub fn write_packet_entities(
    msg: &mut MessageBuffer,
    from: Option<&FrameSnapshot>,
    to: &FrameSnapshot,
    baselines: &BaselineTable,
) {
    let empty: &[EntityState] = &[];
    let old_list = from.map_or(empty, |f| f.entities.as_slice());
    let new_list = to.entities.as_slice();

    let mut old_index = 0;
    let mut new_index = 0;

    while old_index < old_list.len() || new_index < new_list.len() {
        let old_num = old_list
            .get(old_index)
            .map_or(u16::MAX, |state| state.number);
        let new_num = new_list
            .get(new_index)
            .map_or(u16::MAX, |state| state.number);

        if new_num == old_num {
            // Present in both: plain delta, omitted entirely if unchanged.
            write_delta_entity(msg, &old_list[old_index], &new_list[new_index], false, false);
            old_index += 1;
            new_index += 1;
        } else if new_num < old_num {
            // Newly visible: full update from the spawn baseline so stale
            // fields from a previous occupant of the number never leak.
            write_delta_entity(
                msg,
                baselines.get(new_num),
                &new_list[new_index],
                true,
                true,
            );
            new_index += 1;
        } else {
            // Gone from the new frame: explicit removal.
            write_entity_header(msg, EntityBits::REMOVE, old_num);
            old_index += 1;
        }
    }

    // Terminator: entity number zero.
    write_entity_header(msg, EntityBits::empty(), 0);
}

/// Decode a packet-entities list into `frame`, merging deltas over
/// `old_frame` (unchanged entities carry forward) and the table baselines
/// (new entities), and updating the per-entity tracking in `table`.
pub fn read_packet_entities(
    msg: &mut MessageBuffer,
    old_frame: Option<&FrameSnapshot>,
    table: &mut EntityTable,
    frame: &mut FrameSnapshot,
) -> Result<(), ProtocolError> {
    let empty: &[EntityState] = &[];
    let old_list = old_frame.map_or(empty, |f| f.entities.as_slice());
    let mut old_index = 0;
    let mut last_number = 0u16;

    loop {
        let (number, bits) = read_entity_header(msg)?;
        if number == 0 {
            break;
        }
        if number as usize >= MAX_ENTITIES {
            return Err(ProtocolError::BadEntityNumber(number));
        }
        if number <= last_number {
            return Err(ProtocolError::NonAscendingEntities {
                prev: last_number,
                got: number,
            });
        }
        last_number = number;

        // Entities the update skipped are unchanged: carry them forward.
        while old_index < old_list.len() && old_list[old_index].number < number {
            carry_unchanged(table, frame, &old_list[old_index]);
            old_index += 1;
        }

        let in_old_frame =
            old_index < old_list.len() && old_list[old_index].number == number;

        if bits.contains(EntityBits::REMOVE) {
            if !in_old_frame {
                warn!(number, "remove for entity not in the delta base");
            } else {
                old_index += 1;
            }
            continue;
        }

        let (from, new_entity) = if in_old_frame {
            (old_list[old_index], false)
        } else {
            // Not in the old frame: delta starts from the spawn baseline.
            (table.get(number).baseline, true)
        };
        if in_old_frame {
            old_index += 1;
        }

        let state = read_delta_entity(msg, &from, number, bits)?;
        apply_update(table, frame, state, new_entity);
    }

    // Whatever remains of the old frame is unchanged.
    while old_index < old_list.len() {
        carry_unchanged(table, frame, &old_list[old_index]);
        old_index += 1;
    }

    Ok(())
}

/// Carry an entity the update did not mention into the new frame.
fn carry_unchanged(table: &mut EntityTable, frame: &mut FrameSnapshot, state: &EntityState) {
    let entry = table.get_mut(state.number);
    entry.prev = entry.current;
    let mut carried = *state;
    carried.event = 0;
    entry.current = carried;
    entry.server_frame = frame.number;
    frame.entities.push(carried);
}

/// Install a decoded entity update into the table and frame.
fn apply_update(
    table: &mut EntityTable,
    frame: &mut FrameSnapshot,
    state: EntityState,
    new_entity: bool,
) {
    let entry = table.get_mut(state.number);
    if new_entity || entry.server_frame != frame.number.wrapping_sub(1) {
        // (Re)appearing entity: no previous state worth interpolating from.
        entry.prev = state;
    } else {
        entry.prev = entry.current;
    }
    entry.current = state;
    entry.server_frame = frame.number;
    frame.entities.push(state);
}
