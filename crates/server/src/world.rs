//! Server-side entity arena.
//!
//! A fixed-capacity, index-addressed table of live entities. Game logic
//! (external to this core) mutates entities between ticks; the snapshot
//! engine reads them out in ascending order once per tick per client.
//! Entity numbers `1..=MAX_CLIENTS` are reserved for player avatars.

use arclight_core::{EntityState, MAX_ENTITIES};

/// Fixed arena of live entities, addressed by entity number.
pub struct EntityArena {
    slots: Box<[Option<EntityState>]>,
}

impl Default for EntityArena {
    fn default() -> Self {
        Self {
            slots: vec![None; MAX_ENTITIES].into_boxed_slice(),
        }
    }
}

impl EntityArena {
    /// Bring an entity to life. `state.number` addresses the slot; a live
    /// entity there is replaced (number reuse is the caller's call, the
    /// replication layer handles it with a forced full update).
    pub fn spawn(&mut self, state: EntityState) {
        debug_assert!(state.number != 0, "entity number unset");
        self.slots[state.number as usize] = Some(state);
    }

    /// Remove an entity; the next snapshot emits an explicit remove.
    pub fn despawn(&mut self, number: u16) {
        self.slots[number as usize] = None;
    }

    /// Live entity by number.
    pub fn get(&self, number: u16) -> Option<&EntityState> {
        self.slots[number as usize].as_ref()
    }

    /// Mutable live entity by number.
    pub fn get_mut(&mut self, number: u16) -> Option<&mut EntityState> {
        self.slots[number as usize].as_mut()
    }

    /// All live entities in ascending number order, as the snapshot layer
    /// requires.
    pub fn snapshot(&self) -> Vec<EntityState> {
        self.slots.iter().filter_map(|slot| *slot).collect()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when no entity is live.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    /// Clear the transient event field on every live entity; events fire
    /// for exactly one broadcast.
    pub fn clear_events(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.event = 0;
        }
    }

    /// Remove every entity (level change).
    pub fn clear(&mut self) {
        self.slots.fill(None);
    }
}
