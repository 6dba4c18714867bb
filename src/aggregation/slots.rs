use std::mem::size_of;

use tracing::debug;

use crate::error::Result;
use crate::memory::MemoryReservation;

/// Sparse arena of per-group states indexed by group id.
///
/// Slots start empty and the arena grows by doubling to the highest group id
/// written. Only the slot array itself is charged here; the states' own
/// buffers are accounted by the table that owns the arena.
#[derive(Debug)]
pub struct GroupSlots<S> {
    slots: Vec<Option<S>>,
    reservation: MemoryReservation,
}

impl<S> GroupSlots<S> {
    pub fn new(mut reservation: MemoryReservation, initial_capacity: usize) -> Result<Self> {
        reservation.try_grow(initial_capacity * Self::slot_bytes())?;
        let mut slots = Vec::new();
        slots.resize_with(initial_capacity, || None);
        Ok(Self { slots, reservation })
    }

    #[inline]
    pub fn slot_bytes() -> usize {
        size_of::<Option<S>>()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.size()
    }

    pub fn ensure_capacity(&mut self, group_id: u32) -> Result<()> {
        let needed = group_id as usize + 1;
        let len = self.slots.len();
        if needed <= len {
            return Ok(());
        }
        let new_len = needed.max(len * 2);
        self.reservation
            .try_grow((new_len - len) * Self::slot_bytes())?;
        self.slots.resize_with(new_len, || None);
        debug!(
            operator = %self.reservation.operator(),
            from = len,
            to = new_len,
            "grew group slots"
        );
        Ok(())
    }

    #[inline]
    pub fn get(&self, group_id: u32) -> Option<&S> {
        self.slots.get(group_id as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, group_id: u32) -> Option<&mut S> {
        self.slots.get_mut(group_id as usize).and_then(Option::as_mut)
    }

    /// The slot of `group_id`; capacity must have been ensured.
    #[inline]
    pub fn slot_mut(&mut self, group_id: u32) -> &mut Option<S> {
        &mut self.slots[group_id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &S)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(g, s)| s.as_ref().map(|s| (g as u32, s)))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Remove the first `n` slots, shifting the remaining group ids down by `n`.
    pub fn take_first(&mut self, n: usize) -> Vec<Option<S>> {
        let n = n.min(self.slots.len());
        let taken: Vec<Option<S>> = self.slots.drain(..n).collect();
        self.reservation.shrink(n * Self::slot_bytes());
        taken
    }
}
