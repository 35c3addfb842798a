//! Recycled playback buffers.
//!
//! Each slot moves `Free -> CheckedOut -> Submitted -> Free`. A
//! [`BufferTicket`] names a slot *and* the generation it was checked out
//! in; the generation is bumped whenever the slot goes back to the pool,
//! so a ticket that is returned twice, or returned after the pool
//! reclaimed everything, is rejected instead of freeing a buffer that
//! someone else now owns.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTicket {
    slot: usize,
    generation: u64,
}

impl BufferTicket {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    CheckedOut,
    Submitted,
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    state: SlotState,
    generation: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer ticket for slot {0} is stale")]
    StaleTicket(usize),
    #[error("buffer in slot {0} is not in the expected state")]
    WrongState(usize),
}

#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free buffer (or allocate one) and copy `bytes` into it.
    pub fn checkout(&mut self, bytes: &[u8]) -> BufferTicket {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    data: Vec::with_capacity(bytes.len()),
                    state: SlotState::Free,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        };

        let entry = &mut self.slots[slot];
        debug_assert_eq!(entry.state, SlotState::Free);
        entry.data.clear();
        entry.data.extend_from_slice(bytes);
        entry.state = SlotState::CheckedOut;

        BufferTicket {
            slot,
            generation: entry.generation,
        }
    }

    /// Mark a checked-out buffer as handed to the device and return its bytes.
    pub fn submit(&mut self, ticket: BufferTicket) -> Result<&[u8], PoolError> {
        let entry = self.live_slot(ticket)?;
        if entry.state != SlotState::CheckedOut {
            return Err(PoolError::WrongState(ticket.slot));
        }
        entry.state = SlotState::Submitted;
        Ok(entry.data.as_slice())
    }

    /// Give a buffer back. Valid for checked-out and submitted buffers.
    pub fn release(&mut self, ticket: BufferTicket) -> Result<(), PoolError> {
        let entry = self.live_slot(ticket)?;
        if entry.state == SlotState::Free {
            return Err(PoolError::WrongState(ticket.slot));
        }
        entry.state = SlotState::Free;
        entry.generation += 1;
        self.free.push(ticket.slot);
        Ok(())
    }

    /// Return every buffer still out, after the device has dropped its
    /// references. Outstanding tickets become stale.
    pub fn reclaim_all(&mut self) -> usize {
        let mut reclaimed = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.state != SlotState::Free {
                entry.state = SlotState::Free;
                entry.generation += 1;
                self.free.push(index);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn is_in_flight(&self, ticket: BufferTicket) -> bool {
        self.slots
            .get(ticket.slot)
            .is_some_and(|s| s.generation == ticket.generation && s.state == SlotState::Submitted)
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Submitted)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn live_slot(&mut self, ticket: BufferTicket) -> Result<&mut Slot, PoolError> {
        match self.slots.get_mut(ticket.slot) {
            Some(entry) if entry.generation == ticket.generation => Ok(entry),
            _ => Err(PoolError::StaleTicket(ticket.slot)),
        }
    }
}
