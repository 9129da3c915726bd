//! Emulation state shared by the transfer hooks and the combo monitor
//!
//! One mutex guards both the enabled flag and the dump buffer, so a reader
//! never sees a buffer mid-write or mid-allocation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dump::DumpBuffer;

/// Enabled flag plus the dump bound to the current lifecycle
#[derive(Debug, Default)]
pub struct EmulationState {
    /// Whether portal transfers are served from the dump
    pub enabled: bool,
    /// Current dump; `None` before the first load or once released
    pub dump: Option<DumpBuffer>,
    /// Set by `release()`; never cleared for this lifecycle
    released: bool,
}

impl EmulationState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            dump: None,
            released: false,
        }
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        self.enabled
    }

    /// Dump for a write, allocating the zero-filled maximum buffer if absent
    ///
    /// `None` once released: a late write must not resurrect a buffer.
    pub fn dump_for_write(&mut self) -> Option<&mut DumpBuffer> {
        if self.released {
            return None;
        }
        Some(self.dump.get_or_insert_with(DumpBuffer::zeroed))
    }

    /// Drop the dump, leaving the zero-length marker behind
    pub fn release(&mut self) -> Option<DumpBuffer> {
        self.released = true;
        self.dump.take()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Length of the current dump (0 when released)
    pub fn dump_len(&self) -> usize {
        self.dump.as_ref().map_or(0, DumpBuffer::len)
    }
}

/// Shared emulation state
pub type SharedEmulation = Arc<Mutex<EmulationState>>;

/// Create a new shared emulation state with no dump loaded
pub fn new_shared_state(enabled: bool) -> SharedEmulation {
    Arc::new(Mutex::new(EmulationState::new(enabled)))
}

/// Lock the shared state, recovering from a poisoned lock
///
/// A panic in one caller's transfer must not wedge every later transfer.
pub fn lock(state: &SharedEmulation) -> MutexGuard<'_, EmulationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events emitted when the emulation state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationEvent {
    /// The combo flipped the enabled flag
    Toggled { enabled: bool },
}
