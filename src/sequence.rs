//! # Per-channel sequence numbering
//!
//! Every writable or notifying characteristic carries its own independent
//! sequence counter. The counter starts at zero, increments by one for each
//! frame sent on that channel and wraps from 255 back to zero.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::gatt::channel;

/// Independent wrapping sequence counters, keyed by characteristic short code.
///
/// The registry is shared between the command, piloting and acknowledgement
/// paths; the lock is held only long enough to take one number.
pub struct SequenceRegistry {
    counters: Mutex<HashMap<u16, u8>>,
}

impl SequenceRegistry {
    /// Creates a registry with every protocol channel seeded at zero.
    pub fn new() -> Self {
        let seeded = [
            channel::PILOTING,
            channel::COMMANDS,
            channel::EMERGENCY,
            channel::ACK_OUT,
            channel::FTP_DATA,
            channel::FTP_CONTROL,
        ];

        SequenceRegistry {
            counters: Mutex::new(seeded.into_iter().map(|code| (code, 0)).collect()),
        }
    }

    /// Returns the current value for `target` and advances the counter.
    ///
    /// Targets outside the seeded set start at zero on first use.
    pub fn next(&self, target: u16) -> u8 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(target).or_insert(0);
        let value = *counter;
        *counter = counter.wrapping_add(1);
        value
    }
}

impl Default for SequenceRegistry {
    fn default() -> Self {
        SequenceRegistry::new()
    }
}
