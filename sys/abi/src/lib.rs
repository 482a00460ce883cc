// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine ABI definitions, shared between the engine and embedding
//! applications.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// Number of word-sized slots in a task-local storage table.
pub const TLS_SIZE: usize = 8;

/// Capacity of a channel inbox, in packets.
pub const CHAN_RING_DEPTH: usize = 16;

/// Maximum number of opaque words that can be captured as task arguments.
pub const MAX_TASK_ARGS: usize = 16;

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines two fields, a task slot index and a slot generation
/// number. The generation number begins counting at zero and wraps on
/// overflow. Critically, the generation number of a slot is incremented when
/// the task occupying it is deleted. Attempts to address a task using an
/// outdated generation number fail at resolution time, which is how stale
/// channel bindings to departed peers are detected.
///
/// The slot index is in the lower `TaskId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits in a `TaskId` used to represent the slot index, rather
    /// than the generation number. This must currently be 15 or smaller.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `TaskId` for a known slot index and generation number.
    pub fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track slot generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << TaskId::INDEX_BITS >> TaskId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

bitflags::bitflags! {
    /// Per-task behavior flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct TaskFlags: u32 {
        /// Skip this task during scheduling.
        const FREEZE = 1 << 0;
        /// Modifier on `FREEZE`: re-enable the task when its channel inbox
        /// becomes non-empty, and fire it immediately in that pass.
        const UNFREEZE_BY_CHAN_WRITE = 1 << 1;
    }
}

/// Engine error codes.
///
/// Every fallible engine operation reports one of these directly; the awaiter
/// is the only cross-task carrier and collapses task-side failure into its
/// final status. The discriminants match the original wire codes, so embedders
/// that forward them over a byte interface keep a stable encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    /// Unrecoverable invariant violation.
    FatalError = -1,
    /// An awaiter's timer elapsed before its task finished.
    Timeout = -2,
    /// Null-equivalent or out-of-range argument.
    InvalidParameter = -3,
    /// The awaited task was deleted before finishing.
    Canceled = -4,
    /// Allocation or capacity exhaustion.
    OutOfMemory = -5,
    /// Engine API called before `init`.
    NotInitialized = -6,
    /// Read from an empty source (inbox, cursor at end).
    Eof = -7,
    /// Channel operation on a task without the required channel or bind
    /// state.
    InvalidChan = -8,
    /// A fixed-capacity queue refused a write.
    Full = -9,
}

impl Error {
    /// The numeric code for this error, as seen on a byte interface.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Control byte carried by a channel packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ChanCtl {
    /// Ordinary data packet.
    #[default]
    Ok,
    /// Peer-departure notification; the packet's `from` field names the
    /// departing task.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trip() {
        for index in [0_usize, 1, 17, 1023] {
            for g in [0_u8, 1, 63] {
                let id = TaskId::for_index_and_gen(index, Generation::from(g));
                assert_eq!(id.index(), index);
                assert_eq!(id.generation(), Generation::from(g));
            }
        }
    }

    #[test]
    fn generation_wraps_within_field() {
        let mut g = Generation::default();
        // INDEX_BITS = 10 leaves 6 bits of generation; stepping through a
        // full cycle must return to the start without escaping the field.
        for _ in 0..64 {
            g = g.next();
            let id = TaskId::for_index_and_gen(5, g);
            assert_eq!(id.index(), 5);
        }
        assert_eq!(g, Generation::default());
    }

    #[test]
    fn index_is_masked() {
        let id = TaskId::for_index_and_gen(1024 + 3, Generation::from(1));
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::FatalError.code(), -1);
        assert_eq!(Error::Timeout.code(), -2);
        assert_eq!(Error::InvalidParameter.code(), -3);
        assert_eq!(Error::Canceled.code(), -4);
        assert_eq!(Error::OutOfMemory.code(), -5);
        assert_eq!(Error::NotInitialized.code(), -6);
        assert_eq!(Error::Eof.code(), -7);
        assert_eq!(Error::InvalidChan.code(), -8);
        assert_eq!(Error::Full.code(), -9);
    }
}
