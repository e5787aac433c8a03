//! The control block: synchronization metadata for one protected payload.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    ControlBlock (64 bytes)                     │
//! │  ┌──────────┬────────────┬────────────┬─────────────────────┐  │
//! │  │ version  │ writer_pid │ lock_state │      reserved       │  │
//! │  │ (8B i64) │  (8B i64)  │  (8B i64)  │       (40B)         │  │
//! │  └──────────┴────────────┴────────────┴─────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The block fills exactly one cache line so it never shares a line with the
//! payload or a neighbouring block.
//!
//! Each field is atomic on its own. Nothing updates two fields as one unit:
//! a reader can see the `version` of one write next to the `writer_pid` of
//! another.

use crate::atomic::AtomicCell;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::AtomicI64;

/// Cache line size the layout is built around.
pub const CACHE_LINE: usize = 64;

/// Size of a [`ControlBlock`] in bytes.
pub const CONTROL_BLOCK_SIZE: usize = 64;

pub const VERSION_OFFSET: usize = 0;
pub const WRITER_PID_OFFSET: usize = 8;
pub const LOCK_STATE_OFFSET: usize = 16;

/// `lock_state` value of a free advisory lock.
pub const LOCK_FREE: i64 = 0;
/// `lock_state` value of a held advisory lock.
pub const LOCK_HELD: i64 = 1;

#[repr(C, align(64))]
pub struct ControlBlock {
    version: AtomicI64,
    writer_pid: AtomicI64,
    lock_state: AtomicI64,
    _reserved: [u8; 40],
}

const _: () = {
    assert!(size_of::<ControlBlock>() == CONTROL_BLOCK_SIZE);
    assert!(align_of::<ControlBlock>() == CACHE_LINE);
    assert!(offset_of!(ControlBlock, version) == VERSION_OFFSET);
    assert!(offset_of!(ControlBlock, writer_pid) == WRITER_PID_OFFSET);
    assert!(offset_of!(ControlBlock, lock_state) == LOCK_STATE_OFFSET);
};

/// The three fields as read one after another.
///
/// Not an atomic snapshot: the fields may come from different updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub version: i64,
    pub writer_pid: i64,
    pub lock_state: i64,
}

impl ControlBlock {
    /// A zeroed block, for placing in ordinary (non-shared) memory.
    pub const fn new() -> Self {
        Self {
            version: AtomicI64::new(0),
            writer_pid: AtomicI64::new(0),
            lock_state: AtomicI64::new(0),
            _reserved: [0; 40],
        }
    }

    #[inline(always)]
    pub fn version(&self) -> AtomicCell<'_> {
        AtomicCell::from_atomic(&self.version)
    }

    #[inline(always)]
    pub fn writer_pid(&self) -> AtomicCell<'_> {
        AtomicCell::from_atomic(&self.writer_pid)
    }

    #[inline(always)]
    pub fn lock_state(&self) -> AtomicCell<'_> {
        AtomicCell::from_atomic(&self.lock_state)
    }

    /// Zeroes all three fields. Only meaningful while no one else is using
    /// the block, i.e. when the region is first established.
    pub fn reset(&self) {
        self.version().store(0);
        self.writer_pid().store(0);
        self.lock_state().store(LOCK_FREE);
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            version: self.version().load(),
            writer_pid: self.writer_pid().load(),
            lock_state: self.lock_state().load(),
        }
    }

    /// Takes the advisory lock and records `owner` as the writer.
    ///
    /// Only excludes participants that also call `try_lock`; the versioned
    /// protocol never looks at `lock_state`.
    pub fn try_lock(&self, owner: i64) -> bool {
        if self.lock_state().compare_and_swap(LOCK_FREE, LOCK_HELD) {
            self.writer_pid().store(owner);
            true
        } else {
            false
        }
    }

    /// Releases the advisory lock. Returns `false` if it was not held.
    pub fn unlock(&self) -> bool {
        self.lock_state().compare_and_swap(LOCK_HELD, LOCK_FREE)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state().load() != LOCK_FREE
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Identity written into `writer_pid` by this process.
pub fn current_pid() -> i64 {
    i64::from(std::process::id())
}
