//! Lock-free optimistic concurrency control over shared memory.
//!
//! A 64-byte [`ControlBlock`] placed in memory shared between threads or
//! processes, driven only by compare-and-swap, release stores and acquire
//! loads:
//!
//! - [`atomic`]: the three primitives, on raw addresses or validated
//!   [`AtomicCell`] handles
//! - [`VersionCounter`] / [`VersionedBlock`]: parity-versioned optimistic
//!   writes and validated reads
//! - [`Doorbell`] / [`StopSignal`]: latest-value-wins notification
//! - [`Region`]: turns a caller-owned buffer into the handles above
//! - [`StateMonitor`]: all of it in one memory-mapped file for cross-process use

pub mod atomic;
mod control_block;
mod doorbell;
mod monitor;
pub mod monitor_layout;
mod region;
mod retry;
mod versioned;

pub use atomic::AtomicCell;
pub use control_block::{
    CACHE_LINE, CONTROL_BLOCK_SIZE, ControlBlock, ControlSnapshot, LOCK_FREE, LOCK_HELD,
    LOCK_STATE_OFFSET, VERSION_OFFSET, WRITER_PID_OFFSET, current_pid,
};
pub use doorbell::{Doorbell, RUNNING, Rung, STOP_REQUESTED, StopSignal};
pub use monitor::StateMonitor;
pub use region::{HeapRegion, Payload, Plain, Region, RegionError};
pub use retry::RetryPolicy;
pub use versioned::{
    PublishError, Published, ReadTicket, VersionCounter, VersionedBlock, VersionedSlot, WriteError,
    WriteSession, is_write_in_progress,
};
