//! Binary layout of a state monitor file.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ 0    MonitorHeader                                             │
//! │      magic (8B atomic) │ layout_version │ payload_len │ rsvd   │
//! ├────────────────────────────────────────────────────────────────┤
//! │ 64   ControlBlock                                              │
//! │      version │ writer_pid │ lock_state │ reserved              │
//! ├────────────────────────────────────────────────────────────────┤
//! │ 128  Doorbell line                                             │
//! │      generation (8B) │ stop (8B) │ padding (48B)               │
//! ├────────────────────────────────────────────────────────────────┤
//! │ 192  Payload (payload_len bytes)                               │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each part starts on its own cache line. Offsets are fixed; only the payload
//! length varies between files.

use crate::control_block::{CACHE_LINE, CONTROL_BLOCK_SIZE};
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// ASCII "BASALTCB" (basalt control block).
pub const MONITOR_MAGIC: u64 = 0x4241_5341_4C54_4342;

/// Bump on any incompatible layout change; `open` rejects other versions.
pub const MONITOR_LAYOUT_VERSION: u64 = 1;

pub const HEADER_OFFSET: usize = 0;
pub const CONTROL_BLOCK_OFFSET: usize = HEADER_OFFSET + CACHE_LINE;
pub const DOORBELL_OFFSET: usize = CONTROL_BLOCK_OFFSET + CONTROL_BLOCK_SIZE;
pub const STOP_OFFSET: usize = DOORBELL_OFFSET + size_of::<i64>();
pub const PAYLOAD_OFFSET: usize = DOORBELL_OFFSET + CACHE_LINE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("bad magic {found:#018x}")]
    BadMagic { found: u64 },

    #[error("layout version {found}, expected {expected}", expected = MONITOR_LAYOUT_VERSION)]
    WrongVersion { found: u64 },

    #[error("mapping is {mapped} bytes, layout needs {needed}")]
    Truncated { needed: usize, mapped: usize },
}

/// Header at offset 0 of every monitor file.
///
/// `magic` is written last with release ordering, so a process that sees the
/// magic also sees the other header fields.
#[repr(C, align(64))]
pub struct MonitorHeader {
    pub magic: AtomicU64,
    pub layout_version: u64,
    pub payload_len: u64,
    _reserved: [u64; 5],
}

const _: () = assert!(size_of::<MonitorHeader>() == CACHE_LINE);

impl MonitorHeader {
    /// An unsealed header; call [`seal`](Self::seal) once it is in place.
    pub fn new(payload_len: usize) -> Self {
        Self {
            magic: AtomicU64::new(0),
            layout_version: MONITOR_LAYOUT_VERSION,
            payload_len: payload_len as u64,
            _reserved: [0; 5],
        }
    }

    pub fn seal(&self) {
        self.magic.store(MONITOR_MAGIC, Ordering::Release);
    }

    /// Checks the header against the size of the mapping it was found in.
    pub fn validate(&self, mapped: usize) -> Result<(), LayoutError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != MONITOR_MAGIC {
            return Err(LayoutError::BadMagic { found: magic });
        }
        if self.layout_version != MONITOR_LAYOUT_VERSION {
            return Err(LayoutError::WrongVersion {
                found: self.layout_version,
            });
        }
        let needed = bytes_for_monitor(self.payload_len as usize);
        if mapped < needed {
            return Err(LayoutError::Truncated { needed, mapped });
        }
        Ok(())
    }
}

/// Total bytes of a monitor file with `payload_len` payload bytes.
pub fn bytes_for_monitor(payload_len: usize) -> usize {
    PAYLOAD_OFFSET.saturating_add(payload_len)
}
