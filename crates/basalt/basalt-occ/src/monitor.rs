//! A control block, two doorbells and a payload in one memory-mapped file.
//!
//! The file is the rendezvous point between processes: a publisher creates
//! it, any number of watchers open it, and all of them run the versioned
//! protocol and the doorbells against the same bytes.
//!
//! # Roles
//! - **Publisher**: `create`s the file, writes the payload through write
//!   sessions, rings the generation doorbell, and finally requests stop.
//! - **Watchers**: `open` the file, poll the doorbells and validate every
//!   payload read against the version.
//!
//! See [`monitor_layout`](crate::monitor_layout) for the byte layout.

use crate::atomic::AtomicCell;
use crate::control_block::ControlBlock;
use crate::doorbell::{Doorbell, StopSignal};
use crate::monitor_layout::{
    CONTROL_BLOCK_OFFSET, DOORBELL_OFFSET, HEADER_OFFSET, LayoutError, MonitorHeader,
    PAYLOAD_OFFSET, STOP_OFFSET, bytes_for_monitor,
};
use crate::region::{Payload, Plain, Region, RegionError};
use crate::versioned::{VersionCounter, VersionedBlock, VersionedSlot};
use basalt_mmap::MmapFileMut;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info};

pub struct StateMonitor {
    /// Owns the mapping; `base` points into it.
    _mm: MmapFileMut,
    base: *mut u8,
    mapped_len: usize,
    payload_len: usize,
    path: PathBuf,
}

// SAFETY: every access through `base` is either atomic or goes through the
// versioned protocol; the mapping itself is not tied to a thread.
unsafe impl Send for StateMonitor {}
unsafe impl Sync for StateMonitor {}

impl StateMonitor {
    /// Creates the monitor file at `path`.
    ///
    /// An existing file is unlinked first, so processes still mapping it keep
    /// the old state while new `open`s see the new file. The control block,
    /// doorbells and payload start zeroed: version 0, generation 0, running.
    ///
    /// # Errors
    /// Returns an error if file creation or memory mapping fails.
    pub fn create<P: AsRef<Path>>(path: P, payload_len: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = bytes_for_monitor(payload_len);
        Self::unlink(&path)?;
        let mut mm = MmapFileMut::create_rw(&path, bytes as u64)?;
        let base = mm.as_mut_ptr();
        let mapped_len = mm.len();

        // SAFETY: freshly created mapping, page aligned and `bytes` long; no
        // one can have validated the header yet because the magic is unset.
        let header = unsafe {
            let h = base.add(HEADER_OFFSET) as *mut MonitorHeader;
            ptr::write(h, MonitorHeader::new(payload_len));
            &*h
        };

        let monitor = Self {
            _mm: mm,
            base,
            mapped_len,
            payload_len,
            path,
        };
        monitor.control_block().reset();
        monitor.doorbell().ring(0);
        monitor.stop_signal().reset();
        header.seal();

        info!(
            path = %monitor.path.display(),
            payload_len,
            bytes,
            "created state monitor"
        );
        Ok(monitor)
    }

    /// Opens a monitor file created by [`create`](Self::create).
    ///
    /// # Errors
    /// - the file doesn't exist or can't be mapped
    /// - `InvalidData` if the header is missing, unsealed, from another layout
    ///   version, or describes more bytes than the file holds
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut mm = MmapFileMut::open_rw(&path)?;
        let mapped_len = mm.len();
        if mapped_len < PAYLOAD_OFFSET {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                LayoutError::Truncated {
                    needed: PAYLOAD_OFFSET,
                    mapped: mapped_len,
                },
            ));
        }
        let base = mm.as_mut_ptr();

        // SAFETY: the mapping holds at least a full header.
        let header = unsafe { &*(base.add(HEADER_OFFSET) as *const MonitorHeader) };
        header
            .validate(mapped_len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let payload_len = header.payload_len as usize;

        debug!(path = %path.display(), payload_len, "opened state monitor");
        Ok(Self {
            _mm: mm,
            base,
            mapped_len,
            payload_len,
            path,
        })
    }

    /// Removes a monitor file. A file that is already gone is not an error.
    pub fn unlink<P: AsRef<Path>>(path: P) -> io::Result<()> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(()) => {
                debug!(path = %path.as_ref().display(), "unlinked state monitor");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// The whole mapping as a region, for carving custom layouts.
    pub fn region(&self) -> Region<'_> {
        // SAFETY: the mapping lives as long as `self`.
        unsafe { Region::from_raw_parts(self.base, self.mapped_len) }
    }

    #[inline(always)]
    pub fn control_block(&self) -> &ControlBlock {
        // SAFETY: CONTROL_BLOCK_OFFSET is cache-line aligned inside a page
        // aligned mapping that was validated to cover it.
        unsafe { &*(self.base.add(CONTROL_BLOCK_OFFSET) as *const ControlBlock) }
    }

    #[inline(always)]
    pub fn counter(&self) -> VersionCounter<'_> {
        VersionCounter::new(self.control_block())
    }

    /// The control block bound to the payload line it guards.
    #[inline(always)]
    pub fn versioned(&self) -> VersionedBlock<'_> {
        // SAFETY: the layout gives the payload to this control block alone,
        // past the header and doorbell lines; every process mapping the file
        // follows the same layout.
        unsafe { VersionedBlock::new(self.control_block(), self.payload()) }
    }

    /// The generation doorbell.
    #[inline(always)]
    pub fn doorbell(&self) -> Doorbell<'_> {
        // SAFETY: fixed, aligned offset inside the validated mapping.
        Doorbell::new(unsafe { AtomicCell::from_ptr(self.base.add(DOORBELL_OFFSET) as *mut i64) })
    }

    #[inline(always)]
    pub fn stop_signal(&self) -> StopSignal<'_> {
        // SAFETY: fixed, aligned offset inside the validated mapping.
        let cell = unsafe { AtomicCell::from_ptr(self.base.add(STOP_OFFSET) as *mut i64) };
        StopSignal::new(Doorbell::new(cell))
    }

    pub fn payload(&self) -> Payload<'_> {
        match self.region().payload(PAYLOAD_OFFSET, self.payload_len) {
            Ok(payload) => payload,
            Err(e) => unreachable!("validated monitor has no payload: {e}"),
        }
    }

    /// The payload viewed as a single `T` guarded by the control block.
    pub fn slot<T: Plain>(&self) -> Result<VersionedSlot<'_, T>, RegionError> {
        VersionedSlot::new(self.versioned())
    }
}

impl std::fmt::Debug for StateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMonitor")
            .field("path", &self.path)
            .field("payload_len", &self.payload_len)
            .field("control", &self.control_block().snapshot())
            .finish()
    }
}
