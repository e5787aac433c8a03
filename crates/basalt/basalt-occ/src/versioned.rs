//! Version-based optimistic concurrency over a [`ControlBlock`].
//!
//! The `version` field doubles as a sequence lock. Its parity says whether the
//! payload is stable:
//!
//! - **Even**: no write in progress, the payload is consistent
//! - **Odd**: a writer has claimed the payload and may be halfway through it
//!
//! Every transition is one compare-and-swap `v -> v + 1`, so after K successful
//! transitions starting from `v0` the version is exactly `v0 + K`, and a
//! version a reader observes was always put there by a successful CAS.
//!
//! # Protocol
//!
//! **Writer:**
//! 1. Load version `v0`; if odd, someone else is writing, retry
//! 2. CAS `v0 -> v0 + 1` to claim; on failure another writer won, retry
//! 3. Mutate the payload
//! 4. CAS `v0 + 1 -> v0 + 2` to publish
//!
//! **Reader:**
//! 1. Load version `v1`
//! 2. Copy the payload
//! 3. Load version `v2`
//! 4. Consistent iff `v1 == v2` and `v1` is even; otherwise retry
//!
//! [`VersionCounter`] is the version word on its own: single CAS steps and
//! the read side. [`VersionedBlock`] binds the counter to the payload it
//! guards and is the only way to get a [`WriteSession`], so a session can
//! only ever write its own payload.
//!
//! Neither side ever blocks. Contention is reported as `None`/`false`; only the
//! bounded drivers ([`VersionedBlock::write`], [`VersionCounter::read_bounded`])
//! turn an exhausted budget into a value the caller must handle.

use crate::control_block::{ControlBlock, current_pid};
use crate::region::{Payload, Plain, RegionError};
use crate::retry::RetryPolicy;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;
use tracing::{debug, error, warn};

#[inline(always)]
pub fn is_write_in_progress(version: i64) -> bool {
    version & 1 != 0
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The claimed odd version was changed underneath the writer. Someone
    /// broke the single-writer discipline.
    #[error("version moved while publishing: expected {expected}, found {found}")]
    VersionConflict { expected: i64, found: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("write contended: gave up after {attempts} attempts in {waited:?}")]
    Contended { attempts: u32, waited: Duration },

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Proof that a write became visible: the even version it published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    version: i64,
}

impl Published {
    #[inline]
    pub fn version(&self) -> i64 {
        self.version
    }
}

/// The version word of one control block.
#[derive(Debug, Clone, Copy)]
pub struct VersionCounter<'r> {
    block: &'r ControlBlock,
}

impl<'r> VersionCounter<'r> {
    pub fn new(block: &'r ControlBlock) -> Self {
        Self { block }
    }

    pub fn control_block(&self) -> &'r ControlBlock {
        self.block
    }

    /// Acquire-loads the version.
    #[inline(always)]
    pub fn current(&self) -> i64 {
        self.block.version().load()
    }

    /// One optimistic step: CAS `observed -> observed + 1`.
    ///
    /// `false` means another participant moved the version since `observed`
    /// was read; reload and retry.
    #[inline(always)]
    pub fn try_advance(&self, observed: i64) -> bool {
        self.block
            .version()
            .compare_and_swap(observed, observed.wrapping_add(1))
    }

    /// Starts a read: records the version seen before touching the payload.
    #[inline(always)]
    pub fn begin_read(&self) -> ReadTicket<'r> {
        ReadTicket {
            block: self.block,
            observed: self.current(),
        }
    }

    /// One read attempt. `None` if a write overlapped it.
    #[inline]
    pub fn try_read<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let ticket = self.begin_read();
        if ticket.is_write_in_progress() {
            return None;
        }
        let value = f();
        ticket.validate().then_some(value)
    }

    /// Reads until a consistent value comes back, spinning while writes are
    /// in progress.
    #[inline]
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> T {
        loop {
            if let Some(v) = self.try_read(&mut f) {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// Like [`read`](Self::read) but gives up after `max_attempts`.
    pub fn read_bounded<T>(&self, mut f: impl FnMut() -> T, max_attempts: u32) -> Option<T> {
        for _ in 0..max_attempts {
            if let Some(v) = self.try_read(&mut f) {
                return Some(v);
            }
            std::hint::spin_loop();
        }
        None
    }
}

/// A control block together with the payload it guards.
#[derive(Debug, Clone, Copy)]
pub struct VersionedBlock<'r> {
    counter: VersionCounter<'r>,
    payload: Payload<'r>,
}

impl<'r> VersionedBlock<'r> {
    /// # Safety
    /// While the result is in use, `payload` must be written only through
    /// sessions of `block`, and must not overlap `block` or any other atomic
    /// word in use.
    pub unsafe fn new(block: &'r ControlBlock, payload: Payload<'r>) -> Self {
        Self {
            counter: VersionCounter::new(block),
            payload,
        }
    }

    pub fn counter(&self) -> VersionCounter<'r> {
        self.counter
    }

    pub fn control_block(&self) -> &'r ControlBlock {
        self.counter.block
    }

    /// The guarded bytes, for reading.
    pub fn payload(&self) -> Payload<'r> {
        self.payload
    }

    #[inline(always)]
    pub fn current(&self) -> i64 {
        self.counter.current()
    }

    /// Single attempt to claim the payload for writing.
    ///
    /// Returns `None` if a write is already in progress or another writer
    /// claimed the current version first. On success the version is odd and
    /// `writer_pid` names this process.
    pub fn try_begin_write(&self) -> Option<WriteSession<'r>> {
        let v0 = self.current();
        if is_write_in_progress(v0) {
            return None;
        }
        if !self.counter.try_advance(v0) {
            return None;
        }
        let block = self.counter.block;
        block.writer_pid().store(current_pid());
        Some(WriteSession {
            block,
            payload: self.payload,
            claimed: v0.wrapping_add(1),
            finished: false,
        })
    }

    /// Spins on [`try_begin_write`](Self::try_begin_write) within `policy`.
    pub fn begin_write(&self, policy: &RetryPolicy) -> Result<WriteSession<'r>, WriteError> {
        let mut backoff = policy.start();
        loop {
            if let Some(session) = self.try_begin_write() {
                return Ok(session);
            }
            if !backoff.snooze() {
                debug!(
                    attempts = backoff.attempts(),
                    version = self.current(),
                    "giving up on write claim"
                );
                return Err(WriteError::Contended {
                    attempts: backoff.attempts(),
                    waited: backoff.elapsed(),
                });
            }
        }
    }

    /// Claims, runs `f` with the session, then publishes.
    ///
    /// If `f` panics the session is abandoned; see [`WriteSession`].
    pub fn write<T, F>(&self, policy: &RetryPolicy, f: F) -> Result<(T, Published), WriteError>
    where
        F: FnOnce(&WriteSession<'r>) -> T,
    {
        let session = self.begin_write(policy)?;
        let out = f(&session);
        let published = session.publish()?;
        Ok((out, published))
    }

    /// One read attempt over the payload. `None` if a write overlapped it.
    #[inline]
    pub fn try_read<T>(&self, f: impl FnOnce(&Payload<'r>) -> T) -> Option<T> {
        self.counter.try_read(|| f(&self.payload))
    }

    /// Reads the payload until a consistent value comes back.
    #[inline]
    pub fn read<T>(&self, mut f: impl FnMut(&Payload<'r>) -> T) -> T {
        self.counter.read(|| f(&self.payload))
    }
}

/// The version a reader saw before copying the payload.
#[derive(Debug, Clone, Copy)]
pub struct ReadTicket<'r> {
    block: &'r ControlBlock,
    observed: i64,
}

impl ReadTicket<'_> {
    #[inline]
    pub fn observed(&self) -> i64 {
        self.observed
    }

    #[inline]
    pub fn is_write_in_progress(&self) -> bool {
        is_write_in_progress(self.observed)
    }

    /// Whether everything read since the ticket was taken is consistent.
    #[inline(always)]
    pub fn validate(&self) -> bool {
        // Keeps the payload copy from sinking below the version re-load.
        fence(Ordering::Acquire);
        let now = self.block.version().load();
        now == self.observed && !is_write_in_progress(now)
    }
}

/// A claimed write. While it exists the version is odd and this writer owns
/// the guarded payload.
///
/// Dropping a session without [`publish`](Self::publish), for instance
/// because the closure given to [`VersionedBlock::write`] panicked, still
/// moves the version to the next even value so other writers are not locked
/// out. Reads that overlapped the session are rejected. A read that starts
/// after the drop validates, and sees whatever the session had written by
/// then, which may be only part of an update. Writers that cannot leave a
/// partial update behind must not unwind out of a session.
#[must_use = "dropping a session publishes whatever was written so far"]
pub struct WriteSession<'r> {
    block: &'r ControlBlock,
    payload: Payload<'r>,
    claimed: i64,
    finished: bool,
}

impl<'r> WriteSession<'r> {
    /// The odd version this session holds.
    #[inline]
    pub fn version(&self) -> i64 {
        self.claimed
    }

    /// The guarded bytes, for read-modify-write.
    #[inline]
    pub fn payload(&self) -> Payload<'r> {
        self.payload
    }

    /// Copies `bytes` into the payload at `at`.
    ///
    /// # Panics
    /// Panics if the range is outside the payload.
    #[inline]
    pub fn write_bytes(&self, at: usize, bytes: &[u8]) {
        // SAFETY: the odd version excludes every other writer of this payload.
        unsafe { self.payload.write_bytes(at, bytes) }
    }

    /// Stores `value` into the payload at `at`.
    ///
    /// # Panics
    /// Panics if the range is outside the payload.
    #[inline]
    pub fn write_value<T: Plain>(&self, at: usize, value: T) {
        // SAFETY: the odd version excludes every other writer of this payload.
        unsafe { self.payload.write_value(at, value) }
    }

    /// Makes the write visible: CAS the claimed odd version to the next even.
    pub fn publish(mut self) -> Result<Published, PublishError> {
        self.finished = true;
        self.finish()
    }

    fn finish(&self) -> Result<Published, PublishError> {
        let next = self.claimed.wrapping_add(1);
        match self.block.version().compare_exchange(self.claimed, next) {
            Ok(_) => Ok(Published { version: next }),
            Err(found) => {
                error!(
                    expected = self.claimed,
                    found, "version conflict on publish, single-writer discipline broken"
                );
                Err(PublishError::VersionConflict {
                    expected: self.claimed,
                    found,
                })
            }
        }
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(version = self.claimed, "write session dropped without publish");
            let _ = self.finish();
        }
    }
}

impl std::fmt::Debug for WriteSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("claimed", &self.claimed)
            .field("finished", &self.finished)
            .finish()
    }
}

/// A `T` guarded by a control block.
///
/// The typed counterpart of the raw protocol: `write` runs a full session,
/// `read` copies the value out under the read protocol.
#[derive(Debug, Clone, Copy)]
pub struct VersionedSlot<'r, T: Plain> {
    versioned: VersionedBlock<'r>,
    _pd: PhantomData<T>,
}

impl<'r, T: Plain> VersionedSlot<'r, T> {
    pub fn new(versioned: VersionedBlock<'r>) -> Result<Self, RegionError> {
        let available = versioned.payload.len();
        if available < size_of::<T>() {
            return Err(RegionError::PayloadTooSmall {
                needed: size_of::<T>(),
                available,
            });
        }
        Ok(Self {
            versioned,
            _pd: PhantomData,
        })
    }

    pub fn versioned(&self) -> VersionedBlock<'r> {
        self.versioned
    }

    pub fn write(&self, value: T, policy: &RetryPolicy) -> Result<Published, WriteError> {
        let ((), published) = self
            .versioned
            .write(policy, |session| session.write_value(0, value))?;
        Ok(published)
    }

    #[inline]
    pub fn try_read(&self) -> Option<T> {
        self.versioned.try_read(|p| p.read_value::<T>(0))
    }

    #[inline]
    pub fn read(&self) -> T {
        self.versioned.read(|p| p.read_value::<T>(0))
    }

    /// Reads the value together with the even version it was published under.
    pub fn read_versioned(&self) -> (T, i64) {
        let counter = self.versioned.counter;
        loop {
            let ticket = counter.begin_read();
            if !ticket.is_write_in_progress() {
                let value = self.versioned.payload.read_value::<T>(0);
                if ticket.validate() {
                    return (value, ticket.observed());
                }
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    /// Block at 0 guarding 64 payload bytes at 64.
    fn guarded(heap: &HeapRegion) -> VersionedBlock<'_> {
        // SAFETY: each test owns its region and writes the payload only
        // through this block.
        unsafe { heap.region().versioned(0, 64, 64) }.unwrap()
    }

    #[test]
    fn session_moves_version_by_two() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);

        let session = v.try_begin_write().expect("uncontended claim");
        assert_eq!(session.version(), 1);
        assert!(is_write_in_progress(v.current()));
        assert_eq!(v.control_block().writer_pid().load(), current_pid());

        let published = session.publish().unwrap();
        assert_eq!(published.version(), 2);
        assert_eq!(v.current(), 2);
    }

    #[test]
    fn second_claim_fails_while_writing() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        let first = v.try_begin_write().unwrap();
        assert!(v.try_begin_write().is_none());
        first.publish().unwrap();
        assert!(v.try_begin_write().is_some());
    }

    #[test]
    fn dropped_session_leaves_even_version() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        {
            let _session = v.try_begin_write().unwrap();
        }
        assert_eq!(v.current(), 2);
        assert!(!is_write_in_progress(v.current()));
    }

    #[test]
    fn session_writes_only_its_own_payload() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        let session = v.try_begin_write().unwrap();
        session.write_value(8, 0xABu64);
        session.write_bytes(0, b"beat");
        assert_eq!(session.payload().read_value::<u64>(8), 0xAB);
        session.publish().unwrap();

        let mut head = [0u8; 4];
        v.read(|p| p.read_bytes(0, &mut head));
        assert_eq!(&head, b"beat");
        assert_eq!(heap.region().payload(72, 8).unwrap().read_value::<u64>(0), 0xAB);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn session_write_past_payload_panics() {
        let heap = HeapRegion::new_zeroed(256);
        // SAFETY: the test owns the region.
        let v = unsafe { heap.region().versioned(0, 64, 16) }.unwrap();
        let session = v.try_begin_write().unwrap();
        session.write_value(16, 1u64);
    }

    #[test]
    fn tampered_version_is_a_conflict() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        let session = v.try_begin_write().unwrap();
        v.control_block().version().store(9);
        assert_eq!(
            session.publish(),
            Err(PublishError::VersionConflict {
                expected: 1,
                found: 9
            })
        );
    }

    #[test]
    fn read_ticket_detects_write() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);

        let ticket = v.counter().begin_read();
        assert!(ticket.validate());

        v.try_begin_write().unwrap().publish().unwrap();
        assert!(!ticket.validate());
    }

    #[test]
    fn try_read_refuses_odd_version() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        let counter = v.counter();
        let session = v.try_begin_write().unwrap();
        assert_eq!(counter.try_read(|| 1), None);
        assert_eq!(counter.read_bounded(|| 1, 16), None);
        session.publish().unwrap();
        assert_eq!(counter.try_read(|| 1), Some(1));
    }

    #[test]
    fn begin_write_gives_up_when_held() {
        let heap = HeapRegion::new_zeroed(128);
        let v = guarded(&heap);
        let _held = v.try_begin_write().unwrap();
        let err = v.begin_write(&RetryPolicy::attempts(5)).unwrap_err();
        assert!(matches!(err, WriteError::Contended { attempts: 5, .. }));
    }

    #[test]
    fn try_advance_is_single_step() {
        let block = ControlBlock::new();
        let counter = VersionCounter::new(&block);
        assert!(counter.try_advance(0));
        assert!(!counter.try_advance(0));
        assert!(counter.try_advance(1));
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn slot_round_trip() {
        let heap = HeapRegion::new_zeroed(128);
        // SAFETY: the test owns the region.
        let slot = unsafe { heap.region().slot::<[u32; 3]>(0, 64) }.unwrap();
        let published = slot.write([7, 99, 3], &RetryPolicy::unbounded()).unwrap();
        assert_eq!(published.version(), 2);
        assert_eq!(slot.read(), [7, 99, 3]);
        assert_eq!(slot.read_versioned(), ([7, 99, 3], 2));
    }

    #[test]
    fn slot_rejects_small_payload() {
        let heap = HeapRegion::new_zeroed(128);
        // SAFETY: the test owns the region.
        let v = unsafe { heap.region().versioned(0, 64, 4) }.unwrap();
        let err = VersionedSlot::<u64>::new(v).unwrap_err();
        assert_eq!(
            err,
            RegionError::PayloadTooSmall {
                needed: 8,
                available: 4
            }
        );
    }
}
