//! Single-word, latest-value-wins signaling between a producer and pollers.
//!
//! A doorbell carries a *state*, not a log: ringing twice before anyone checks
//! leaves only the second value. Producers ring with a release store;
//! consumers poll with an acquire load, so anything the producer wrote before
//! ringing is visible to a consumer that sees the ring.

use crate::atomic::AtomicCell;

/// Doorbell value meaning "keep running".
pub const RUNNING: i64 = 0;
/// Doorbell value a [`StopSignal`] rings to ask consumers to stop.
pub const STOP_REQUESTED: i64 = 1;

/// A doorbell cell. The cell is private: [`ring`](Self::ring) and
/// [`check`](Self::check) are the only ways to touch it, so a release store
/// can only ever pair with an acquire load of the same word.
#[derive(Debug, Clone, Copy)]
pub struct Doorbell<'r> {
    cell: AtomicCell<'r>,
}

/// Proof of a ring: the value a producer stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    value: i64,
}

impl Rung {
    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl<'r> Doorbell<'r> {
    pub fn new(cell: AtomicCell<'r>) -> Self {
        Self { cell }
    }

    /// Release-stores `value`.
    #[inline(always)]
    pub fn ring(&self, value: i64) -> Rung {
        self.cell.store(value);
        Rung { value }
    }

    /// Acquire-loads the current value.
    #[inline(always)]
    pub fn check(&self) -> i64 {
        self.cell.load()
    }

    /// Whether the doorbell still holds `rung`'s value.
    #[inline]
    pub fn has_rung(&self, rung: &Rung) -> bool {
        self.check() == rung.value
    }

    /// Rings the value after the current one.
    ///
    /// Read-then-store, so only a single producer may use it.
    #[inline]
    pub fn next_generation(&self) -> Rung {
        let next = self.check().wrapping_add(1);
        self.ring(next)
    }
}

/// A doorbell used as a stop flag: zero while running, nonzero once stop has
/// been requested.
#[derive(Debug, Clone, Copy)]
pub struct StopSignal<'r> {
    bell: Doorbell<'r>,
}

impl<'r> StopSignal<'r> {
    pub fn new(bell: Doorbell<'r>) -> Self {
        Self { bell }
    }

    pub fn request_stop(&self) -> Rung {
        self.bell.ring(STOP_REQUESTED)
    }

    #[inline(always)]
    pub fn is_stop_requested(&self) -> bool {
        self.bell.check() != RUNNING
    }

    pub fn reset(&self) {
        self.bell.ring(RUNNING);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn latest_ring_wins() {
        let raw = AtomicI64::new(0);
        let bell = Doorbell::new(AtomicCell::from_atomic(&raw));
        bell.ring(1);
        bell.ring(2);
        let last = bell.ring(3);
        assert_eq!(bell.check(), 3);
        assert!(bell.has_rung(&last));
    }

    #[test]
    fn overwritten_rung_is_gone() {
        let raw = AtomicI64::new(0);
        let bell = Doorbell::new(AtomicCell::from_atomic(&raw));
        let first = bell.ring(10);
        bell.ring(11);
        assert!(!bell.has_rung(&first));
        assert_eq!(first.value(), 10);
    }

    #[test]
    fn generations_count_up() {
        let raw = AtomicI64::new(41);
        let bell = Doorbell::new(AtomicCell::from_atomic(&raw));
        assert_eq!(bell.next_generation().value(), 42);
        assert_eq!(bell.next_generation().value(), 43);
        assert_eq!(bell.check(), 43);
    }

    #[test]
    fn stop_signal_round_trip() {
        let raw = AtomicI64::new(0);
        let stop = StopSignal::new(Doorbell::new(AtomicCell::from_atomic(&raw)));
        assert!(!stop.is_stop_requested());
        assert_eq!(stop.request_stop().value(), STOP_REQUESTED);
        assert!(stop.is_stop_requested());
        stop.reset();
        assert!(!stop.is_stop_requested());
    }

    #[test]
    fn any_nonzero_value_means_stop() {
        let raw = AtomicI64::new(-7);
        let stop = StopSignal::new(Doorbell::new(AtomicCell::from_atomic(&raw)));
        assert!(stop.is_stop_requested());
    }
}
