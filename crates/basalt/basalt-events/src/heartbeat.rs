// Payload the publisher writes into the monitor on every beat.
// POD, fixed-size, one cache line. The check word and the trailing copies of
// `seq` let a watcher tell a consistent read from one stitched together out of
// two different beats.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct Heartbeat {
    pub seq: u64,
    pub ts_ns: u64,
    pub pid: u64,
    pub check: u64,
    pub trail: [u64; 4],
}

impl Heartbeat {
    pub fn new(seq: u64, ts_ns: u64, pid: u64) -> Self {
        Self {
            seq,
            ts_ns,
            pid,
            check: Self::checksum(seq, ts_ns, pid),
            trail: [seq; 4],
        }
    }

    #[inline]
    fn checksum(seq: u64, ts_ns: u64, pid: u64) -> u64 {
        seq.wrapping_mul(MIX) ^ ts_ns.rotate_left(17) ^ pid
    }

    /// Whether every field belongs to the same beat.
    #[inline]
    pub fn is_intact(&self) -> bool {
        self.check == Self::checksum(self.seq, self.ts_ns, self.pid)
            && self.trail.iter().all(|&s| s == self.seq)
    }
}
