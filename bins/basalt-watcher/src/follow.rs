use anyhow::bail;
use basalt_events::Heartbeat;

/// What the watcher has seen of the publisher so far.
#[derive(Debug, Default)]
pub struct Follower {
    seen_generation: i64,
    pub last_seq: u64,
    pub beats_read: u64,
    pub skipped: u64,
}

impl Follower {
    /// Whether the doorbell moved past everything already read.
    pub fn needs_read(&self, generation: i64) -> bool {
        generation != self.seen_generation
    }

    /// Accounts for a validated read taken after `generation` was checked.
    ///
    /// The beat may be newer than the doorbell value (its ring had not landed
    /// yet), so the beat's own sequence is remembered too and its ring does
    /// not trigger a second read.
    pub fn record(
        &mut self,
        generation: i64,
        beat: &Heartbeat,
        version: i64,
    ) -> anyhow::Result<()> {
        if !beat.is_intact() {
            bail!("torn heartbeat at version {version}: {beat:?}");
        }
        if beat.seq < self.last_seq {
            bail!("heartbeat went backwards: {} after {}", beat.seq, self.last_seq);
        }
        self.seen_generation = generation.max(beat.seq as i64);
        if beat.seq > self.last_seq {
            self.skipped += beat.seq - self.last_seq - 1;
            self.last_seq = beat.seq;
            self.beats_read += 1;
        }
        Ok(())
    }
}
