mod follow;

use anyhow::Context;
use basalt_config::BasaltConfig;
use basalt_events::Heartbeat;
use basalt_occ::StateMonitor;
use follow::Follower;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<BasaltConfig> {
    match std::env::args().nth(1) {
        Some(path) => BasaltConfig::load(path.clone()).with_context(|| format!("loading {path}")),
        None => Ok(BasaltConfig::default()),
    }
}

/// Waits for a publisher to create and seal the monitor file.
fn open_monitor(config: &BasaltConfig) -> anyhow::Result<StateMonitor> {
    let deadline = Instant::now() + config.spin_timeout();
    loop {
        match StateMonitor::open(&config.shm_file_path) {
            Ok(monitor) => return Ok(monitor),
            Err(e) if Instant::now() < deadline => {
                debug!(error = %e, "monitor not ready");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", config.shm_file_path));
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let monitor = open_monitor(&config)?;
    let slot = monitor.slot::<Heartbeat>()?;
    let doorbell = monitor.doorbell();
    let stop = monitor.stop_signal();
    info!(path = %monitor.path().display(), "watching");

    let mut follower = Follower::default();
    let mut last_report = Instant::now();

    loop {
        // Check stop before the doorbell so the final beat is still read.
        let stopping = stop.is_stop_requested();
        let generation = doorbell.check();

        if follower.needs_read(generation) {
            let (beat, version) = slot.read_versioned();
            follower.record(generation, &beat, version)?;
        } else if stopping {
            break;
        } else {
            std::hint::spin_loop();
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            info!(
                beats_read = follower.beats_read,
                skipped = follower.skipped,
                last_seq = follower.last_seq,
                "progress"
            );
            last_report = Instant::now();
        }
    }

    if follower.beats_read == 0 {
        warn!("stop requested before any beat was seen");
    }
    info!(
        beats_read = follower.beats_read,
        skipped = follower.skipped,
        last_seq = follower.last_seq,
        version = monitor.counter().current(),
        "publisher stopped"
    );
    Ok(())
}
