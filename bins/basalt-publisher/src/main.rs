use anyhow::{Context, ensure};
use basalt_config::BasaltConfig;
use basalt_events::Heartbeat;
use basalt_occ::{StateMonitor, current_pid};
use std::mem::size_of;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn load_config() -> anyhow::Result<BasaltConfig> {
    match std::env::args().nth(1) {
        Some(path) => BasaltConfig::load(path.clone()).with_context(|| format!("loading {path}")),
        None => Ok(BasaltConfig::default()),
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

    ensure!(
        config.payload_len >= size_of::<Heartbeat>(),
        "payload_len {} cannot hold a {}-byte heartbeat",
        config.payload_len,
        size_of::<Heartbeat>()
    );

    let path = &config.shm_file_path;
    let monitor = StateMonitor::create(path, config.payload_len)
        .with_context(|| format!("creating state monitor at {path}"))?;
    let slot = monitor.slot::<Heartbeat>()?;
    let doorbell = monitor.doorbell();
    let stop = monitor.stop_signal();
    let policy = config.retry_policy();
    let interval = config.publish_interval();
    let pid = current_pid() as u64;

    info!(
        path = %path,
        beats = config.heartbeats,
        interval_us = config.publish_interval_us,
        "publishing heartbeats"
    );

    let mut last = Instant::now();
    let mut count: u64 = 0;

    for seq in 1..=config.heartbeats {
        let published = slot
            .write(Heartbeat::new(seq, now_ns(), pid), &policy)
            .with_context(|| format!("publishing beat {seq}"))?;
        let rung = doorbell.ring(seq as i64);
        debug!(seq, version = published.version(), rung = rung.value(), "beat");
        count += 1;

        if last.elapsed() >= Duration::from_secs(1) {
            info!(rate = count, version = published.version(), "beats/s");
            count = 0;
            last = Instant::now();
        }

        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    stop.request_stop();
    info!(
        version = monitor.counter().current(),
        generation = doorbell.check(),
        "stop requested"
    );
    Ok(())
}
