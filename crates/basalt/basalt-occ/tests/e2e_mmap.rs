//! Two-process test of the state monitor.
//!
//! The test binary re-invokes itself with a role in the environment: one
//! child publishes heartbeats through the mapped control block while the
//! other polls the doorbell and validates every read against the version.
//!
//! ```text
//! [publisher] --[create]--[write beat, ring]...[write beat, ring]--[stop]
//!                   |
//!               [mmap file]
//!                   |
//! [watcher]   -----[open]--[check, read, validate]...------------[drain]
//! ```
//!
//! ```bash
//! cargo test -p basalt-occ --test e2e_mmap -- --nocapture
//! ```

use basalt_events::Heartbeat;
use basalt_occ::{RetryPolicy, StateMonitor, current_pid};
use std::env;
use std::io::Write;
use std::mem::size_of;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_PATH: &str = "BASALT_E2E_PATH";
const ROLE_PUBLISHER: &str = "publisher";
const ROLE_WATCHER: &str = "watcher";

const BEATS: u64 = 50_000;
const BATCH: u64 = 1_000;
const BATCH_DELAY_US: u64 = 200;

fn test_path() -> String {
    format!("/tmp/basalt_e2e_monitor_{}", std::process::id())
}

fn run_publisher(path: &str) {
    let monitor =
        StateMonitor::create(path, size_of::<Heartbeat>()).expect("publisher: create failed");
    let slot = monitor.slot::<Heartbeat>().expect("publisher: slot");
    let doorbell = monitor.doorbell();
    let policy = RetryPolicy::unbounded();
    let pid = current_pid() as u64;

    log!("[PUBLISHER] created {path}, publishing {BEATS} beats");
    let start = Instant::now();

    for seq in 1..=BEATS {
        let published = slot
            .write(Heartbeat::new(seq, start.elapsed().as_nanos() as u64, pid), &policy)
            .expect("publisher: write");
        assert_eq!(published.version(), 2 * seq as i64);
        doorbell.ring(seq as i64);

        if seq % BATCH == 0 {
            std::thread::sleep(Duration::from_micros(BATCH_DELAY_US));
        }
    }

    // Give the watcher a chance to attach before the stop flag goes up.
    std::thread::sleep(Duration::from_millis(20));
    monitor.stop_signal().request_stop();
    log!("[PUBLISHER] done in {:?}", start.elapsed());
}

fn run_watcher(path: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let monitor = loop {
        match StateMonitor::open(path) {
            Ok(m) => break m,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("[WATCHER] failed to open {path}: {e}"),
        }
    };
    let slot = monitor.slot::<Heartbeat>().expect("watcher: slot");
    let doorbell = monitor.doorbell();
    let stop = monitor.stop_signal();

    let read_deadline = Instant::now() + Duration::from_secs(30);
    let mut seen_generation = 0i64;
    let mut last_seq = 0u64;
    let mut last_version = 0i64;
    let mut reads = 0u64;

    loop {
        assert!(Instant::now() < read_deadline, "[WATCHER] timed out");
        let stopping = stop.is_stop_requested();
        let generation = doorbell.check();

        if generation != seen_generation {
            let (beat, version) = slot.read_versioned();
            assert!(beat.is_intact(), "torn beat at version {version}: {beat:?}");
            assert!(version % 2 == 0 && version >= last_version);
            assert!(beat.seq >= last_seq, "beat {} after {last_seq}", beat.seq);
            if beat.seq > last_seq {
                reads += 1;
            }
            last_seq = beat.seq;
            last_version = version;
            seen_generation = generation.max(beat.seq as i64);
        } else if stopping {
            break;
        } else {
            std::hint::spin_loop();
        }
    }

    log!("[WATCHER] {reads} reads, last seq {last_seq}, version {last_version}");
    assert!((1..=BEATS).contains(&reads), "{reads} distinct beats read");
    assert_eq!(last_seq, BEATS);
    assert_eq!(monitor.counter().current(), 2 * BEATS as i64);
}

#[test]
fn e2e_two_process_state_monitor() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("BASALT_E2E_PATH not set");
        match role.as_str() {
            ROLE_PUBLISHER => run_publisher(&path),
            ROLE_WATCHER => run_watcher(&path),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let path = test_path();
    let exe = env::current_exe().expect("current exe");
    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_state_monitor")
            .arg("--nocapture")
            .env(ENV_ROLE, role)
            .env(ENV_PATH, &path)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("spawn child")
    };

    let mut publisher = spawn(ROLE_PUBLISHER);
    std::thread::sleep(Duration::from_millis(5));
    let mut watcher = spawn(ROLE_WATCHER);

    let publisher_status = publisher.wait().expect("wait publisher");
    let watcher_status = watcher.wait().expect("wait watcher");
    StateMonitor::unlink(&path).expect("unlink");

    assert!(publisher_status.success(), "publisher failed: {publisher_status}");
    assert!(watcher_status.success(), "watcher failed: {watcher_status}");
}

#[test]
fn open_rejects_a_file_that_is_not_a_monitor() {
    let path = env::temp_dir().join(format!("basalt_not_a_monitor_{}", std::process::id()));
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();

    let err = StateMonitor::open(&path).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    StateMonitor::unlink(&path).unwrap();
    StateMonitor::unlink(&path).unwrap();
}
