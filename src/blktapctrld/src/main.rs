//! The broker process (spec §4.5, §2 component H). Wires the pure
//! [`blktapctrld::Broker`] discovery logic to a real xenstore backend and a
//! real scheduler loop. Kept deliberately thin: almost everything
//! observable is already covered by `broker.rs`'s own tests against
//! [`blktapctrld::FakeConfigStore`].
//!
//! Xenstore has no Rust binding in this corpus (`DESIGN.md`), so watches
//! are implemented by spawning `xenstore-watch <path>` child processes and
//! registering their stdout with the scheduler as a readable fd (spec
//! §4.5 "one watch on ... backend/xenio and one watch per known device");
//! each line that tool prints is one fired watch for that path. If the
//! binary isn't on `$PATH` (e.g. running off a real Xen host), the broker
//! falls back to the periodic rescan timer alone and logs a warning.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;

use blktapctrld::{Broker, CliTapLocator, DeviceEvent, DeviceKey, XenstoreCliStore, BACKEND_ROOT};

#[derive(Parser)]
#[command(about = "blktap3-style configuration-store discovery broker")]
struct Cli {
    #[arg(long, default_value = tap_types::paths::BLKTAP3_CONTROL_DIR)]
    control_dir: PathBuf,

    /// Fallback full-rescan interval; bounds staleness if a watch process
    /// dies or `xenstore-watch` isn't available at all.
    #[arg(long, default_value_t = 5000)]
    rescan_interval_ms: u64,
}

/// A spawned `xenstore-watch <path>` process, line-buffered by hand since
/// the scheduler wants a raw pollable fd rather than an owned `BufReader`.
struct WatchProcess {
    child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

impl WatchProcess {
    fn spawn(path: &str) -> std::io::Result<Self> {
        let mut child = Command::new("xenstore-watch")
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().expect("piped");
        let fd = stdout.as_raw_fd();
        set_nonblocking(fd);
        Ok(WatchProcess { child, stdout, buf: Vec::new() })
    }

    fn fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// Drains whatever is currently available and returns each complete
    /// line (one per fired watch).
    fn drain_lines(&mut self) -> Vec<String> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

impl Drop for WatchProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

type RealBroker = Broker<XenstoreCliStore, CliTapLocator>;

/// Per-device frontend-state watches, keyed the same way the broker keys
/// its devices. Entries are added and removed in lockstep with
/// [`DeviceEvent`]s drained from the broker after each discovery pass.
type FrontendWatches = HashMap<DeviceKey, Rc<RefCell<WatchProcess>>>;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.control_dir)?;

    let store = XenstoreCliStore;
    let locator = CliTapLocator::new(cli.control_dir.clone());
    let broker = Rc::new(RefCell::new(Broker::new(store, locator, cli.control_dir.clone())));
    let frontend_watches: Rc<RefCell<FrontendWatches>> = Rc::new(RefCell::new(HashMap::new()));

    let mut sched = tap_sched::Scheduler::new()?;

    match WatchProcess::spawn(BACKEND_ROOT) {
        Ok(watch) => register_backend_watch(&mut sched, broker.clone(), frontend_watches.clone(), watch),
        Err(e) => {
            tracing::warn!(error = %e, "xenstore-watch unavailable, relying on periodic rescan only");
        }
    }

    // Initial population, then periodic fallback rescan (spec §4.5's
    // event-driven discovery is primary; this bounds staleness if a watch
    // is missed or unavailable).
    if let Err(e) = broker.borrow_mut().rescan_backend() {
        tracing::warn!(errno = %e, "initial rescan failed");
    }
    apply_device_events(&mut sched, &broker, &frontend_watches);
    reschedule_rescan(&mut sched, broker.clone(), frontend_watches.clone(), Duration::from_millis(cli.rescan_interval_ms));

    sched.run_until(|| false)?;
    Ok(())
}

/// Drains whatever [`DeviceEvent`]s the last discovery pass produced and
/// brings `frontend_watches` in sync: one `xenstore-watch` child per known
/// device (spec §4.5 "one watch per known device"), torn down when the
/// device disappears.
fn apply_device_events(
    sched: &mut tap_sched::Scheduler,
    broker: &Rc<RefCell<RealBroker>>,
    frontend_watches: &Rc<RefCell<FrontendWatches>>,
) {
    let events = broker.borrow_mut().drain_events();
    for event in events {
        match event {
            DeviceEvent::Created { key, frontend_state_path } => {
                if frontend_state_path.is_empty() {
                    continue;
                }
                match WatchProcess::spawn(&frontend_state_path) {
                    Ok(watch) => {
                        register_frontend_watch(sched, broker.clone(), frontend_watches.clone(), key, watch);
                    }
                    Err(e) => {
                        tracing::warn!(path = %frontend_state_path, error = %e, "could not watch frontend state");
                    }
                }
            }
            DeviceEvent::Removed { key } => {
                frontend_watches.borrow_mut().remove(&key);
            }
        }
    }
}

fn register_backend_watch(
    sched: &mut tap_sched::Scheduler,
    broker: Rc<RefCell<RealBroker>>,
    frontend_watches: Rc<RefCell<FrontendWatches>>,
    watch: WatchProcess,
) {
    let watch = Rc::new(RefCell::new(watch));
    let fd = watch.borrow().fd();
    let _ = sched.register_read_fd(fd, move |sched_inner| {
        let lines = watch.borrow_mut().drain_lines();
        for path in lines {
            if let Err(e) = broker.borrow_mut().handle_backend_event(&path) {
                tracing::warn!(path, errno = %e, "backend-path event handling failed");
            }
        }
        apply_device_events(sched_inner, &broker, &frontend_watches);
    });
}

fn register_frontend_watch(
    sched: &mut tap_sched::Scheduler,
    broker: Rc<RefCell<RealBroker>>,
    frontend_watches: Rc<RefCell<FrontendWatches>>,
    key: DeviceKey,
    watch: WatchProcess,
) {
    let watch = Rc::new(RefCell::new(watch));
    let fd = watch.borrow().fd();
    frontend_watches.borrow_mut().insert(key.clone(), watch.clone());
    let _ = sched.register_read_fd(fd, move |_sched| {
        // A fired watch only tells us the path changed, not its new value;
        // re-read it from the store before driving the transition table.
        let fired = !watch.borrow_mut().drain_lines().is_empty();
        if fired {
            if let Err(e) = broker.borrow_mut().poll_frontend_state(&key) {
                tracing::warn!(errno = %e, "frontend-state event handling failed");
            }
        }
    });
}

fn reschedule_rescan(
    sched: &mut tap_sched::Scheduler,
    broker: Rc<RefCell<RealBroker>>,
    frontend_watches: Rc<RefCell<FrontendWatches>>,
    interval: Duration,
) {
    sched.register_timeout(interval, move |sched_inner| {
        if let Err(e) = broker.borrow_mut().rescan_backend() {
            tracing::warn!(errno = %e, "periodic rescan failed");
        }
        apply_device_events(sched_inner, &broker, &frontend_watches);
        let (next_broker, next_watches) = (broker.clone(), frontend_watches.clone());
        reschedule_rescan(sched_inner, next_broker, next_watches, interval);
    });
}
