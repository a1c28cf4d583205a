//! Locating the tap worker serving a given device (spec §4.5 "locate the
//! serving tap via the control protocol (§4.4 list)").
//!
//! Each worker serves exactly one VBD and is attached with `devnum` set to
//! the device's numeric name (see `tapctl attach -m <minor>`, and
//! `tapdisk`'s `MsgType::Attach` handler, which stores it verbatim as the
//! worker's minor). The broker exploits that one-to-one mapping: it globs
//! the control directory for live `ctl<pid>` sockets and asks each one,
//! via `LIST`, which minor it is currently serving.

use std::path::PathBuf;

use tap_ctl_proto::{Frame, ListPayload, MsgType};

pub trait TapLocator {
    /// Returns the pid of the worker currently serving `devid`, if any.
    fn locate(&self, devid: u32) -> Option<i32>;
}

/// Scans `control_dir` for `ctl<pid>` sockets and queries each with a
/// `LIST` call. O(workers) per lookup; acceptable since device discovery
/// is an infrequent, not hot-path, operation (spec §4.5 runs once per
/// configuration-store watch event).
pub struct CliTapLocator {
    pub control_dir: PathBuf,
}

impl CliTapLocator {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        CliTapLocator { control_dir: control_dir.into() }
    }

    fn candidate_pids(&self) -> Vec<i32> {
        let Ok(entries) = std::fs::read_dir(&self.control_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_prefix("ctl")?.parse::<i32>().ok()
            })
            .collect()
    }
}

impl TapLocator for CliTapLocator {
    fn locate(&self, devid: u32) -> Option<i32> {
        for pid in self.candidate_pids() {
            let req = Frame::new(MsgType::List, 0);
            let Ok(resp) = tap_ctl_proto::call_typed(&self.control_dir, pid, &req, None) else {
                continue;
            };
            if resp.msg_type().ok() != Some(MsgType::ListRsp) {
                continue;
            }
            let payload: ListPayload = resp.payload_as();
            if payload.minor >= 0 && payload.minor as u32 == devid {
                return Some(pid);
            }
        }
        None
    }
}

/// In-memory locator for tests: a fixed `devid -> pid` mapping the test
/// sets up directly instead of spawning real worker processes.
#[derive(Default)]
pub struct FakeTapLocator {
    map: std::cell::RefCell<std::collections::HashMap<u32, i32>>,
}

impl FakeTapLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, devid: u32, pid: i32) {
        self.map.borrow_mut().insert(devid, pid);
    }
}

impl TapLocator for FakeTapLocator {
    fn locate(&self, devid: u32) -> Option<i32> {
        self.map.borrow().get(&devid).copied()
    }
}
