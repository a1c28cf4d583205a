//! Filesystem layout constants shared by every process in the workspace
//! (spec §6.1). Kept in `tap-types` rather than duplicated in `tapdisk`,
//! `tapctl` and `blktapctrld` since all three need at least one of them.

/// One `blktap<minor>` entry per device; enumerated by glob (spec §6.1).
/// This workspace has no kernel-side blktap driver to populate it, so
/// nothing writes under this path; it is retained as the documented
/// discovery root for tools that expect it to exist.
pub const BLKTAP3_SYSFS_DIR: &str = "/sys/class/blktap3";

/// Per-worker UNIX control sockets live here, named `ctl<pid>`. Re-exported
/// by `tap-ctl-proto` as `CONTROL_DIR`; defined here so non-protocol
/// consumers (e.g. the broker's tap locator) don't need that dependency
/// just for the path.
pub const BLKTAP3_CONTROL_DIR: &str = "/var/run/blktap-control";

/// Touched by workers on out-of-space events (spec §4.3/§7 "ENOSPC ...
/// touches the enospc signal file").
pub const BLKTAP3_ENOSPC_SIGNAL_FILE: &str = "/var/run/tapdisk3-enospc";
