//! The configuration-store trait (spec §4.5a, `SPEC_FULL.md` "[ADD 4.5a]
//! Configuration-store trait"): a hierarchical key/value store with
//! path-prefix watches and atomic multi-key transactions (spec §6.3
//! "xenstore"). `blktapctrld`'s discovery loop is built entirely against
//! this trait so the scenario tests (S5 fast-recycle) can drive it with an
//! in-memory fake instead of a running xenstore daemon.
//!
//! No `xs-rs`/xenstore crate is available in this corpus (documented in
//! `DESIGN.md`), so the production backend shells out to the
//! `xenstore-read`/`xenstore-write`/`xenstore-rm`/`xenstore-ls` command
//! line tools that ship with every Xen host. Those tools have no notion of
//! a client-held transaction id spanning separate process invocations, so
//! [`XenstoreCliStore::transaction`] is a best-effort sequential
//! implementation, not a true atomic commit — recorded as an Open Question
//! resolution in `DESIGN.md` rather than silently assumed.

use std::process::Command;

use tap_types::NegErrno;

/// One path/value pair as returned by a directory listing, relative to the
/// path that was listed (spec §6.3 entries are read as plain strings; the
/// broker parses domid/device names/serials out of them itself).
pub trait ConfigStore {
    fn read(&self, path: &str) -> Result<Option<String>, NegErrno>;
    fn write(&self, path: &str, value: &str) -> Result<(), NegErrno>;
    fn rm(&self, path: &str) -> Result<(), NegErrno>;
    /// Immediate child names of `path` (not full paths), spec §6.3's
    /// hierarchy walk (`backend/xenio/<domid>/<name>`).
    fn directory(&self, path: &str) -> Result<Vec<String>, NegErrno>;

    /// Runs `body` as a single configuration-store transaction (spec
    /// §4.5 "all reads/writes triggered by one watch event run inside a
    /// single... transaction"). Retries internally on `EAGAIN` (spec:
    /// "EAGAIN on commit retries the entire handler"); any other error
    /// aborts and propagates.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&dyn ConfigStore) -> Result<(), NegErrno>,
    ) -> Result<(), NegErrno>;
}

/// In-memory store used by every discovery-loop test in this crate. Models
/// the tree purely through `/`-delimited key prefixes: a path "exists" as a
/// directory if some stored key has it as a proper prefix, and "exists" as
/// a value if it has a stored value of its own (both can be true at once,
/// as in real xenstore).
#[derive(Default)]
pub struct FakeConfigStore {
    values: std::cell::RefCell<std::collections::BTreeMap<String, String>>,
    /// Number of subsequent `transaction` calls that should fail with
    /// `EAGAIN` before succeeding, for exercising the retry path.
    eagain_budget: std::cell::Cell<u32>,
}

impl FakeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, value: &str) {
        self.values.borrow_mut().insert(path.to_string(), value.to_string());
    }

    pub fn remove_subtree(&self, prefix: &str) {
        self.values.borrow_mut().retain(|k, _| k != prefix && !k.starts_with(&format!("{prefix}/")));
    }

    pub fn inject_eagain(&self, times: u32) {
        self.eagain_budget.set(times);
    }
}

impl ConfigStore for FakeConfigStore {
    fn read(&self, path: &str) -> Result<Option<String>, NegErrno> {
        Ok(self.values.borrow().get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<(), NegErrno> {
        self.values.borrow_mut().insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn rm(&self, path: &str) -> Result<(), NegErrno> {
        self.remove_subtree(path);
        Ok(())
    }

    fn directory(&self, path: &str) -> Result<Vec<String>, NegErrno> {
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
        let mut children = std::collections::BTreeSet::new();
        for key in self.values.borrow().keys() {
            let Some(rest) = key.strip_prefix(&prefix) else { continue };
            if rest.is_empty() {
                continue;
            }
            let child = rest.split('/').next().unwrap();
            children.insert(child.to_string());
        }
        Ok(children.into_iter().collect())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&dyn ConfigStore) -> Result<(), NegErrno>,
    ) -> Result<(), NegErrno> {
        loop {
            if self.eagain_budget.get() > 0 {
                self.eagain_budget.set(self.eagain_budget.get() - 1);
                continue;
            }
            return body(self);
        }
    }
}

/// Shells out to the `xenstore-*` command-line tools (spec §6.3). Each
/// call is its own process invocation; see the module doc for why
/// [`transaction`](ConfigStore::transaction) here is sequential rather
/// than atomic.
pub struct XenstoreCliStore;

impl XenstoreCliStore {
    fn run(cmd: &str, args: &[&str]) -> Result<String, NegErrno> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .map_err(|_| NegErrno::from_errno(libc::ENOENT))?;
        if !output.status.success() {
            return Err(NegErrno::from_errno(libc::ESRCH));
        }
        String::from_utf8(output.stdout)
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|_| NegErrno::from_errno(libc::EINVAL))
    }
}

impl ConfigStore for XenstoreCliStore {
    fn read(&self, path: &str) -> Result<Option<String>, NegErrno> {
        match Self::run("xenstore-read", &[path]) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e == NegErrno::from_errno(libc::ESRCH) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &str, value: &str) -> Result<(), NegErrno> {
        Self::run("xenstore-write", &[path, value]).map(|_| ())
    }

    fn rm(&self, path: &str) -> Result<(), NegErrno> {
        match Self::run("xenstore-rm", &[path]) {
            Ok(_) => Ok(()),
            Err(e) if e == NegErrno::from_errno(libc::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn directory(&self, path: &str) -> Result<Vec<String>, NegErrno> {
        match Self::run("xenstore-ls", &[path]) {
            Ok(s) if s.is_empty() => Ok(Vec::new()),
            Ok(s) => Ok(s
                .lines()
                // `xenstore-ls` prints "<name> = <value>" for leaves with a
                // value and bare "<name>" for pure directories.
                .map(|line| line.split(" = ").next().unwrap_or(line).trim().to_string())
                .collect()),
            Err(e) if e == NegErrno::from_errno(libc::ESRCH) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&dyn ConfigStore) -> Result<(), NegErrno>,
    ) -> Result<(), NegErrno> {
        // No client-held cross-process transaction id is available through
        // the CLI tools; run the handler once, sequentially, against live
        // state. An `EAGAIN` from any individual call still triggers a
        // whole-handler retry per spec §4.5.
        loop {
            match body(self) {
                Err(e) if e.get() == -libc::EAGAIN => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_lists_immediate_children_only() {
        let s = FakeConfigStore::new();
        s.set("backend/xenio/3/51712/frontend", "/local/domain/3/device/vbd/51712");
        s.set("backend/xenio/3/51712/xenio-serial", "1");
        s.set("backend/xenio/3/51713/frontend", "/local/domain/3/device/vbd/51713");

        let domids = s.directory("backend/xenio").unwrap();
        assert_eq!(domids, vec!["3".to_string()]);

        let names = s.directory("backend/xenio/3").unwrap();
        assert_eq!(names, vec!["51712".to_string(), "51713".to_string()]);
    }

    #[test]
    fn remove_subtree_drops_value_and_descendants() {
        let s = FakeConfigStore::new();
        s.set("backend/xenio/3/51712/frontend", "x");
        s.set("backend/xenio/3/51712/xenio-serial", "1");
        s.rm("backend/xenio/3/51712").unwrap();
        assert_eq!(s.directory("backend/xenio/3").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn transaction_retries_on_injected_eagain() {
        let s = FakeConfigStore::new();
        s.inject_eagain(2);
        let mut calls = 0;
        s.transaction(&mut |_store| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 1);
    }
}
