//! Component F: the image-chain contract the engine drives. No concrete
//! on-disk format is implemented here (spec §1 Non-goals); `NullImage` and
//! `MemImage` below are test doubles used by the engine's own unit tests
//! and by scenario tests S1-S6.

use tap_types::NegErrno;

use crate::request::VbdRequest;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueueOutcome {
    /// Accepted; will complete asynchronously through the request's
    /// callback, or the image chain is itself synchronous and has already
    /// completed it inline (see `VbdRequest` completion contract in
    /// `engine.rs`).
    Accepted,
    /// Rejected with a transient error; the engine will retry per its
    /// backoff policy (spec §4.3).
    RetryableError(NegErrno),
    /// Rejected fatally; the engine completes the request immediately.
    FatalError(NegErrno),
}

/// One leaf of the VBD's image chain (spec §3 "ordered chain of image
/// handles", §4.1 non-goal excludes concrete formats).
pub trait ImageLeaf: Send {
    fn open(&mut self) -> Result<(), NegErrno>;
    fn close(&mut self) -> Result<(), NegErrno>;

    /// Submits one request.
    ///
    /// On `Accepted` via synchronous completion, this call itself invokes
    /// `req.callback`. On `RetryableError`/`FatalError`, it must NOT
    /// invoke the callback — retry scheduling and failover live in the
    /// engine (spec §9 "keep retry schedule in the engine, not in the
    /// image chain"), and the engine alone decides whether and when that
    /// request's callback finally fires, preserving "invoked exactly
    /// once" (spec §8) even when a write is retried against a promoted
    /// secondary.
    fn queue(&mut self, req: &mut VbdRequest) -> QueueOutcome;

    /// Drains any requests this leaf is still holding. Returns `true` once
    /// nothing remains in flight.
    fn drain(&mut self) -> bool;
}

/// Accepts everything and completes synchronously with success. Useful
/// for exercising queue/state-machine behavior in isolation.
#[derive(Default)]
pub struct NullImage;

impl ImageLeaf for NullImage {
    fn open(&mut self) -> Result<(), NegErrno> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), NegErrno> {
        Ok(())
    }

    fn queue(&mut self, req: &mut VbdRequest) -> QueueOutcome {
        (req.callback)(NegErrno::OK, req.token, true);
        QueueOutcome::Accepted
    }

    fn drain(&mut self) -> bool {
        true
    }
}

/// A RAM-backed image leaf; reads/writes into a growable byte buffer.
/// Used by scenario tests that need to observe actual data movement
/// (e.g. S1's 4 KiB read) and by the `ENOSPC` failover tests (S4), via
/// [`MemImage::fail_writes_with`].
pub struct MemImage {
    data: Vec<u8>,
    fail_writes_with: Option<NegErrno>,
}

impl MemImage {
    pub fn new(size: usize) -> Self {
        MemImage {
            data: vec![0u8; size],
            fail_writes_with: None,
        }
    }

    /// Every subsequent write fails with `errno` (e.g. `ENOSPC` for S4)
    /// until cleared.
    pub fn fail_writes_with(&mut self, errno: Option<NegErrno>) {
        self.fail_writes_with = errno;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ImageLeaf for MemImage {
    fn open(&mut self) -> Result<(), NegErrno> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), NegErrno> {
        Ok(())
    }

    fn queue(&mut self, req: &mut VbdRequest) -> QueueOutcome {
        use tap_ring::BlkifOp;

        let mut off = req.offset as usize;
        let iovecs: Vec<_> = req.iovecs.iter().copied().collect();
        for mut iov in iovecs {
            let len = iov.len;
            match req.op {
                BlkifOp::Write => {
                    if let Some(err) = self.fail_writes_with {
                        return QueueOutcome::FatalError(err);
                    }
                    if off + len > self.data.len() {
                        return QueueOutcome::FatalError(NegErrno::from_errno(libc::EINVAL));
                    }
                    self.data[off..off + len].copy_from_slice(iov.as_slice());
                }
                BlkifOp::Read => {
                    if off + len > self.data.len() {
                        return QueueOutcome::FatalError(NegErrno::from_errno(libc::EINVAL));
                    }
                    iov.as_mut_slice().copy_from_slice(&self.data[off..off + len]);
                }
            }
            off += len;
        }
        (req.callback)(NegErrno::OK, req.token, true);
        QueueOutcome::Accepted
    }

    fn drain(&mut self) -> bool {
        true
    }
}
