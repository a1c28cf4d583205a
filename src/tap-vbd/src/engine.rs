//! Component E: the VBD request engine (spec §3 "VBD", §4.3 "request
//! lifecycle"). Owns the `new`/`pending`/`failed` request queues and drives
//! them against an [`ImageLeaf`] chain; completion is the fourth queue's
//! semantics without its own buffer — `ImageLeaf::queue` invokes the
//! request's callback directly once it resolves, so a request never sits
//! idle waiting to be walked out of a `completed` list, it fires as soon as
//! the chain (or a timeout/kill_queue) resolves it. Implements the
//! pause/shutdown/retry/failover state machine.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tap_types::NegErrno;

use crate::image::{ImageLeaf, QueueOutcome};
use crate::request::{VbdRequest, VbdToken};
use crate::secondary::{FailoverAction, SecondaryMode, SecondaryPolicy};
use crate::state::VbdState;

/// Spec §4.3 retry policy constants.
pub const MAX_RETRIES: u32 = 100;
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Spec §7 "ENOSPC ... touches the enospc signal file". Best-effort: a
/// failure to create the file doesn't block the failover it's reporting.
fn touch_enospc_signal_file() {
    if let Err(e) = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(tap_types::paths::BLKTAP3_ENOSPC_SIGNAL_FILE)
    {
        tracing::debug!(error = %e, "could not touch enospc signal file");
    }
}

/// One VBD: a name, a lifecycle state, an ordered image chain (here
/// flattened to a single active leaf plus an optional secondary — spec
/// §1 Non-goals excludes multi-leaf chain composition), and its four
/// request queues.
pub struct Vbd {
    pub uuid: String,
    pub name: [u8; 16],
    state: VbdState,
    primary: Box<dyn ImageLeaf>,
    secondary: Option<Box<dyn ImageLeaf>>,
    /// The image chain bumped out of active service by a mirror failover
    /// (spec §3 "optional retired image"). Kept alive — not closed — until
    /// the VBD itself shuts down, since requests dispatched to it before
    /// the failover may still be in flight (spec §5 "retired images are
    /// released only on VBD close").
    retired: Option<Box<dyn ImageLeaf>>,
    policy: SecondaryPolicy,

    new: VecDeque<VbdRequest>,
    pending: VecDeque<VbdRequest>,
    failed: VecDeque<VbdRequest>,

    last_retry_sweep: Option<Instant>,
    dropped_completions: u64,
}

impl Vbd {
    pub fn new(uuid: impl Into<String>, name: [u8; 16], primary: Box<dyn ImageLeaf>) -> Self {
        Vbd {
            uuid: uuid.into(),
            name,
            state: VbdState::empty(),
            primary,
            secondary: None,
            retired: None,
            policy: SecondaryPolicy::new(SecondaryMode::Disabled),
            new: VecDeque::new(),
            pending: VecDeque::new(),
            failed: VecDeque::new(),
            last_retry_sweep: None,
            dropped_completions: 0,
        }
    }

    pub fn with_secondary(mut self, mode: SecondaryMode, leaf: Box<dyn ImageLeaf>) -> Self {
        self.policy = SecondaryPolicy::new(mode);
        self.secondary = Some(leaf);
        self
    }

    pub fn state(&self) -> VbdState {
        self.state
    }

    pub fn dropped_completions(&self) -> u64 {
        self.dropped_completions
    }

    /// Enqueues a freshly-decoded request. Rejected immediately with
    /// `-EBUSY` (via the request's own callback) if the VBD isn't
    /// currently accepting new work (spec.md:88 "refuse new requests with
    /// `-EBUSY`"; scenario S2). Passes `final=false`: this rejection fires
    /// synchronously from inside whichever blkif ring-drain loop called
    /// us, and that loop always runs its own unconditional
    /// publish-and-notify once the whole batch has been handled, so this
    /// single completion must not trigger a second, premature notify.
    pub fn submit(&mut self, mut req: VbdRequest) {
        if !self.state.accepts_new_requests() {
            (req.callback)(NegErrno::from_errno(libc::EBUSY), req.token, false);
            return;
        }
        self.new.push_back(req);
    }

    pub fn request_pause(&mut self) {
        self.state.insert(VbdState::PAUSE_REQUESTED);
    }

    pub fn request_shutdown(&mut self) {
        self.state.insert(VbdState::SHUTDOWN_REQUESTED);
    }

    pub fn request_quiesce(&mut self) {
        self.state.insert(VbdState::QUIESCE_REQUESTED);
    }

    pub fn resume(&mut self) {
        self.state
            .remove(VbdState::PAUSED | VbdState::PAUSE_REQUESTED | VbdState::QUIESCED | VbdState::QUIESCE_REQUESTED);
    }

    /// Drives one iteration of the engine: queues everything in `new`,
    /// sweeps `pending` for timeouts, retries `failed` entries whose
    /// backoff has elapsed, and settles pause/quiesce/shutdown requests
    /// once their drain conditions are met. Called once per scheduler
    /// wakeup for this VBD.
    ///
    /// Every completion produced directly by this tick (as opposed to one
    /// an `ImageLeaf` resolves synchronously inline) is buffered rather
    /// than fired immediately, so that a single wake-up which resolves
    /// several requests for the same blkif still reaches `final=true` on
    /// exactly one of them (spec.md:100, spec.md:219 "≤ 1 notify per
    /// wake-up").
    pub fn tick(&mut self, now: Instant) {
        if self.state.contains(VbdState::DEAD) {
            return;
        }

        let mut completions = Vec::new();
        self.queue_new(now, &mut completions);
        self.sweep_timeouts(now, &mut completions);
        self.retry_failed(now, &mut completions);
        self.settle_lifecycle();
        Self::fire_batch(completions);
    }

    /// Fires every buffered completion, setting `final=true` on only the
    /// last entry for each token (spec.md:100 "the last of the batch per
    /// token") and `final=false` on the rest.
    fn fire_batch(mut completions: Vec<(NegErrno, VbdRequest)>) {
        let mut last_for_token: HashMap<VbdToken, usize> = HashMap::new();
        for (i, (_, req)) in completions.iter().enumerate() {
            last_for_token.insert(req.token, i);
        }
        for (i, (err, mut req)) in completions.drain(..).enumerate() {
            let is_final = last_for_token.get(&req.token) == Some(&i);
            (req.callback)(err, req.token, is_final);
        }
    }

    fn queue_new(&mut self, now: Instant, completions: &mut Vec<(NegErrno, VbdRequest)>) {
        if self.state.intersects(
            VbdState::QUIESCE_REQUESTED
                | VbdState::QUIESCED
                | VbdState::PAUSE_REQUESTED
                | VbdState::PAUSED
                | VbdState::SHUTDOWN_REQUESTED,
        ) {
            // Draining, not accepting: leave `new` queued until resumed,
            // but do not hand anything further to the image chain.
            return;
        }
        while let Some(mut req) = self.new.pop_front() {
            req.submitted_at = now;
            self.dispatch(req, completions);
        }
    }

    fn dispatch(&mut self, mut req: VbdRequest, completions: &mut Vec<(NegErrno, VbdRequest)>) {
        match self.primary.queue(&mut req) {
            QueueOutcome::Accepted => {
                self.pending.push_back(req);
            }
            QueueOutcome::RetryableError(err) => {
                req.last_error = Some(err);
                self.failed.push_back(req);
            }
            QueueOutcome::FatalError(err) => match self.policy.on_primary_error(err) {
                FailoverAction::RetirePrimary => {
                    if let Some(secondary) = self.secondary.take() {
                        tracing::warn!(vbd = %self.uuid, errno = %err, "primary retired, promoting secondary");
                        touch_enospc_signal_file();
                        let old_primary = std::mem::replace(&mut self.primary, secondary);
                        self.retired = Some(old_primary);
                        req.last_error = Some(err);
                        req.retries = 0;
                        self.failed.push_back(req);
                    } else {
                        completions.push((err, req));
                    }
                }
                FailoverAction::Ignore => {
                    completions.push((err, req));
                }
            },
        }
    }

    fn sweep_timeouts(&mut self, now: Instant, completions: &mut Vec<(NegErrno, VbdRequest)>) {
        let timed_out: Vec<_> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, r)| now.duration_since(r.submitted_at) >= REQUEST_TIMEOUT)
            .map(|(i, _)| i)
            .collect();
        for &i in timed_out.iter().rev() {
            let mut req = self.pending.remove(i).unwrap();
            // Timeout is the detection condition; spec.md:208 is explicit
            // that the delivered errno for this category is `EIO`.
            req.last_error = Some(NegErrno::from_errno(libc::EIO));
            completions.push((NegErrno::from_errno(libc::EIO), req));
        }
    }

    fn retry_failed(&mut self, now: Instant, completions: &mut Vec<(NegErrno, VbdRequest)>) {
        if self.failed.is_empty() {
            return;
        }
        match self.last_retry_sweep {
            // First failure this VBD has ever seen: start the backoff
            // clock now rather than retrying within the same tick that
            // produced the failure.
            None => {
                self.last_retry_sweep = Some(now);
                return;
            }
            Some(last) if now.duration_since(last) < RETRY_INTERVAL => return,
            Some(_) => {}
        }
        self.last_retry_sweep = Some(now);

        // Snapshot the count up front: `dispatch` may push fresh failures
        // onto the back of `self.failed`, and those wait for the next
        // sweep rather than being retried again in this one.
        let n = self.failed.len();
        for _ in 0..n {
            let mut req = self.failed.pop_front().expect("counted above");
            if req.retries >= MAX_RETRIES {
                let err = req.last_error.unwrap_or_else(|| NegErrno::from_errno(libc::EIO));
                completions.push((err, req));
                continue;
            }
            req.retries += 1;
            self.dispatch(req, completions);
        }
    }

    fn settle_lifecycle(&mut self) {
        let drained = self.new.is_empty() && self.pending.is_empty() && self.failed.is_empty();

        if self.state.contains(VbdState::QUIESCE_REQUESTED) && drained {
            self.state.remove(VbdState::QUIESCE_REQUESTED);
            self.state.insert(VbdState::QUIESCED);
        }
        if self.state.contains(VbdState::PAUSE_REQUESTED) && drained {
            self.state.remove(VbdState::PAUSE_REQUESTED);
            self.state.insert(VbdState::PAUSED);
        }
        if self.state.contains(VbdState::SHUTDOWN_REQUESTED) && drained {
            self.force_close();
        }
    }

    /// Spec §4.3 "force shutdown": completes every in-flight request with
    /// `-EIO` immediately rather than waiting for a graceful drain, then
    /// tears the VBD down. Used by `tapctl destroy --force` (via
    /// `tap-ctl-proto`) and by the broker's fast-recycle path (S5).
    pub fn kill_queue(&mut self) {
        let mut completions: Vec<(NegErrno, VbdRequest)> = Vec::new();
        for req in self.new.drain(..) {
            completions.push((NegErrno::from_errno(libc::EIO), req));
        }
        for req in self.pending.drain(..) {
            completions.push((NegErrno::from_errno(libc::EIO), req));
        }
        for req in self.failed.drain(..) {
            completions.push((NegErrno::from_errno(libc::EIO), req));
        }
        Self::fire_batch(completions);
        self.force_close();
    }

    fn force_close(&mut self) {
        let _ = self.primary.close();
        if let Some(secondary) = self.secondary.as_mut() {
            let _ = secondary.close();
        }
        if let Some(retired) = self.retired.as_mut() {
            let _ = retired.close();
        }
        self.state.remove(VbdState::SHUTDOWN_REQUESTED);
        self.state.insert(VbdState::CLOSED | VbdState::DEAD);
    }

    /// Whether a mirror failover has retired the original primary image
    /// (spec §3 invariant: "a retired image persists in the VBD until
    /// shutdown").
    pub fn has_retired_image(&self) -> bool {
        self.retired.is_some()
    }

    /// Called by the blkif when a response's originating request can no
    /// longer be matched to a live ring slot (spec §4.3 edge case: the
    /// blkif was torn down mid-flight). Counts the drop instead of
    /// panicking.
    pub fn note_dropped_completion(&mut self) {
        self.dropped_completions += 1;
        self.state.insert(VbdState::LOG_DROPPED);
    }

    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (self.new.len(), self.pending.len(), self.failed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{MemImage, NullImage};
    use crate::request::{IoVecRaw, VbdToken};
    use smallvec::smallvec;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn name(s: &str) -> [u8; 16] {
        let mut n = [0u8; 16];
        let b = s.as_bytes();
        n[..b.len().min(16)].copy_from_slice(&b[..b.len().min(16)]);
        n
    }

    fn simple_request(result: Rc<RefCell<Option<NegErrno>>>) -> VbdRequest {
        VbdRequest {
            op: tap_ring::BlkifOp::Read,
            iovecs: smallvec![],
            offset: 0,
            name: name("t"),
            retries: 0,
            last_error: None,
            submitted_at: Instant::now(),
            token: VbdToken(1),
            callback: Box::new(move |e, _tok, _final| {
                *result.borrow_mut() = Some(e);
            }),
        }
    }

    #[test]
    fn accepted_request_completes_through_null_image() {
        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(NullImage));
        let result = Rc::new(RefCell::new(None));
        vbd.submit(simple_request(result.clone()));
        vbd.tick(Instant::now());
        assert_eq!(*result.borrow(), Some(NegErrno::OK));
        assert_eq!(vbd.queue_depths(), (0, 1, 0));
    }

    #[test]
    fn paused_vbd_rejects_new_submissions() {
        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(NullImage));
        vbd.request_pause();
        vbd.tick(Instant::now());
        assert!(vbd.state().contains(VbdState::PAUSED));

        let result = Rc::new(RefCell::new(None));
        vbd.submit(simple_request(result.clone()));
        assert_eq!(result.borrow().unwrap(), NegErrno::from_errno(libc::EBUSY));
    }

    #[test]
    fn enospc_fails_over_to_secondary_and_completes_write() {
        let mut primary = MemImage::new(4096);
        primary.fail_writes_with(Some(NegErrno::from_errno(libc::ENOSPC)));
        let secondary = MemImage::new(4096);

        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(primary))
            .with_secondary(SecondaryMode::Mirror, Box::new(secondary));

        let mut buf = vec![0xABu8; 512];
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let req = VbdRequest {
            op: tap_ring::BlkifOp::Write,
            iovecs: smallvec![unsafe { IoVecRaw::new(buf.as_mut_ptr(), buf.len()) }],
            offset: 0,
            name: name("t"),
            retries: 0,
            last_error: None,
            submitted_at: Instant::now(),
            token: VbdToken(7),
            callback: Box::new(move |e, _tok, _final| {
                *result2.borrow_mut() = Some(e);
            }),
        };
        vbd.submit(req);
        let t0 = Instant::now();
        vbd.tick(t0);
        // first tick: ENOSPC from primary triggers failover, request
        // lands in `failed` for retry against the promoted secondary.
        assert_eq!(vbd.queue_depths().2, 1);
        vbd.tick(t0 + RETRY_INTERVAL);
        assert_eq!(*result.borrow(), Some(NegErrno::OK));
        // the retired primary is kept, not dropped, until the VBD closes
        // (spec §3/§5: released only on VBD close).
        assert!(vbd.has_retired_image());
        vbd.kill_queue();
        assert!(vbd.state().contains(VbdState::DEAD));
    }

    #[test]
    fn resume_reopens_submission_and_drains_queued_requests() {
        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(NullImage));
        vbd.request_pause();
        vbd.tick(Instant::now());
        assert!(vbd.state().contains(VbdState::PAUSED));

        vbd.resume();
        assert!(!vbd.state().intersects(VbdState::PAUSED | VbdState::PAUSE_REQUESTED));

        let result = Rc::new(RefCell::new(None));
        vbd.submit(simple_request(result.clone()));
        vbd.tick(Instant::now());
        assert_eq!(*result.borrow(), Some(NegErrno::OK));
    }

    #[test]
    fn force_close_completes_a_hung_in_flight_request_with_eio() {
        // An image whose `queue` never resolves the request: models a
        // leaf stuck on a hung backend (spec §4.3 "hung request").
        struct HangingImage;
        impl ImageLeaf for HangingImage {
            fn open(&mut self) -> Result<(), NegErrno> {
                Ok(())
            }
            fn close(&mut self) -> Result<(), NegErrno> {
                Ok(())
            }
            fn queue(&mut self, _req: &mut VbdRequest) -> QueueOutcome {
                QueueOutcome::Accepted
            }
            fn drain(&mut self) -> bool {
                true
            }
        }

        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(HangingImage));
        let result = Rc::new(RefCell::new(None));
        vbd.submit(simple_request(result.clone()));
        vbd.tick(Instant::now());
        // accepted into `pending`, but `HangingImage` never calls back.
        assert_eq!(vbd.queue_depths().1, 1);
        assert!(result.borrow().is_none());

        vbd.kill_queue();
        assert_eq!(*result.borrow(), Some(NegErrno::from_errno(libc::EIO)));
        assert!(vbd.state().contains(VbdState::DEAD));
        assert_eq!(vbd.queue_depths(), (0, 0, 0));
    }

    #[test]
    fn kill_queue_fails_everything_immediately() {
        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(NullImage));
        vbd.request_pause();
        vbd.tick(Instant::now());
        let result = Rc::new(RefCell::new(None));
        vbd.submit(simple_request(result.clone()));
        assert_eq!(result.borrow().unwrap(), NegErrno::from_errno(libc::EBUSY));

        vbd.kill_queue();
        assert!(vbd.state().contains(VbdState::DEAD));
    }

    #[test]
    fn batch_completion_sets_final_only_on_the_last_entry_per_token() {
        // A leaf whose `queue` never resolves: every request lands in
        // `pending` and is only completed later, in bulk, by `kill_queue`
        // (spec.md:100, spec.md:219 "≤ 1 notify per wake-up").
        struct HangingImage;
        impl ImageLeaf for HangingImage {
            fn open(&mut self) -> Result<(), NegErrno> {
                Ok(())
            }
            fn close(&mut self) -> Result<(), NegErrno> {
                Ok(())
            }
            fn queue(&mut self, _req: &mut VbdRequest) -> QueueOutcome {
                QueueOutcome::Accepted
            }
            fn drain(&mut self) -> bool {
                true
            }
        }

        fn token_request(token: u64, finals: Rc<RefCell<Vec<bool>>>) -> VbdRequest {
            VbdRequest {
                op: tap_ring::BlkifOp::Read,
                iovecs: smallvec![],
                offset: 0,
                name: name("t"),
                retries: 0,
                last_error: None,
                submitted_at: Instant::now(),
                token: VbdToken(token),
                callback: Box::new(move |_err, _tok, is_final| finals.borrow_mut().push(is_final)),
            }
        }

        let mut vbd = Vbd::new("u1", name("disk0"), Box::new(HangingImage));
        let finals = Rc::new(RefCell::new(Vec::new()));

        vbd.submit(token_request(1, finals.clone()));
        vbd.submit(token_request(1, finals.clone()));
        vbd.submit(token_request(2, finals.clone()));
        vbd.tick(Instant::now());
        assert_eq!(vbd.queue_depths().1, 3);

        vbd.kill_queue();

        let finals = finals.borrow();
        assert_eq!(*finals, vec![false, true, true]);
        // exactly one `final=true` per distinct token present in the batch.
        assert_eq!(finals.iter().filter(|&&f| f).count(), 2);
    }
}
