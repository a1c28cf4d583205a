//! VBD lifecycle state (spec §3 "VBD" state bits, §4.3 "pause/shutdown").
//! Kept as a bitflags value rather than an enum: several bits are
//! requested/acked independently (e.g. a pause can be requested while a
//! shutdown is also pending) and the spec's invariants are phrased as
//! bit-level mutual exclusions, not a single discrete state.

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct VbdState: u32 {
        /// Fully torn down; the engine will no longer schedule this VBD.
        const DEAD               = 1 << 0;
        /// Image chain closed; no further I/O will be queued.
        const CLOSED             = 1 << 1;
        /// A quiesce was requested (drain in flight, accept no new
        /// requests) but has not yet completed.
        const QUIESCE_REQUESTED  = 1 << 2;
        /// The quiesce completed: nothing is in flight and nothing new
        /// will be queued until resumed.
        const QUIESCED           = 1 << 3;
        const PAUSE_REQUESTED    = 1 << 4;
        const PAUSED             = 1 << 5;
        const SHUTDOWN_REQUESTED = 1 << 6;
        /// A lock is held preventing concurrent state transitions (spec
        /// §3: VBD operations are themselves serialized).
        const LOCKING            = 1 << 7;
        /// At least one completion was dropped because its originating
        /// blkif had already gone away (spec §4.3 edge case).
        const LOG_DROPPED        = 1 << 8;
    }
}

impl VbdState {
    /// `QUIESCE_REQUESTED` and `QUIESCED` are never both set: the request
    /// bit clears the moment the quiesced bit sets (spec §4.3 invariant).
    /// Same for `PAUSE_REQUESTED`/`PAUSED`.
    pub fn invariants_hold(self) -> bool {
        !(self.contains(VbdState::QUIESCE_REQUESTED) && self.contains(VbdState::QUIESCED))
            && !(self.contains(VbdState::PAUSE_REQUESTED) && self.contains(VbdState::PAUSED))
    }

    /// No new request may be queued while a quiesce, pause, or shutdown
    /// is requested or already in effect, nor once closed or dead
    /// (spec.md:88 "refuse new requests with `-EBUSY`" while draining).
    pub fn accepts_new_requests(self) -> bool {
        !self.intersects(
            VbdState::QUIESCE_REQUESTED
                | VbdState::QUIESCED
                | VbdState::PAUSE_REQUESTED
                | VbdState::PAUSED
                | VbdState::SHUTDOWN_REQUESTED
                | VbdState::CLOSED
                | VbdState::DEAD,
        )
    }

    pub fn is_live(self) -> bool {
        !self.contains(VbdState::DEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiesce_request_and_ack_are_mutually_exclusive() {
        let mut s = VbdState::empty();
        s.insert(VbdState::QUIESCE_REQUESTED);
        assert!(s.invariants_hold());
        s.remove(VbdState::QUIESCE_REQUESTED);
        s.insert(VbdState::QUIESCED);
        assert!(s.invariants_hold());

        s.insert(VbdState::QUIESCE_REQUESTED);
        assert!(!s.invariants_hold());
    }

    #[test]
    fn fresh_state_accepts_requests() {
        assert!(VbdState::empty().accepts_new_requests());
    }

    #[test]
    fn paused_rejects_new_requests() {
        assert!(!VbdState::PAUSED.accepts_new_requests());
        assert!(!VbdState::CLOSED.accepts_new_requests());
        assert!(!VbdState::DEAD.accepts_new_requests());
    }

    #[test]
    fn requested_but_not_yet_settled_states_also_reject_new_requests() {
        assert!(!VbdState::PAUSE_REQUESTED.accepts_new_requests());
        assert!(!VbdState::QUIESCE_REQUESTED.accepts_new_requests());
        assert!(!VbdState::SHUTDOWN_REQUESTED.accepts_new_requests());
    }
}
