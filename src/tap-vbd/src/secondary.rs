//! Secondary-image failover (spec §4.3 "ENOSPC on the primary image chain",
//! scenario S4). A VBD may carry a second image chain used either as a
//! mirror (writes fan out to both, reads stay on the primary) or a cold
//! standby (untouched until the primary is retired).

use tap_types::NegErrno;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecondaryMode {
    Disabled,
    Mirror,
    Standby,
}

/// Decision returned by [`SecondaryPolicy::on_primary_error`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailoverAction {
    /// Not a failover-triggering error; handle normally (retry/fail).
    Ignore,
    /// Retire the primary and mirror/standby takes over as primary.
    RetirePrimary,
}

/// Pure decision logic, kept separate from `Vbd` so it can be unit tested
/// without constructing a whole engine.
pub struct SecondaryPolicy {
    pub mode: SecondaryMode,
    retired: bool,
}

impl SecondaryPolicy {
    pub fn new(mode: SecondaryMode) -> Self {
        SecondaryPolicy { mode, retired: false }
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Spec §4.3: an `ENOSPC` from the primary's image chain, while a
    /// secondary is configured and not yet retired, triggers failover
    /// instead of the normal retry policy. Any other errno, or no
    /// secondary, falls through to ordinary handling.
    pub fn on_primary_error(&mut self, err: NegErrno) -> FailoverAction {
        if self.retired || self.mode == SecondaryMode::Disabled {
            return FailoverAction::Ignore;
        }
        if err.get() == -libc::ENOSPC {
            self.retired = true;
            FailoverAction::RetirePrimary
        } else {
            FailoverAction::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_retires_primary_once() {
        let mut p = SecondaryPolicy::new(SecondaryMode::Mirror);
        let enospc = NegErrno::from_errno(libc::ENOSPC);
        assert_eq!(p.on_primary_error(enospc), FailoverAction::RetirePrimary);
        assert!(p.is_retired());
        // second ENOSPC after retirement is a no-op, not a repeat failover.
        assert_eq!(p.on_primary_error(enospc), FailoverAction::Ignore);
    }

    #[test]
    fn disabled_secondary_never_fails_over() {
        let mut p = SecondaryPolicy::new(SecondaryMode::Disabled);
        let enospc = NegErrno::from_errno(libc::ENOSPC);
        assert_eq!(p.on_primary_error(enospc), FailoverAction::Ignore);
    }

    #[test]
    fn other_errno_does_not_trigger_failover() {
        let mut p = SecondaryPolicy::new(SecondaryMode::Standby);
        let eio = NegErrno::from_errno(libc::EIO);
        assert_eq!(p.on_primary_error(eio), FailoverAction::Ignore);
        assert!(!p.is_retired());
    }
}
