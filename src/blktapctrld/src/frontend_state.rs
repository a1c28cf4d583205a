//! The frontend-state state machine (spec §4.5 "Frontend state machine").
//! Kept as a pure mapping from an incoming `<frontend>/state` value to the
//! [`Action`] the broker must take, separate from the I/O that performs
//! that action, so the transition table itself is unit-testable without a
//! configuration store or control socket.

use std::fmt;

/// Values xenstore's `state` key takes, in the numeric order the real
/// `XenbusState` enum uses (spec §4.5 "a closed set").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrontendState {
    Unknown,
    Initialising,
    InitWait,
    Initialised,
    Connected,
    Closing,
    Closed,
    Reconfiguring,
    Reconfigured,
}

impl FrontendState {
    /// Parses either the numeric xenstore encoding or the bare name
    /// (case-insensitive); anything else is `Unknown` rather than an
    /// error, matching the table's own `Unknown -> no-op` row.
    pub fn parse(raw: &str) -> FrontendState {
        use FrontendState::*;
        if let Ok(n) = raw.trim().parse::<u32>() {
            return match n {
                1 => Initialising,
                2 => InitWait,
                3 => Initialised,
                4 => Connected,
                5 => Closing,
                6 => Closed,
                7 => Reconfiguring,
                8 => Reconfigured,
                _ => Unknown,
            };
        }
        match raw.trim().to_ascii_lowercase().as_str() {
            "initialising" => Initialising,
            "initwait" => InitWait,
            "initialised" | "initialized" => Initialised,
            "connected" => Connected,
            "closing" => Closing,
            "closed" => Closed,
            "reconfiguring" => Reconfiguring,
            "reconfigured" => Reconfigured,
            _ => Unknown,
        }
    }

    pub fn as_wire(self) -> u32 {
        use FrontendState::*;
        match self {
            Unknown => 0,
            Initialising => 1,
            InitWait => 2,
            Initialised => 3,
            Connected => 4,
            Closing => 5,
            Closed => 6,
            Reconfiguring => 7,
            Reconfigured => 8,
        }
    }
}

impl fmt::Display for FrontendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What the broker does in response to an incoming frontend state (spec
/// §4.5's table). `ConnectRing`/`DisconnectRing` additionally write the
/// broker's own follow-up state once the control-socket call succeeds;
/// that sequencing lives in `broker.rs` since it depends on the call's
/// outcome, not just the incoming value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Action {
    Noop,
    WriteOwnState(FrontendState),
    ConnectRing,
    DisconnectRing,
}

/// Spec §4.5 table, verbatim.
pub fn next_action(incoming: FrontendState) -> Action {
    use FrontendState::*;
    match incoming {
        Initialising => Action::WriteOwnState(InitWait),
        Initialised | Connected => Action::ConnectRing,
        Closing => Action::WriteOwnState(Closing),
        Closed => Action::DisconnectRing,
        Unknown | Reconfiguring | Reconfigured | InitWait => Action::Noop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FrontendState::*;

    #[test]
    fn parses_numeric_and_name_forms_the_same() {
        assert_eq!(FrontendState::parse("4"), Connected);
        assert_eq!(FrontendState::parse("Connected"), Connected);
        assert_eq!(FrontendState::parse("connected"), Connected);
    }

    #[test]
    fn unparseable_value_is_unknown_not_an_error() {
        assert_eq!(FrontendState::parse("garbage"), Unknown);
        assert_eq!(FrontendState::parse("99"), Unknown);
    }

    #[test]
    fn table_matches_spec_4_5() {
        assert_eq!(next_action(Initialising), Action::WriteOwnState(InitWait));
        assert_eq!(next_action(Initialised), Action::ConnectRing);
        assert_eq!(next_action(Connected), Action::ConnectRing);
        assert_eq!(next_action(Closing), Action::WriteOwnState(Closing));
        assert_eq!(next_action(Closed), Action::DisconnectRing);
        for s in [Unknown, Reconfiguring, Reconfigured, InitWait] {
            assert_eq!(next_action(s), Action::Noop);
        }
    }
}
