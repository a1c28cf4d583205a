//! Small newtypes shared by every crate in the workspace: domain/device
//! identifiers, grant references, event ports and the normalized-errno
//! currency used at every fallible boundary (see `NegErrno`).

mod errno;
mod ids;
pub mod paths;

pub use errno::NegErrno;
pub use ids::{DevId, DomId, EvtchnPort, GrantRef, Serial};
