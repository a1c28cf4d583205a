//! Components E and F: the VBD request engine and the image-chain
//! contract it drives. Ring/ABI decoding lives in `tap-ring`; this crate
//! only ever sees already-mapped iovecs and canonical requests.

pub mod engine;
pub mod image;
pub mod request;
pub mod secondary;
pub mod state;

pub use engine::{Vbd, MAX_RETRIES, REQUEST_TIMEOUT, RETRY_INTERVAL};
pub use image::{ImageLeaf, MemImage, NullImage, QueueOutcome};
pub use request::{CompletionCb, IoVecRaw, VbdRequest, VbdToken};
pub use secondary::{FailoverAction, SecondaryMode, SecondaryPolicy};
pub use state::VbdState;

/// Re-exported so request builders elsewhere in the workspace don't need
/// a direct `tap-ring` dependency just for this one constant.
pub use tap_ring::constants::BLKIF_MAX_SEGMENTS_PER_REQUEST;
