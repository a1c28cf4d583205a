//! Component B: the shared ring. Wire-ABI decoding/encoding, the
//! producer/consumer ring primitives with their barrier sequences, and
//! grant-mapped iovec coalescing. Owns no file descriptors or syscalls —
//! `tap-xenio` supplies the mapped memory and drives this module's API.

pub mod abi;
pub mod canonical;
pub mod constants;
pub mod iovec;
pub mod ring;

pub use abi::Abi;
pub use canonical::{BlkifOp, CanonicalRequest, CanonicalResponse, ParseError, RspStatus, WireSegment};
pub use iovec::{coalesce_iovecs, IoSpan, IoSpanVec};
pub use ring::{DecodedSlot, Ring, RingIndices};
