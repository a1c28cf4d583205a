//! Components A, C, D: transport handles, the connected blkif object,
//! and the I/O context that multiplexes them onto one event-channel fd.
//! Ring decode/encode and barrier primitives live in `tap-ring`; the
//! engine this crate submits into lives in `tap-vbd`.

pub mod blkif;
pub mod ioctx;
pub mod pool;
pub mod transport;

pub use blkif::{Blkif, BlkifStats, VbdSink};
pub use ioctx::IoContext;
pub use pool::{PooledTransport, TransportRegistry, DEFAULT_POOL};
pub use transport::{to_neg_errno, EventChannel, GrantMapper, MapProt, MappedVma, Transport};
