use std::time::Instant;

use smallvec::SmallVec;
use tap_ring::BlkifOp;
use tap_types::NegErrno;

use crate::BLKIF_MAX_SEGMENTS_PER_REQUEST;

/// One coalesced iovec against grant-mapped memory that outlives this
/// request (the owning blkif's request slab keeps the mapping alive until
/// the response is written back, per spec §9 "ownership of mapped grant
/// VMAs").
///
/// Raw pointers, not a borrowed slice: the request is queued into the
/// engine and its completion runs from a scheduler callback with no
/// lifetime connecting it back to the blkif that produced it. This
/// mirrors the teacher's `descriptor_utils::Iovec`, which wraps a raw
/// `libc::iovec` for the same reason.
#[derive(Copy, Clone)]
pub struct IoVecRaw {
    pub ptr: *mut u8,
    pub len: usize,
}

unsafe impl Send for IoVecRaw {}

impl IoVecRaw {
    /// # Safety
    /// `ptr` must remain valid for `len` bytes for as long as the
    /// `VbdRequest` carrying it is alive.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        IoVecRaw { ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Opaque identifier for "the blkif that submitted this request" (spec
/// §3 "VBD request ... token (the blkif)"). The engine never dereferences
/// it; whoever owns the blkif objects (the worker binary) maps it back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct VbdToken(pub u64);

pub type CompletionCb = Box<dyn FnMut(NegErrno, VbdToken, bool)>;

/// A request queued into the VBD engine (spec §3 "VBD request").
pub struct VbdRequest {
    pub op: BlkifOp,
    pub iovecs: SmallVec<[IoVecRaw; BLKIF_MAX_SEGMENTS_PER_REQUEST]>,
    pub offset: u64,
    /// 16-char diagnostic name (spec §3).
    pub name: [u8; 16],
    pub retries: u32,
    pub last_error: Option<NegErrno>,
    pub submitted_at: Instant,
    pub token: VbdToken,
    pub callback: CompletionCb,
}

impl VbdRequest {
    pub fn total_len(&self) -> usize {
        self.iovecs.iter().map(|v| v.len).sum()
    }
}

impl std::fmt::Debug for VbdRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VbdRequest")
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("retries", &self.retries)
            .field("last_error", &self.last_error)
            .finish()
    }
}
