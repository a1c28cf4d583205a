use smallvec::SmallVec;
use tap_types::GrantRef;

use crate::constants::BLKIF_MAX_SEGMENTS_PER_REQUEST;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlkifOp {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RspStatus {
    Okay,
    Error,
}

/// One `{grant_ref, first_sector, last_sector}` triple from the wire
/// request, before grant mapping (spec §3 "Request descriptor").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WireSegment {
    pub gref: GrantRef,
    pub first_sector: u8,
    pub last_sector: u8,
}

impl WireSegment {
    pub fn is_valid(&self) -> bool {
        self.first_sector <= self.last_sector
            && self.last_sector < crate::constants::SECTORS_PER_PAGE
    }
}

pub type SegmentVec = SmallVec<[WireSegment; BLKIF_MAX_SEGMENTS_PER_REQUEST]>;

/// The canonical, ABI-independent decoded form of a ring request (spec
/// §4.1 "Request parse").
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub op: BlkifOp,
    pub id: u64,
    /// `sector_number << 9`.
    pub offset: u64,
    pub segments: SegmentVec,
}

#[derive(Debug, Copy, Clone)]
pub struct CanonicalResponse {
    pub id: u64,
    pub op: BlkifOp,
    pub status: RspStatus,
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum ParseError {
    #[error("n_segs {0} out of range [0, {max}]", max = BLKIF_MAX_SEGMENTS_PER_REQUEST)]
    TooManySegments(usize),
    #[error("segment {0} has first_sect > last_sect or last_sect out of range")]
    InvalidSegment(usize),
    #[error("unknown wire operation {0}")]
    UnknownOperation(u8),
}

impl ParseError {
    /// Every parse failure is `-EINVAL` per spec §4.1.
    pub fn errno(&self) -> tap_types::NegErrno {
        tap_types::NegErrno::from_errno(libc::EINVAL)
    }
}
