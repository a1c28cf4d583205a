//! Per-ABI wire layouts.
//!
//! Design note (spec §9): "represent the three ring layouts as a tagged
//! variant carrying per-variant typed accessors; the canonical
//! request/response form is shared. Do not attempt pointer aliasing across
//! layouts." Each marker type below owns its own `#[repr(C)]` byte layout
//! (with explicit padding standing in for the alignment differences a
//! 32-bit vs. 64-bit frontend's compiler would introduce around the
//! 8-byte `id`/`sector_number` fields) and converts to/from
//! [`crate::canonical`] types; nothing ever casts one layout's bytes as
//! another's.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::canonical::{BlkifOp, CanonicalRequest, CanonicalResponse, ParseError, RspStatus, WireSegment};
use crate::constants::BLKIF_MAX_SEGMENTS_PER_REQUEST;
use tap_types::GrantRef;

const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;

const STATUS_OKAY: u8 = 0;
const STATUS_ERROR: u8 = 0xff;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Abi {
    Native,
    X86_32,
    X86_64,
}

impl Abi {
    /// Frontend `protocol` xenstore key (§6.3): `"x86_32-abi"|"x86_64-abi"|absent(native)`.
    pub fn from_xenstore_str(s: Option<&str>) -> Self {
        match s {
            Some("x86_32-abi") => Abi::X86_32,
            Some("x86_64-abi") => Abi::X86_64,
            _ => Abi::Native,
        }
    }

    pub fn request_size(self) -> usize {
        match self {
            Abi::Native | Abi::X86_64 => RequestNative::SIZE,
            Abi::X86_32 => RequestX86_32::SIZE,
        }
    }

    pub fn response_size(self) -> usize {
        match self {
            Abi::Native | Abi::X86_64 => ResponseNative::SIZE,
            Abi::X86_32 => ResponseX86_32::SIZE,
        }
    }

    pub fn decode_request(self, bytes: &[u8]) -> Result<CanonicalRequest, ParseError> {
        match self {
            Abi::Native | Abi::X86_64 => RequestNative::decode(bytes),
            Abi::X86_32 => RequestX86_32::decode(bytes),
        }
    }

    /// Reads `id` and the raw `operation` byte without validating segments
    /// or the operation value. `id` sits before the segment array in every
    /// layout, so this is safe to call even when [`Abi::decode_request`]
    /// has rejected the same bytes — used to echo `id` on a malformed
    /// request's `RSP_ERROR` (spec §4.1 "Request parse").
    pub fn peek_id_and_op(self, bytes: &[u8]) -> (u64, u8) {
        match self {
            Abi::Native | Abi::X86_64 => {
                let raw = RequestNative::read_from_prefix(bytes).expect("buffer sized by caller");
                (raw.id, raw.operation)
            }
            Abi::X86_32 => {
                let raw = RequestX86_32::read_from_prefix(bytes).expect("buffer sized by caller");
                (raw.id, raw.operation)
            }
        }
    }

    pub fn encode_response(self, resp: &CanonicalResponse, out: &mut [u8]) {
        match self {
            Abi::Native | Abi::X86_64 => ResponseNative::encode(resp, out),
            Abi::X86_32 => ResponseX86_32::encode(resp, out),
        }
    }
}

fn op_to_wire(op: BlkifOp) -> u8 {
    match op {
        BlkifOp::Read => OP_READ,
        BlkifOp::Write => OP_WRITE,
    }
}

fn op_from_wire(v: u8) -> Result<BlkifOp, ParseError> {
    match v {
        OP_READ => Ok(BlkifOp::Read),
        OP_WRITE => Ok(BlkifOp::Write),
        other => Err(ParseError::UnknownOperation(other)),
    }
}

fn status_to_wire(status: RspStatus) -> u8 {
    match status {
        RspStatus::Okay => STATUS_OKAY,
        RspStatus::Error => STATUS_ERROR,
    }
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct WireSegmentRaw {
    gref: u32,
    first_sect: u8,
    last_sect: u8,
    _pad: u16,
}

fn decode_segments(
    nr_segs: u8,
    raw: &[WireSegmentRaw],
) -> Result<crate::canonical::SegmentVec, ParseError> {
    let n = nr_segs as usize;
    if n > BLKIF_MAX_SEGMENTS_PER_REQUEST {
        return Err(ParseError::TooManySegments(n));
    }

    let mut out = crate::canonical::SegmentVec::new();
    for (i, seg) in raw.iter().take(n).enumerate() {
        let seg = WireSegment {
            gref: GrantRef::new(seg.gref),
            first_sector: seg.first_sect,
            last_sector: seg.last_sect,
        };
        if !seg.is_valid() {
            return Err(ParseError::InvalidSegment(i));
        }
        out.push(seg);
    }
    Ok(out)
}

fn encode_segments(segments: &[WireSegment]) -> [WireSegmentRaw; BLKIF_MAX_SEGMENTS_PER_REQUEST] {
    let mut raw = [WireSegmentRaw {
        gref: 0,
        first_sect: 0,
        last_sect: 0,
        _pad: 0,
    }; BLKIF_MAX_SEGMENTS_PER_REQUEST];
    for (dst, src) in raw.iter_mut().zip(segments.iter()) {
        dst.gref = src.gref.get();
        dst.first_sect = src.first_sector;
        dst.last_sect = src.last_sector;
    }
    raw
}

/// native / x86_64: the `id`/`sector_number` 64-bit fields are 8-byte
/// aligned, so the compiler inserts a 4-byte pad after `handle`.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct RequestNative {
    operation: u8,
    nr_segments: u8,
    handle: u16,
    _pad: u32,
    id: u64,
    sector_number: u64,
    seg: [WireSegmentRaw; BLKIF_MAX_SEGMENTS_PER_REQUEST],
}

impl RequestNative {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn decode(bytes: &[u8]) -> Result<CanonicalRequest, ParseError> {
        let raw = RequestNative::read_from_prefix(bytes).expect("buffer sized by caller");
        let segments = decode_segments(raw.nr_segments, &raw.seg)?;
        Ok(CanonicalRequest {
            op: op_from_wire(raw.operation)?,
            id: raw.id,
            offset: raw.sector_number << crate::constants::SECTOR_SHIFT,
            segments,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct ResponseNative {
    id: u64,
    operation: u8,
    status: u8,
    _pad: u16,
    _pad2: u32,
}

impl ResponseNative {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn encode(resp: &CanonicalResponse, out: &mut [u8]) {
        let raw = ResponseNative {
            id: resp.id,
            operation: op_to_wire(resp.op),
            status: status_to_wire(resp.status),
            _pad: 0,
            _pad2: 0,
        };
        out[..Self::SIZE].copy_from_slice(raw.as_bytes());
    }
}

/// x86_32: `uint64_t` aligns to 4 bytes under the ia32 ABI, so there is no
/// padding before `id`.
#[repr(C, packed(4))]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct RequestX86_32 {
    operation: u8,
    nr_segments: u8,
    handle: u16,
    id: u64,
    sector_number: u64,
    seg: [WireSegmentRaw; BLKIF_MAX_SEGMENTS_PER_REQUEST],
}

impl RequestX86_32 {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn decode(bytes: &[u8]) -> Result<CanonicalRequest, ParseError> {
        let raw = RequestX86_32::read_from_prefix(bytes).expect("buffer sized by caller");
        let segments = decode_segments(raw.nr_segments, &raw.seg)?;
        Ok(CanonicalRequest {
            op: op_from_wire(raw.operation)?,
            id: raw.id,
            offset: raw.sector_number << crate::constants::SECTOR_SHIFT,
            segments,
        })
    }
}

#[repr(C, packed(4))]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct ResponseX86_32 {
    id: u64,
    operation: u8,
    status: u8,
    _pad: u16,
}

impl ResponseX86_32 {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn encode(resp: &CanonicalResponse, out: &mut [u8]) {
        let raw = ResponseX86_32 {
            id: resp.id,
            operation: op_to_wire(resp.op),
            status: status_to_wire(resp.status),
            _pad: 0,
        };
        out[..Self::SIZE].copy_from_slice(raw.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::WireSegment;

    fn sample_request(abi: Abi) -> CanonicalRequest {
        CanonicalRequest {
            op: BlkifOp::Write,
            id: 0xdead_beef,
            offset: 4096,
            segments: {
                let mut v = crate::canonical::SegmentVec::new();
                v.push(WireSegment {
                    gref: GrantRef::new(100),
                    first_sector: 0,
                    last_sector: 7,
                });
                v.push(WireSegment {
                    gref: GrantRef::new(101),
                    first_sector: 0,
                    last_sector: 3,
                });
                v
            },
        }
    }

    fn encode_request(abi: Abi, req: &CanonicalRequest) -> Vec<u8> {
        // There's no public request encoder (the daemon never produces
        // wire requests), so build one directly for the round-trip test.
        match abi {
            Abi::Native | Abi::X86_64 => {
                let mut seg = [WireSegmentRaw {
                    gref: 0,
                    first_sect: 0,
                    last_sect: 0,
                    _pad: 0,
                }; BLKIF_MAX_SEGMENTS_PER_REQUEST];
                for (d, s) in seg.iter_mut().zip(req.segments.iter()) {
                    d.gref = s.gref.get();
                    d.first_sect = s.first_sector;
                    d.last_sect = s.last_sector;
                }
                let raw = RequestNative {
                    operation: op_to_wire(req.op),
                    nr_segments: req.segments.len() as u8,
                    handle: 0,
                    _pad: 0,
                    id: req.id,
                    sector_number: req.offset >> crate::constants::SECTOR_SHIFT,
                    seg,
                };
                raw.as_bytes().to_vec()
            }
            Abi::X86_32 => {
                let mut seg = [WireSegmentRaw {
                    gref: 0,
                    first_sect: 0,
                    last_sect: 0,
                    _pad: 0,
                }; BLKIF_MAX_SEGMENTS_PER_REQUEST];
                for (d, s) in seg.iter_mut().zip(req.segments.iter()) {
                    d.gref = s.gref.get();
                    d.first_sect = s.first_sector;
                    d.last_sect = s.last_sector;
                }
                let raw = RequestX86_32 {
                    operation: op_to_wire(req.op),
                    nr_segments: req.segments.len() as u8,
                    handle: 0,
                    id: req.id,
                    sector_number: req.offset >> crate::constants::SECTOR_SHIFT,
                    seg,
                };
                raw.as_bytes().to_vec()
            }
        }
    }

    #[test]
    fn request_round_trips_across_every_abi() {
        for abi in [Abi::Native, Abi::X86_32, Abi::X86_64] {
            let req = sample_request(abi);
            let bytes = encode_request(abi, &req);
            let decoded = abi.decode_request(&bytes).unwrap();
            assert_eq!(decoded.id, req.id);
            assert_eq!(decoded.offset, req.offset);
            assert_eq!(decoded.op, req.op);
            assert_eq!(decoded.segments.len(), req.segments.len());
            for (a, b) in decoded.segments.iter().zip(req.segments.iter()) {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn too_many_segments_rejected() {
        let bytes = vec![0u8; RequestNative::SIZE];
        let mut bytes = bytes;
        bytes[1] = 12; // nr_segments = 12 > 11
        let err = Abi::Native.decode_request(&bytes).unwrap_err();
        assert_eq!(err, ParseError::TooManySegments(12));
    }

    #[test]
    fn response_encodes_without_panicking() {
        let resp = CanonicalResponse {
            id: 42,
            op: BlkifOp::Read,
            status: RspStatus::Okay,
        };
        let mut buf = vec![0u8; ResponseNative::SIZE];
        Abi::Native.encode_response(&resp, &mut buf);
        let mut buf32 = vec![0u8; ResponseX86_32::SIZE];
        Abi::X86_32.encode_response(&resp, &mut buf32);
    }
}
