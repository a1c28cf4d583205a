//! Grant-mapped VMA → iovec computation and coalescing (spec §4.1 "Grant
//! mapping"). Kept pointer-free and ABI-independent: a request's segments
//! are walked into `(byte offset into the mapped VMA, length)` pairs, with
//! adjacent entries coalesced. [`tap_xenio`]'s transport layer turns the
//! resulting offsets into real `libc::iovec`s against the mapped base
//! pointer, mirroring the split the teacher keeps between
//! `descriptor_utils::Iovec` (pure layout) and `filemap::MappedFile` (the
//! actual mapping).

use smallvec::SmallVec;

use crate::canonical::WireSegment;
use crate::constants::{BLKIF_MAX_SEGMENTS_PER_REQUEST, PAGE_SIZE, SECTOR_SIZE};

/// One coalesced span within the mapped VMA.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IoSpan {
    pub offset: usize,
    pub len: usize,
}

pub type IoSpanVec = SmallVec<[IoSpan; BLKIF_MAX_SEGMENTS_PER_REQUEST]>;

/// Walks `segments` (one per grant-mapped page, in request order) and
/// produces coalesced spans: `base = page_index*page_size + first*512`,
/// `len = (last-first+1)*512`, merging entry `i` into `i-1` whenever
/// `base[i] == base[i-1] + len[i-1]`.
pub fn coalesce_iovecs(segments: &[WireSegment]) -> IoSpanVec {
    let mut out = IoSpanVec::new();

    for (page_index, seg) in segments.iter().enumerate() {
        let base = page_index * PAGE_SIZE + seg.first_sector as usize * SECTOR_SIZE as usize;
        let len = (seg.last_sector - seg.first_sector + 1) as usize * SECTOR_SIZE as usize;

        match out.last_mut() {
            Some(prev) if prev.offset + prev.len == base => {
                prev.len += len;
            }
            _ => out.push(IoSpan { offset: base, len }),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tap_types::GrantRef;

    fn seg(gref: u32, first: u8, last: u8) -> WireSegment {
        WireSegment {
            gref: GrantRef::new(gref),
            first_sector: first,
            last_sector: last,
        }
    }

    #[test]
    fn single_full_page_is_one_span() {
        let spans = coalesce_iovecs(&[seg(1, 0, 7)]);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], IoSpan { offset: 0, len: PAGE_SIZE });
    }

    #[test]
    fn contiguous_pages_coalesce_into_one_span() {
        // page 0 tail half + page 1 head half, contiguous in the VMA.
        let spans = coalesce_iovecs(&[seg(1, 4, 7), seg(2, 0, 3)]);
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0],
            IoSpan {
                offset: 4 * SECTOR_SIZE as usize,
                len: PAGE_SIZE,
            }
        );
    }

    #[test]
    fn non_adjacent_segments_stay_separate() {
        // both segments cover sectors [0,3] of their own page: page 0's
        // span ends at offset 2048, but page 1's span starts at its own
        // page base (4096), so there's a gap and they don't coalesce.
        let spans = coalesce_iovecs(&[seg(1, 0, 3), seg(2, 0, 3)]);
        assert_eq!(spans.len(), 2);
    }
}
