//! The shared producer/consumer ring (spec §4.1, §9 "Ring indices and
//! barriers"). This module is the "reusable primitive" the design notes
//! ask for: the final-check and push-and-notify sequences are the only
//! places a full barrier is needed, and they live here, not duplicated at
//! call sites.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::abi::Abi;
use crate::canonical::{CanonicalRequest, CanonicalResponse, ParseError};

/// One ring entry as decoded by [`Ring::read_requests`].
#[derive(Debug)]
pub struct DecodedSlot {
    pub id: u64,
    pub op_byte: u8,
    pub result: Result<CanonicalRequest, ParseError>,
}

/// The four indices that live in the guest-visible ring header. In the
/// real worker this is a view over grant-mapped memory (constructed by
/// `tap-xenio`); tests construct it as a plain heap value.
///
/// Layout mirrors Xen's generic `sring` header: `req_prod`/`req_event` are
/// the request producer/threshold pair, `rsp_prod`/`rsp_event` the
/// response producer/threshold pair.
#[repr(C)]
#[derive(Default)]
pub struct RingIndices {
    pub req_prod: AtomicU32,
    pub req_event: AtomicU32,
    pub rsp_prod: AtomicU32,
    pub rsp_event: AtomicU32,
}

/// Ring entry count and per-ABI entry stride, plus the private
/// (non-shared) consumer/producer cursors the daemon alone owns.
pub struct Ring<'a> {
    abi: Abi,
    size: u32,
    entry_stride: usize,
    entries: &'a mut [u8],
    indices: &'a RingIndices,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl<'a> Ring<'a> {
    /// `entries` must be at least `size * entry_stride(abi)` bytes, where
    /// `size` is a power of two (see [`crate::constants::ring_entries`]).
    pub fn new(abi: Abi, size: u32, entries: &'a mut [u8], indices: &'a RingIndices) -> Self {
        Self::resume(abi, size, entries, indices, 0, 0)
    }

    /// Like [`Ring::new`], but picks the private consumer/producer cursors
    /// back up where a previous `Ring` over the same memory left off. The
    /// ring object itself is a thin, short-lived borrow; owners (e.g.
    /// [`crate::blkif`]... no such module here, see `tap-xenio::Blkif`)
    /// persist `req_cons`/`rsp_prod_pvt` between calls and resume from
    /// them.
    pub fn resume(
        abi: Abi,
        size: u32,
        entries: &'a mut [u8],
        indices: &'a RingIndices,
        req_cons: u32,
        rsp_prod_pvt: u32,
    ) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        let entry_stride = abi.request_size().max(abi.response_size());
        assert!(entries.len() >= size as usize * entry_stride);
        Ring {
            abi,
            size,
            entry_stride,
            entries,
            indices,
            req_cons,
            rsp_prod_pvt,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn rsp_prod_pvt(&self) -> u32 {
        self.rsp_prod_pvt
    }

    fn slot_bytes(&self, idx: u32) -> &[u8] {
        let slot = (idx & (self.size - 1)) as usize;
        let off = slot * self.entry_stride;
        &self.entries[off..off + self.entry_stride]
    }

    fn slot_bytes_mut(&mut self, idx: u32) -> &mut [u8] {
        let slot = (idx & (self.size - 1)) as usize;
        let off = slot * self.entry_stride;
        &mut self.entries[off..off + self.entry_stride]
    }

    pub fn req_cons(&self) -> u32 {
        self.req_cons
    }

    /// `RING_HAS_UNCONSUMED_REQUESTS`.
    pub fn has_unconsumed_requests(&self) -> bool {
        let req_prod = self.indices.req_prod.load(Ordering::Acquire);
        req_prod != self.req_cons
    }

    /// Spec §4.1 request retrieval, steps 1-3: snapshot `req_prod`, read
    /// barrier, decode up to `max` requests starting at the stored
    /// `req_cons`, advance `req_cons`. Appends one [`DecodedSlot`] per
    /// entry in ring order; `id`/`op_byte` are captured even on parse
    /// failure so the caller can echo `id` on the `RSP_ERROR` it writes
    /// back (spec §4.1 "Request parse").
    pub fn read_requests(&mut self, max: usize, out: &mut Vec<DecodedSlot>) {
        let req_prod = self.indices.req_prod.load(Ordering::Acquire);
        let mut n = 0;
        while self.req_cons != req_prod && n < max {
            let bytes = self.slot_bytes(self.req_cons);
            let (id, op_byte) = self.abi.peek_id_and_op(bytes);
            let result = self.abi.decode_request(bytes);
            out.push(DecodedSlot { id, op_byte, result });
            self.req_cons = self.req_cons.wrapping_add(1);
            n += 1;
        }
    }

    /// Spec §4.1 step 4, "final check for requests": advance the event
    /// index, then re-check the producer. Returns `true` if more requests
    /// are now available (caller should loop per spec).
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.has_unconsumed_requests() {
            return true;
        }
        self.indices
            .req_event
            .store(self.req_cons.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.has_unconsumed_requests()
    }

    /// Encodes one response at the next private response slot. Does not
    /// publish it yet; see [`Ring::push_responses_and_check_notify`].
    pub fn put_response(&mut self, resp: &CanonicalResponse) {
        let idx = self.rsp_prod_pvt;
        let bytes = self.slot_bytes_mut(idx);
        self.abi.encode_response(resp, bytes);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Spec §4.1 "response submission", the batch-final step: write
    /// barrier, publish `rsp_prod`, full barrier, then decide whether the
    /// event channel should be raised by comparing against `rsp_event`.
    /// At most one notify is computed per call, matching the "one kick
    /// per wake-up" contract (§5).
    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let old = self.indices.rsp_prod.load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        if new == old {
            // nothing produced this batch; never notify (§8 invariant).
            return false;
        }
        fence(Ordering::Release);
        self.indices.rsp_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        let rsp_event = self.indices.rsp_event.load(Ordering::Relaxed);
        new.wrapping_sub(rsp_event) < new.wrapping_sub(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{BlkifOp, RspStatus};

    fn new_ring(abi: Abi, order: u8) -> (Vec<u8>, RingIndices) {
        let size = crate::constants::ring_entries(order, abi.request_size().max(abi.response_size()));
        let stride = abi.request_size().max(abi.response_size());
        (vec![0u8; size * stride], RingIndices::default())
    }

    #[test]
    fn rsp_prod_never_decreases_and_req_cons_advances() {
        let abi = Abi::Native;
        let (mut buf, idx) = new_ring(abi, 0);
        let size = crate::constants::ring_entries(0, abi.request_size().max(abi.response_size())) as u32;
        idx.req_prod.store(3, Ordering::Relaxed);

        let mut ring = Ring::new(abi, size, &mut buf, &idx);
        let mut out: Vec<DecodedSlot> = Vec::new();
        ring.read_requests(10, &mut out);
        assert_eq!(ring.req_cons(), 3);

        for i in 0..3 {
            ring.put_response(&CanonicalResponse {
                id: i,
                op: BlkifOp::Read,
                status: RspStatus::Okay,
            });
        }
        assert!(ring.push_responses_and_check_notify());
        assert_eq!(idx.rsp_prod.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn no_notify_when_nothing_produced() {
        let abi = Abi::Native;
        let (mut buf, idx) = new_ring(abi, 0);
        let size = crate::constants::ring_entries(0, abi.request_size().max(abi.response_size())) as u32;
        let mut ring = Ring::new(abi, size, &mut buf, &idx);
        assert!(!ring.push_responses_and_check_notify());
    }

    #[test]
    fn final_check_loops_when_guest_raced_in_a_request() {
        let abi = Abi::Native;
        let (mut buf, idx) = new_ring(abi, 0);
        let size = crate::constants::ring_entries(0, abi.request_size().max(abi.response_size())) as u32;
        let mut ring = Ring::new(abi, size, &mut buf, &idx);

        // no requests yet
        assert!(!ring.final_check_for_requests());

        // guest publishes a request "between" our drain and our final check
        idx.req_prod.store(1, Ordering::Relaxed);
        assert!(ring.final_check_for_requests());
    }
}
