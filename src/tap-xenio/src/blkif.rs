//! Component C: one connected guest ring (spec §3 "Block interface
//! (blkif)", §4.2). Owns the ring mapping, event port, request slab, and
//! statistics; drives `tap-ring`'s decode/encode/barrier primitives and
//! submits decoded requests into a VBD via [`VbdSink`].

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use smallvec::SmallVec;

use tap_ring::{
    coalesce_iovecs, Abi, BlkifOp, CanonicalResponse, DecodedSlot, Ring, RingIndices, RspStatus,
};
use tap_types::{DevId, DomId, EvtchnPort, GrantRef, NegErrno};
use tap_vbd::{IoVecRaw, VbdRequest, VbdToken, BLKIF_MAX_SEGMENTS_PER_REQUEST};

use crate::pool::PooledTransport;
use crate::transport::{to_neg_errno, MapProt};

/// What `queue_requests` hands decoded, grant-mapped requests to. `Vbd`
/// implements this directly (below); tests can swap in a recording
/// double.
pub trait VbdSink {
    fn submit(&mut self, req: VbdRequest);
}

impl VbdSink for tap_vbd::Vbd {
    fn submit(&mut self, req: VbdRequest) {
        tap_vbd::Vbd::submit(self, req);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlkifStats {
    pub reqs: u64,
    pub parse_errors: u64,
    pub map_errors: u64,
    pub notifies: u64,
}

struct SlotMeta {
    id: u64,
    op: BlkifOp,
    vma: Option<crate::transport::MappedVma>,
}

struct BlkifInner {
    remote_domid: DomId,
    devid: DevId,
    remote_port: EvtchnPort,
    local_port: EvtchnPort,
    abi: Abi,
    ring_size: u32,
    ring_vma: crate::transport::MappedVma,
    indices: RingIndices,
    req_cons: u32,
    rsp_prod_pvt: u32,
    free: Vec<usize>,
    slots: Vec<Option<SlotMeta>>,
    transport: PooledTransport,
    stats: BlkifStats,
}

fn build_ring<'a>(
    abi: Abi,
    ring_size: u32,
    ring_vma: &'a mut crate::transport::MappedVma,
    indices: &'a RingIndices,
    req_cons: u32,
    rsp_prod_pvt: u32,
) -> Ring<'a> {
    Ring::resume(abi, ring_size, ring_vma.as_mut_slice(), indices, req_cons, rsp_prod_pvt)
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One connected blkif. Cheap to clone (shares the same inner state);
/// clones are how completion callbacks keep a handle back into the ring
/// without borrowing across the scheduler's callback boundary (spec §5:
/// "no locks are required within a process" — single-threaded
/// cooperative, so `Rc<RefCell<_>>` is sufficient, matching the idiom
/// `tap-sched`'s own tests use for callback-shared state).
#[derive(Clone)]
pub struct Blkif {
    inner: Rc<RefCell<BlkifInner>>,
    token: VbdToken,
}

impl Blkif {
    /// Binds the local event port, maps the ring pages (`gref`, one per
    /// `2^order`), and returns a blkif ready to drain (spec §3, §6.2
    /// `XENBLKIF_CONNECT`).
    pub fn connect(
        transport: PooledTransport,
        remote_domid: DomId,
        devid: DevId,
        gref: &[GrantRef],
        remote_port: EvtchnPort,
        abi: Abi,
        order: u8,
    ) -> io::Result<Self> {
        let entry_stride = abi.request_size().max(abi.response_size());
        let ring_size = tap_ring::constants::ring_entries(order, entry_stride) as u32;

        let ring_vma = transport.grants.map(remote_domid, gref, MapProt::ReadWrite)?;
        let local_port = transport.events.bind_interdomain(remote_domid, remote_port)?;

        let n = ring_size as usize;
        let inner = BlkifInner {
            remote_domid,
            devid,
            remote_port,
            local_port,
            abi,
            ring_size,
            ring_vma,
            indices: RingIndices::default(),
            req_cons: 0,
            rsp_prod_pvt: 0,
            free: (0..n).collect(),
            slots: (0..n).map(|_| None).collect(),
            transport,
            stats: BlkifStats::default(),
        };

        Ok(Blkif {
            inner: Rc::new(RefCell::new(inner)),
            token: VbdToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)),
        })
    }

    pub fn token(&self) -> VbdToken {
        self.token
    }

    pub fn devid(&self) -> DevId {
        self.inner.borrow().devid
    }

    pub fn local_port(&self) -> EvtchnPort {
        self.inner.borrow().local_port
    }

    pub fn stats(&self) -> BlkifStats {
        self.inner.borrow().stats
    }

    /// Spec §3 invariant: no in-flight requests. Checked before a blkif
    /// may be torn down (`-EBUSY` otherwise, spec §8 "Disconnect returns
    /// `-EBUSY` if called while `n_reqs_free < ring_size`").
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.free.len() == inner.slots.len()
    }

    pub fn disconnect(&self) -> Result<(), NegErrno> {
        if !self.is_idle() {
            return Err(NegErrno::from_errno(libc::EBUSY));
        }
        let inner = self.inner.borrow();
        let _ = inner.transport.events.unbind(inner.local_port);
        Ok(())
    }

    /// Spec §4.2: drains the ring in a loop, decoding/mapping/submitting
    /// each request; reports parse/map failures immediately with
    /// `RSP_ERROR`, defers the batch's notify to the end of the loop (one
    /// kick per wake-up).
    pub fn queue_requests(&self, sink: &mut dyn VbdSink) {
        loop {
            let free_count = self.inner.borrow().free.len();
            if free_count == 0 {
                break;
            }

            let decoded: Vec<DecodedSlot> = {
                let mut inner = self.inner.borrow_mut();
                let BlkifInner {
                    ring_vma,
                    indices,
                    abi,
                    ring_size,
                    req_cons,
                    rsp_prod_pvt,
                    ..
                } = &mut *inner;
                let mut ring = build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
                let mut out = Vec::new();
                ring.read_requests(free_count, &mut out);
                *req_cons = ring.req_cons();
                out
            };

            if decoded.is_empty() {
                let more = self.final_check();
                if !more {
                    break;
                }
                continue;
            }

            for slot in decoded {
                self.handle_decoded(slot, sink);
            }

            if !self.final_check() {
                break;
            }
        }

        self.publish_and_notify();
    }

    fn final_check(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        let BlkifInner {
            ring_vma,
            indices,
            abi,
            ring_size,
            req_cons,
            rsp_prod_pvt,
            ..
        } = &mut *inner;
        let mut ring = build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
        let more = ring.final_check_for_requests();
        *rsp_prod_pvt = ring.rsp_prod_pvt();
        more
    }

    fn handle_decoded(&self, slot: DecodedSlot, sink: &mut dyn VbdSink) {
        match slot.result {
            Err(parse_err) => {
                tracing::debug!(id = slot.id, error = %parse_err, "malformed ring request");
                self.inner.borrow_mut().stats.parse_errors += 1;
                self.write_error(slot.id, op_from_byte(slot.op_byte));
            }
            Ok(creq) => {
                let refs: Vec<GrantRef> = creq.segments.iter().map(|s| s.gref).collect();
                let prot = match creq.op {
                    BlkifOp::Read => MapProt::ReadWrite,
                    BlkifOp::Write => MapProt::ReadOnly,
                };
                let map_result = {
                    let inner = self.inner.borrow();
                    inner.transport.grants.map(inner.remote_domid, &refs, prot)
                };
                match map_result {
                    Ok(vma) => {
                        let spans = coalesce_iovecs(&creq.segments);
                        let base = vma.as_ptr();
                        let mut iovecs: SmallVec<[IoVecRaw; BLKIF_MAX_SEGMENTS_PER_REQUEST]> =
                            SmallVec::new();
                        for span in spans.iter() {
                            iovecs.push(unsafe { IoVecRaw::new(base.add(span.offset), span.len) });
                        }

                        let slot_idx = {
                            let mut inner = self.inner.borrow_mut();
                            let idx = inner.free.pop().expect("free_count checked by caller");
                            inner.slots[idx] = Some(SlotMeta {
                                id: creq.id,
                                op: creq.op,
                                vma: Some(vma),
                            });
                            inner.stats.reqs += 1;
                            idx
                        };

                        let req = VbdRequest {
                            op: creq.op,
                            iovecs,
                            offset: creq.offset,
                            name: [0u8; 16],
                            retries: 0,
                            last_error: None,
                            submitted_at: Instant::now(),
                            token: self.token,
                            callback: self.make_completion_cb(slot_idx),
                        };
                        sink.submit(req);
                    }
                    Err(e) => {
                        tracing::warn!(id = creq.id, errno = %to_neg_errno(&e), "grant map failed");
                        self.inner.borrow_mut().stats.map_errors += 1;
                        self.write_error(creq.id, creq.op);
                    }
                }
            }
        }
    }

    fn write_error(&self, id: u64, op: BlkifOp) {
        let mut inner = self.inner.borrow_mut();
        let BlkifInner {
            ring_vma,
            indices,
            abi,
            ring_size,
            req_cons,
            rsp_prod_pvt,
            ..
        } = &mut *inner;
        let mut ring = build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
        ring.put_response(&CanonicalResponse {
            id,
            op,
            status: RspStatus::Error,
        });
        *rsp_prod_pvt = ring.rsp_prod_pvt();
    }

    fn publish_and_notify(&self) {
        let should_notify = {
            let mut inner = self.inner.borrow_mut();
            let BlkifInner {
                ring_vma,
                indices,
                abi,
                ring_size,
                req_cons,
                rsp_prod_pvt,
                ..
            } = &mut *inner;
            let mut ring = build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
            let notify = ring.push_responses_and_check_notify();
            *rsp_prod_pvt = ring.rsp_prod_pvt();
            notify
        };
        if should_notify {
            let inner = self.inner.borrow();
            let _ = inner.transport.events.notify(inner.local_port);
            drop(inner);
            self.inner.borrow_mut().stats.notifies += 1;
        }
    }

    fn make_completion_cb(&self, slot_idx: usize) -> tap_vbd::CompletionCb {
        let inner = self.inner.clone();
        Box::new(move |err, _token, is_final| {
            {
                let mut guard = inner.borrow_mut();
                let slot = guard.slots[slot_idx].take().expect("slot must be occupied on completion");
                let resp = CanonicalResponse {
                    id: slot.id,
                    op: slot.op,
                    status: if err.is_ok() { RspStatus::Okay } else { RspStatus::Error },
                };
                // `slot.vma` drops here, unmapping the grant before the
                // response it backed is even published (spec §9
                // "ownership of mapped grant VMAs").
                drop(slot.vma);

                let BlkifInner {
                    ring_vma,
                    indices,
                    abi,
                    ring_size,
                    req_cons,
                    rsp_prod_pvt,
                    free,
                    ..
                } = &mut *guard;
                let mut ring =
                    build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
                ring.put_response(&resp);
                *rsp_prod_pvt = ring.rsp_prod_pvt();
                free.push(slot_idx);
            }

            if is_final {
                let should_notify = {
                    let mut guard = inner.borrow_mut();
                    let BlkifInner {
                        ring_vma,
                        indices,
                        abi,
                        ring_size,
                        req_cons,
                        rsp_prod_pvt,
                        ..
                    } = &mut *guard;
                    let mut ring =
                        build_ring(*abi, *ring_size, ring_vma, indices, *req_cons, *rsp_prod_pvt);
                    let notify = ring.push_responses_and_check_notify();
                    *rsp_prod_pvt = ring.rsp_prod_pvt();
                    notify
                };
                if should_notify {
                    let guard = inner.borrow();
                    let _ = guard.transport.events.notify(guard.local_port);
                    drop(guard);
                    inner.borrow_mut().stats.notifies += 1;
                }
            }
        })
    }
}

fn op_from_byte(b: u8) -> BlkifOp {
    match b {
        1 => BlkifOp::Write,
        _ => BlkifOp::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PooledTransport, TransportRegistry};
    use crate::transport::fake::{FakeEventChannel, FakeGrantMapper};
    use crate::transport::Transport;
    use tap_vbd::{NullImage, Vbd};

    fn transport() -> PooledTransport {
        let reg = Box::leak(Box::new(TransportRegistry::new()));
        reg.acquire("test", || Transport {
            grants: Box::new(FakeGrantMapper),
            events: Box::new(FakeEventChannel::new().unwrap()),
        })
    }

    #[test]
    fn connect_starts_fully_idle() {
        let blkif = Blkif::connect(
            transport(),
            DomId::new(3),
            DevId::new(51712),
            &[GrantRef::new(100)],
            EvtchnPort::new(7),
            Abi::X86_64,
            0,
        )
        .unwrap();
        assert!(blkif.is_idle());
    }

    #[test]
    fn disconnect_busy_when_not_idle() {
        let blkif = Blkif::connect(
            transport(),
            DomId::new(3),
            DevId::new(51712),
            &[GrantRef::new(100)],
            EvtchnPort::new(7),
            Abi::X86_64,
            0,
        )
        .unwrap();
        blkif.inner.borrow_mut().free.pop();
        assert_eq!(blkif.disconnect().unwrap_err(), NegErrno::from_errno(libc::EBUSY));
    }

    #[test]
    fn queue_requests_with_no_ring_traffic_does_not_notify() {
        let blkif = Blkif::connect(
            transport(),
            DomId::new(3),
            DevId::new(51712),
            &[GrantRef::new(100)],
            EvtchnPort::new(7),
            Abi::X86_64,
            0,
        )
        .unwrap();
        let mut vbd = Vbd::new("u1", [0u8; 16], Box::new(NullImage));
        blkif.queue_requests(&mut vbd);
        assert_eq!(blkif.stats().notifies, 0);
    }
}
