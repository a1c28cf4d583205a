//! Component A: event-channel and grant-table handles.
//!
//! The real backends talk to `/dev/xen/gntdev` and `/dev/xen/evtchn`
//! through `ioctl`s; since this is a user-space daemon (not a Xen guest
//! agent running under an actual hypervisor), the exact ioctl numbers are
//! an external contract this workspace does not fabricate. `GrantMapper`
//! and `EventChannel` are the seams: a real `/dev/xen/*`-backed
//! implementation plugs in at the binary crates, and an in-process fake
//! (below) lets every other component be exercised without a hypervisor,
//! the same separation the teacher keeps between `filemap::MappedFile`
//! (real mmap) and the devices it backs.

use std::io;
use std::os::fd::RawFd;

use nix::errno::Errno;
use tap_types::{DomId, EvtchnPort, GrantRef, NegErrno};

/// A single contiguous mapping of `n` grant-referenced pages.
pub struct MappedVma {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MappedVma {}

impl MappedVma {
    /// # Safety
    /// `ptr` must point to a live mapping of at least `len` bytes that
    /// this `MappedVma` now exclusively owns (it will `munmap` it on
    /// drop).
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        MappedVma { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Safe, bounds-checked byte slice over the mapping.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedVma {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let ret = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "munmap of grant VMA failed");
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapProt {
    ReadOnly,
    ReadWrite,
}

/// Maps/unmaps grant references from a remote domain. §4.1: "map its
/// `n_segs` grant references from the remote domain into a single
/// contiguous VMA ... with read+write protection for READ requests and
/// read-only for WRITE requests (the guest is the writer on reads)".
pub trait GrantMapper {
    fn map(&self, domid: DomId, refs: &[GrantRef], prot: MapProt) -> io::Result<MappedVma>;
}

/// Binds/unbinds inter-domain event-channel ports and signals them. A
/// single `fd()` is pollable for readiness (spec §4.2/D: "The I/O context
/// is the single event-channel-fd owner").
pub trait EventChannel {
    fn bind_interdomain(&self, remote_dom: DomId, remote_port: EvtchnPort) -> io::Result<EvtchnPort>;
    fn unbind(&self, local_port: EvtchnPort) -> io::Result<()>;
    fn notify(&self, local_port: EvtchnPort) -> io::Result<()>;
    fn unmask(&self, local_port: EvtchnPort) -> io::Result<()>;

    /// Pops the next ready port from the kernel driver's pending queue,
    /// if any (§4.2: "polls `pending` to obtain the next ready port").
    fn pending(&self) -> io::Result<Option<EvtchnPort>>;

    fn fd(&self) -> RawFd;
}

/// Groups a `GrantMapper` and an `EventChannel`; this is the process-scoped
/// "transport context" of spec §3, before pool/refcount bookkeeping (see
/// [`crate::pool::TransportRegistry`]).
pub struct Transport {
    pub grants: Box<dyn GrantMapper>,
    pub events: Box<dyn EventChannel>,
}

/// Normalizes an `io::Error` carrying an errno into [`NegErrno`]. Falls
/// back to `EIO` for errors without an OS errno (shouldn't happen for the
/// syscalls this crate makes, but avoids ever fabricating a positive
/// value — Open Question (ii), spec §9).
pub fn to_neg_errno(e: &io::Error) -> NegErrno {
    match e.raw_os_error() {
        Some(errno) => NegErrno::from_errno(errno),
        None => NegErrno::from_errno(libc::EIO),
    }
}

pub mod fake {
    //! An in-process stand-in for `/dev/xen/{gntdev,evtchn}`, used by
    //! scenario tests (spec §8 S1-S6) and by any binary run outside an
    //! actual Xen guest.

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;

    use tap_types::{DomId, EvtchnPort, GrantRef};

    use super::{GrantMapper, MapProt, MappedVma};

    /// Maps grants onto anonymous zeroed memory. Good enough to exercise
    /// the ring/iovec/VBD pipeline end to end without real grant tables.
    pub struct FakeGrantMapper;

    impl GrantMapper for FakeGrantMapper {
        fn map(&self, _domid: DomId, refs: &[GrantRef], _prot: MapProt) -> io::Result<MappedVma> {
            let len = refs.len() * tap_ring::constants::PAGE_SIZE;
            if len == 0 {
                return Ok(unsafe { MappedVma::from_raw(std::ptr::null_mut(), 0) });
            }
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { MappedVma::from_raw(ptr as *mut u8, len) })
        }
    }

    /// A self-signalling event channel: `notify` enqueues the port onto
    /// its own pending queue and writes a byte to an internal socketpair
    /// so `fd()` becomes readable, mimicking the kernel driver waking up
    /// `poll`.
    pub struct FakeEventChannel {
        pending: RefCell<VecDeque<EvtchnPort>>,
        reader: UnixStream,
        writer: UnixStream,
        next_port: RefCell<u32>,
    }

    impl FakeEventChannel {
        pub fn new() -> io::Result<Self> {
            let (reader, writer) = UnixStream::pair()?;
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            Ok(FakeEventChannel {
                pending: RefCell::new(VecDeque::new()),
                reader,
                writer,
                next_port: RefCell::new(1),
            })
        }

        /// Test hook: deliver a "guest wrote the ring" event for `port`.
        pub fn deliver(&self, port: EvtchnPort) {
            self.pending.borrow_mut().push_back(port);
            use std::io::Write;
            let _ = (&self.writer).write_all(&[0u8]);
        }
    }

    impl super::EventChannel for FakeEventChannel {
        fn bind_interdomain(
            &self,
            _remote_dom: DomId,
            _remote_port: EvtchnPort,
        ) -> io::Result<EvtchnPort> {
            let mut n = self.next_port.borrow_mut();
            let port = EvtchnPort::new(*n);
            *n += 1;
            Ok(port)
        }

        fn unbind(&self, _local_port: EvtchnPort) -> io::Result<()> {
            Ok(())
        }

        fn notify(&self, local_port: EvtchnPort) -> io::Result<()> {
            // loopback: in real Xen this signals the *remote* domain; our
            // fake only needs to support tests asserting a notify
            // happened, which they do via a counter at the call site.
            let _ = local_port;
            Ok(())
        }

        fn unmask(&self, _local_port: EvtchnPort) -> io::Result<()> {
            Ok(())
        }

        fn pending(&self) -> io::Result<Option<EvtchnPort>> {
            // drain one byte per call so the fd eventually goes quiet.
            let mut buf = [0u8; 1];
            use std::io::Read;
            let _ = (&self.reader).read(&mut buf);
            Ok(self.pending.borrow_mut().pop_front())
        }

        fn fd(&self) -> RawFd {
            self.reader.as_raw_fd()
        }
    }

    /// Lets a test keep its own handle to [`FakeEventChannel`] (to call
    /// [`FakeEventChannel::deliver`]) while also handing a clone to a
    /// `Transport` as a boxed trait object.
    impl super::EventChannel for std::rc::Rc<FakeEventChannel> {
        fn bind_interdomain(
            &self,
            remote_dom: DomId,
            remote_port: EvtchnPort,
        ) -> io::Result<EvtchnPort> {
            (**self).bind_interdomain(remote_dom, remote_port)
        }

        fn unbind(&self, local_port: EvtchnPort) -> io::Result<()> {
            (**self).unbind(local_port)
        }

        fn notify(&self, local_port: EvtchnPort) -> io::Result<()> {
            (**self).notify(local_port)
        }

        fn unmask(&self, local_port: EvtchnPort) -> io::Result<()> {
            (**self).unmask(local_port)
        }

        fn pending(&self) -> io::Result<Option<EvtchnPort>> {
            (**self).pending()
        }

        fn fd(&self) -> RawFd {
            (**self).fd()
        }
    }
}
