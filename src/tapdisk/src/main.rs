//! The tap worker process (spec §3 "Tap (worker) descriptor", §4.4): owns
//! exactly one VBD, the blkif(s) connected to it, and the control socket
//! the broker drives it through. One process per served virtual disk,
//! matching blktap3's own process-per-tapdisk model.

use std::cell::RefCell;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;

use tap_ring::Abi;
use tap_types::{DevId, DomId, EvtchnPort, GrantRef};
use tap_vbd::{MemImage, SecondaryMode, Vbd};
use tap_xenio::{Blkif, IoContext, PooledTransport, TransportRegistry};

use tap_ctl_proto::{
    read_frame, write_frame, BlkifPayload, Frame, ImagePayload, MinorsPayload, MsgType, OpenFlags,
    ParamsPayload, PidPayload, ResponsePayload, CONTROL_DIR, PATH_MAX,
};

/// Arbitrary fixed backing size for the in-memory test image chain (spec
/// §1 Non-goals excludes implementing a concrete on-disk format; see
/// `tap_vbd::MemImage`).
const MEM_IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const SECTOR_SIZE: u64 = tap_ring::constants::SECTOR_SIZE;

#[derive(Parser)]
#[command(about = "blktap3-style per-VBD I/O worker")]
struct Cli {
    /// Minor number this worker will eventually be attached to (informational
    /// until `ATTACH`).
    #[arg(short = 'm', long)]
    minor: Option<u32>,

    #[arg(long, default_value = CONTROL_DIR)]
    control_dir: PathBuf,
}

struct ConnectedBlkif {
    io_ctx_event: tap_sched::EventId,
}

struct Worker {
    minor: Option<u32>,
    transport_registry: TransportRegistry,
    transport: PooledTransport,
    vbd: Option<Vbd>,
    disk_sectors: u64,
    connected: Option<ConnectedBlkif>,
    should_exit: bool,
}

impl Worker {
    fn new() -> Self {
        let transport_registry = TransportRegistry::new();
        let transport = transport_registry.acquire(tap_xenio::DEFAULT_POOL, || tap_xenio::Transport {
            grants: Box::new(tap_xenio::transport::fake::FakeGrantMapper),
            events: Box::new(tap_xenio::transport::fake::FakeEventChannel::new().expect("socketpair")),
        });
        Worker {
            minor: None,
            transport_registry,
            transport,
            vbd: None,
            disk_sectors: 0,
            connected: None,
            should_exit: false,
        }
    }

    fn tick(&mut self) {
        if let Some(vbd) = self.vbd.as_mut() {
            vbd.tick(Instant::now());
        }
    }
}

/// Dispatches one request frame against `worker`'s state (spec §4.4:
/// "server dispatches each frame to the VBD engine through an in-process
/// API"). Takes the shared handle (not just `&mut Worker`) because the
/// `XENBLKIF_CONNECT` branch needs to capture it into a scheduler
/// callback that outlives this call.
fn dispatch(worker: &Rc<RefCell<Worker>>, sched: &mut tap_sched::Scheduler, req: Frame) -> Option<Frame> {
    let msg_type = match req.msg_type() {
        Ok(t) => t,
        Err(e) => return Some(tap_ctl_proto::error_response(&req, e)),
    };
    match msg_type {
        MsgType::Pid => {
            let mut resp = Frame::new(MsgType::PidRsp, req.header.cookie);
            resp.set_payload(&PidPayload {
                pid: std::process::id() as i32,
            });
            Some(resp)
        }
        MsgType::Attach => {
            let payload: ParamsPayload = req.payload_as();
            worker.borrow_mut().minor = Some(payload.devnum);
            Some(Frame::new(MsgType::AttachRsp, req.header.cookie))
        }
        MsgType::Detach => {
            worker.borrow_mut().minor = None;
            Some(Frame::new(MsgType::DetachRsp, req.header.cookie))
        }
        MsgType::Open => {
            let payload: ParamsPayload = req.payload_as();
            let flags = OpenFlags::from_bits_truncate(payload.flags);
            let path = tap_ctl_proto::unpack_path(&payload.path);
            tracing::info!(path, flags = ?flags, "opening image chain");

            let primary = MemImage::new(MEM_IMAGE_BYTES as usize);
            let mut vbd = Vbd::new(path.clone(), [0u8; 16], Box::new(primary));
            if flags.contains(OpenFlags::SECONDARY) {
                let secondary = MemImage::new(MEM_IMAGE_BYTES as usize);
                let mode = if flags.contains(OpenFlags::STANDBY) {
                    SecondaryMode::Standby
                } else {
                    SecondaryMode::Mirror
                };
                vbd = vbd.with_secondary(mode, Box::new(secondary));
            }
            let mut w = worker.borrow_mut();
            w.disk_sectors = MEM_IMAGE_BYTES / SECTOR_SIZE;
            w.vbd = Some(vbd);
            Some(Frame::new(MsgType::OpenRsp, req.header.cookie))
        }
        MsgType::Close => {
            let mut w = worker.borrow_mut();
            if let Some(vbd) = w.vbd.as_mut() {
                vbd.kill_queue();
            }
            if let Some(connected) = w.connected.take() {
                sched.unregister_event(connected.io_ctx_event);
            }
            w.vbd = None;
            Some(Frame::new(MsgType::CloseRsp, req.header.cookie))
        }
        MsgType::Pause => {
            if let Some(vbd) = worker.borrow_mut().vbd.as_mut() {
                vbd.request_pause();
            }
            Some(Frame::new(MsgType::PauseRsp, req.header.cookie))
        }
        MsgType::Resume => {
            if let Some(vbd) = worker.borrow_mut().vbd.as_mut() {
                vbd.resume();
            }
            Some(Frame::new(MsgType::ResumeRsp, req.header.cookie))
        }
        MsgType::DiskInfo => {
            let w = worker.borrow();
            let mut resp = Frame::new(MsgType::DiskInfoRsp, req.header.cookie);
            resp.set_payload(&ImagePayload {
                sectors: w.disk_sectors,
                sector_size: SECTOR_SIZE as u32,
                info: 0,
            });
            Some(resp)
        }
        MsgType::ListMinors => {
            let w = worker.borrow();
            let mut resp = Frame::new(MsgType::ListMinorsRsp, req.header.cookie);
            let mut payload = MinorsPayload {
                count: 0,
                list: [0; tap_ctl_proto::MINORS_MAX],
            };
            if let Some(m) = w.minor {
                payload.count = 1;
                payload.list[0] = m as i32;
            }
            resp.set_payload(&payload);
            Some(resp)
        }
        MsgType::Stats => {
            let w = worker.borrow();
            let mut resp = Frame::new(MsgType::StatsRsp, req.header.cookie);
            let (new, pending, failed) = w
                .vbd
                .as_ref()
                .map(|v| v.queue_depths())
                .unwrap_or((0, 0, 0));
            let mut message = [0u8; PATH_MAX];
            let text = format!("new={new} pending={pending} failed={failed}");
            let n = text.len().min(PATH_MAX - 1);
            message[..n].copy_from_slice(&text.as_bytes()[..n]);
            resp.set_payload(&ResponsePayload { error: 0, message });
            Some(resp)
        }
        MsgType::XenblkifConnect => {
            let payload: BlkifPayload = req.payload_as();
            let abi = match payload.proto {
                1 => Abi::X86_32,
                2 => Abi::X86_64,
                _ => Abi::Native,
            };
            let n_pages = tap_ring::constants::ring_pages(payload.order as u8);
            let grefs: Vec<GrantRef> = payload.gref[..n_pages.min(tap_ctl_proto::GREF_MAX)]
                .iter()
                .map(|g| GrantRef::new(*g))
                .collect();

            let transport = worker.borrow().transport.clone();
            match Blkif::connect(
                transport.clone(),
                DomId::new(payload.domid as u16),
                DevId::new(payload.devid),
                &grefs,
                EvtchnPort::new(payload.port),
                abi,
                payload.order as u8,
            ) {
                Ok(blkif) => {
                    let local_port = blkif.local_port();
                    let mut io_ctx = IoContext::new(transport);
                    io_ctx.add(blkif);
                    let fd = io_ctx.fd();
                    let io_ctx = Rc::new(RefCell::new(io_ctx));

                    let worker_for_cb = worker.clone();
                    let event = sched
                        .register_read_fd(fd, move |_sched| {
                            let mut w = worker_for_cb.borrow_mut();
                            if let Some(vbd) = w.vbd.as_mut() {
                                io_ctx.borrow().dispatch_ready(vbd);
                            }
                            w.tick();
                        })
                        .expect("registering blkif event-channel fd");

                    worker.borrow_mut().connected = Some(ConnectedBlkif { io_ctx_event: event });

                    let mut resp = Frame::new(MsgType::XenblkifConnectRsp, req.header.cookie);
                    resp.set_payload(&BlkifPayload {
                        port: local_port.get(),
                        ..payload
                    });
                    Some(resp)
                }
                Err(e) => Some(tap_ctl_proto::error_response(&req, tap_xenio::to_neg_errno(&e))),
            }
        }
        MsgType::XenblkifDisconnect => {
            let mut w = worker.borrow_mut();
            if let Some(connected) = w.connected.take() {
                sched.unregister_event(connected.io_ctx_event);
            }
            w.transport_registry.reap();
            Some(Frame::new(MsgType::XenblkifDisconnectRsp, req.header.cookie))
        }
        MsgType::List => {
            // This worker serves exactly one VBD; a single terminal frame
            // (`count=0`) is the whole stream (spec §6.2 "streamed: final
            // frame has count=0").
            let w = worker.borrow();
            let mut resp = Frame::new(MsgType::ListRsp, req.header.cookie);
            resp.set_payload(&tap_ctl_proto::ListPayload {
                count: 0,
                minor: w.minor.map(|m| m as i32).unwrap_or(-1),
                state: 0,
                path: [0u8; PATH_MAX],
            });
            Some(resp)
        }
        MsgType::ForceShutdown => {
            let mut w = worker.borrow_mut();
            if let Some(vbd) = w.vbd.as_mut() {
                vbd.kill_queue();
            }
            w.should_exit = true;
            None
        }
        MsgType::Exit => {
            worker.borrow_mut().should_exit = true;
            None
        }
        MsgType::ListRsp
        | MsgType::Error
        | MsgType::PidRsp
        | MsgType::AttachRsp
        | MsgType::OpenRsp
        | MsgType::PauseRsp
        | MsgType::ResumeRsp
        | MsgType::CloseRsp
        | MsgType::DetachRsp
        | MsgType::ListMinorsRsp
        | MsgType::StatsRsp
        | MsgType::DiskInfoRsp
        | MsgType::XenblkifConnectRsp
        | MsgType::XenblkifDisconnectRsp => Some(tap_ctl_proto::error_response(
            &req,
            tap_types::NegErrno::from_errno(libc::EINVAL),
        )),
    }
}

fn handle_connection(sched: &mut tap_sched::Scheduler, worker: &Rc<RefCell<Worker>>, mut stream: UnixStream) {
    let Ok(req) = read_frame(&mut stream) else {
        return;
    };
    let response = dispatch(worker, sched, req);
    if let Some(resp) = response {
        let _ = write_frame(&mut stream, &resp);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.control_dir)?;
    let sock_path = tap_ctl_proto::socket_path(&cli.control_dir, std::process::id() as i32);
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;
    listener.set_nonblocking(true)?;

    let mut sched = tap_sched::Scheduler::new()?;
    let worker = Rc::new(RefCell::new(Worker::new()));
    worker.borrow_mut().minor = cli.minor;

    {
        let worker = worker.clone();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&listener);
        sched.register_read_fd(fd, move |sched| loop {
            match listener.accept() {
                Ok((stream, _)) => handle_connection(sched, &worker, stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "control socket accept failed");
                    break;
                }
            }
        })?;
    }

    // Drives request-queue retry/timeout/lifecycle bookkeeping even when
    // no blkif fd woke the loop (spec §4.3's backoff sweep needs a clock,
    // not just fd readiness).
    fn reschedule_tick(sched: &mut tap_sched::Scheduler, worker: Rc<RefCell<Worker>>) {
        worker.borrow_mut().tick();
        let next = worker.clone();
        sched.register_timeout(Duration::from_millis(250), move |sched_inner| {
            reschedule_tick(sched_inner, next.clone());
        });
    }
    reschedule_tick(&mut sched, worker.clone());

    sched.run_until(|| worker.borrow().should_exit)?;
    let _ = std::fs::remove_file(&sock_path);
    Ok(())
}
