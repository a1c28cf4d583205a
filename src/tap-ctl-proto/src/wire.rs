//! Component G message layer: fixed-size frames over UNIX sockets (spec
//! §6.2, §4.4). One frame per request or response; a connection is
//! `open → write request → read response → close`, one request in
//! flight at a time (spec §4.4 "serial per connection").

use tap_types::NegErrno;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Reserved one byte below the historical 256 so every path buffer is
/// guaranteed NUL-terminated regardless of source length (spec §9 Open
/// Question (iii): `strncpy` into a 256-byte buffer from a 256-byte
/// source does not guarantee termination; this wire layout always
/// leaves the last byte zero).
pub const PATH_MAX: usize = 256;
pub const PATH_USABLE: usize = PATH_MAX - 1;

/// Writes `s` into a fixed `[u8; PATH_MAX]`, truncating to
/// [`PATH_USABLE`] bytes and always leaving a trailing NUL.
pub fn pack_path(s: &str) -> [u8; PATH_MAX] {
    let mut buf = [0u8; PATH_MAX];
    let bytes = s.as_bytes();
    let n = bytes.len().min(PATH_USABLE);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Reads a NUL-terminated (or fully-packed) path back out. Lossy on
/// non-UTF-8 content, which the wire format does not otherwise forbid.
pub fn unpack_path(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum MsgType {
    Pid = 0,
    PidRsp = 1,
    Attach = 2,
    AttachRsp = 3,
    Open = 4,
    OpenRsp = 5,
    Pause = 6,
    PauseRsp = 7,
    Resume = 8,
    ResumeRsp = 9,
    Close = 10,
    CloseRsp = 11,
    Detach = 12,
    DetachRsp = 13,
    ListMinors = 14,
    ListMinorsRsp = 15,
    List = 16,
    ListRsp = 17,
    Stats = 18,
    StatsRsp = 19,
    DiskInfo = 20,
    DiskInfoRsp = 21,
    XenblkifConnect = 22,
    XenblkifConnectRsp = 23,
    XenblkifDisconnect = 24,
    XenblkifDisconnectRsp = 25,
    ForceShutdown = 26,
    Exit = 27,
    Error = 28,
}

impl MsgType {
    /// The response type a request type expects (spec §6.2 pairs table).
    /// `None` for messages with no response (`FORCE_SHUTDOWN`, `EXIT`)
    /// and for response types themselves.
    pub fn expected_response(self) -> Option<MsgType> {
        use MsgType::*;
        match self {
            Pid => Some(PidRsp),
            Attach => Some(AttachRsp),
            Open => Some(OpenRsp),
            Pause => Some(PauseRsp),
            Resume => Some(ResumeRsp),
            Close => Some(CloseRsp),
            Detach => Some(DetachRsp),
            ListMinors => Some(ListMinorsRsp),
            List => Some(ListRsp),
            Stats => Some(StatsRsp),
            DiskInfo => Some(DiskInfoRsp),
            XenblkifConnect => Some(XenblkifConnectRsp),
            XenblkifDisconnect => Some(XenblkifDisconnectRsp),
            _ => None,
        }
    }
}

impl TryFrom<u16> for MsgType {
    type Error = ();

    fn try_from(v: u16) -> Result<Self, ()> {
        use MsgType::*;
        Ok(match v {
            0 => Pid,
            1 => PidRsp,
            2 => Attach,
            3 => AttachRsp,
            4 => Open,
            5 => OpenRsp,
            6 => Pause,
            7 => PauseRsp,
            8 => Resume,
            9 => ResumeRsp,
            10 => Close,
            11 => CloseRsp,
            12 => Detach,
            13 => DetachRsp,
            14 => ListMinors,
            15 => ListMinorsRsp,
            16 => List,
            17 => ListRsp,
            18 => Stats,
            19 => StatsRsp,
            20 => DiskInfo,
            21 => DiskInfoRsp,
            22 => XenblkifConnect,
            23 => XenblkifConnectRsp,
            24 => XenblkifDisconnect,
            25 => XenblkifDisconnectRsp,
            26 => ForceShutdown,
            27 => Exit,
            28 => Error,
            _ => return Err(()),
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct FrameHeader {
    pub msg_type: u16,
    pub cookie: u16,
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct PidPayload {
    pub pid: i32,
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct ImagePayload {
    pub sectors: u64,
    pub sector_size: u32,
    pub info: u32,
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct ParamsPayload {
    pub flags: u32,
    pub devnum: u32,
    pub domid: u32,
    pub path: [u8; PATH_MAX],
    pub prt_devnum: u32,
    pub secondary: [u8; PATH_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct StringPayload {
    pub text: [u8; PATH_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct ResponsePayload {
    /// Always `<= 0` (normalized negative errno) on failure.
    pub error: i32,
    pub message: [u8; PATH_MAX],
}

pub const MINORS_MAX: usize = 63;

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct MinorsPayload {
    pub count: i32,
    pub list: [i32; MINORS_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct ListPayload {
    /// Nonzero except on the final frame of a streamed `LIST_RSP` (spec
    /// §6.2: "streamed: final frame has count=0").
    pub count: i32,
    pub minor: i32,
    pub state: i32,
    pub path: [u8; PATH_MAX],
}

pub const GREF_MAX: usize = 8;

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct BlkifPayload {
    pub domid: u32,
    pub devid: u32,
    pub gref: [u32; GREF_MAX],
    pub order: u32,
    pub proto: u32,
    pub pool: [u8; PATH_MAX],
    pub port: u32,
}

/// Largest variant of the payload union; every frame reserves this much
/// space regardless of its actual type (spec §6.2's union).
pub const PAYLOAD_SIZE: usize = std::mem::size_of::<ParamsPayload>();

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: [u8; PAYLOAD_SIZE],
}

pub const FRAME_SIZE: usize = std::mem::size_of::<FrameHeader>() + PAYLOAD_SIZE;

/// Explicit frame-length prefix ahead of the fixed `type`/`cookie`/payload
/// struct (spec §4.4 "framed, fixed-size messages"; this crate's own
/// expanded spec note on the wire format keeps the framing
/// forward-compatible with a payload whose size might one day vary,
/// rather than relying on the reader already knowing `FRAME_SIZE`).
pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

impl Frame {
    pub fn new(msg_type: MsgType, cookie: u16) -> Self {
        Frame {
            header: FrameHeader {
                msg_type: msg_type as u16,
                cookie,
            },
            payload: [0u8; PAYLOAD_SIZE],
        }
    }

    pub fn msg_type(&self) -> Result<MsgType, tap_types::NegErrno> {
        MsgType::try_from(self.header.msg_type).map_err(|_| NegErrno::from_errno(libc::EINVAL))
    }

    pub fn set_payload<T: AsBytes>(&mut self, payload: &T) {
        let bytes = payload.as_bytes();
        assert!(bytes.len() <= PAYLOAD_SIZE, "payload larger than frame reserves");
        self.payload[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn payload_as<T: FromBytes>(&self) -> T {
        T::read_from_prefix(&self.payload[..]).expect("payload buffer is always frame-sized")
    }

    /// Wire representation: a `u32` length prefix (the byte count of
    /// everything that follows) ahead of the fixed `header`/`payload`
    /// body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + FRAME_SIZE);
        out.extend_from_slice(&(FRAME_SIZE as u32).to_ne_bytes());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Inverse of [`Frame::to_bytes`]. Rejects a length prefix that
    /// doesn't match this version's `FRAME_SIZE` rather than trusting the
    /// body bytes that follow it.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LENGTH_PREFIX_SIZE + FRAME_SIZE {
            return None;
        }
        let len = u32::from_ne_bytes(bytes[..LENGTH_PREFIX_SIZE].try_into().ok()?);
        if len as usize != FRAME_SIZE {
            return None;
        }
        let body = &bytes[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + FRAME_SIZE];
        let header = FrameHeader::read_from_prefix(body)?;
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&body[std::mem::size_of::<FrameHeader>()..FRAME_SIZE]);
        Some(Frame { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_always_nul_terminated_even_at_exact_capacity() {
        let s: String = std::iter::repeat('a').take(PATH_MAX).collect();
        let packed = pack_path(&s);
        assert_eq!(packed[PATH_MAX - 1], 0);
        assert_eq!(unpack_path(&packed).len(), PATH_USABLE);
    }

    #[test]
    fn frame_round_trips_through_bytes() {
        let mut f = Frame::new(MsgType::Open, 7);
        f.set_payload(&ParamsPayload {
            flags: crate::flags::OpenFlags::RDONLY.bits(),
            devnum: 1,
            domid: 3,
            path: pack_path("vhd:/var/x.vhd"),
            prt_devnum: 0,
            secondary: [0u8; PATH_MAX],
        });
        let bytes = f.to_bytes();
        let back = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(back.header.cookie, 7);
        let payload: ParamsPayload = back.payload_as();
        assert_eq!(unpack_path(&payload.path), "vhd:/var/x.vhd");
    }

    #[test]
    fn unknown_msg_type_is_einval() {
        let mut f = Frame::new(MsgType::Open, 1);
        f.header.msg_type = 9999;
        assert_eq!(f.msg_type().unwrap_err(), NegErrno::from_errno(libc::EINVAL));
    }

    #[test]
    fn from_bytes_rejects_a_mismatched_length_prefix() {
        let f = Frame::new(MsgType::Pid, 3);
        let mut bytes = f.to_bytes();
        bytes[0] = 0xFF; // corrupt the length prefix
        assert!(Frame::from_bytes(&bytes).is_none());
    }

    #[test]
    fn request_response_pairs_match_spec_table() {
        assert_eq!(MsgType::Pid.expected_response(), Some(MsgType::PidRsp));
        assert_eq!(MsgType::List.expected_response(), Some(MsgType::ListRsp));
        assert_eq!(MsgType::ForceShutdown.expected_response(), None);
        assert_eq!(MsgType::Exit.expected_response(), None);
    }
}
