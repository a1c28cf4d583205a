//! UNIX-socket transport for the control protocol (spec §4.4, §6.1).
//!
//! A call is open-connect → write one request frame → read one response
//! frame → close. The server side dispatches each accepted connection's
//! frames serially, writing the response before reading the next
//! request (spec §4.4 "serial per connection").

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tap_types::NegErrno;

use crate::wire::{Frame, MsgType, FRAME_SIZE, LENGTH_PREFIX_SIZE};

pub const CONTROL_DIR: &str = tap_types::paths::BLKTAP3_CONTROL_DIR;

pub fn socket_path(control_dir: &Path, pid: i32) -> PathBuf {
    control_dir.join(format!("ctl{pid}"))
}

fn io_to_neg_errno(e: &std::io::Error) -> NegErrno {
    match e.raw_os_error() {
        Some(errno) => NegErrno::from_errno(errno),
        None => NegErrno::from_errno(libc::EIO),
    }
}

/// Writes one frame as `[u32 length][header][payload]` (spec §6.2,
/// `Frame::to_bytes`'s own framing).
pub fn write_frame(stream: &mut UnixStream, frame: &Frame) -> Result<(), NegErrno> {
    stream
        .write_all(&frame.to_bytes())
        .map_err(|e| io_to_neg_errno(&e))
}

/// Reads one frame: the `u32` length prefix first, then exactly that many
/// bytes for the header+payload body. A length that doesn't match this
/// build's `FRAME_SIZE` is a protocol violation (`-EINVAL`), not silently
/// trusted.
pub fn read_frame(stream: &mut UnixStream) -> Result<Frame, NegErrno> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream
        .read_exact(&mut len_buf)
        .map_err(|e| io_to_neg_errno(&e))?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len != FRAME_SIZE {
        return Err(NegErrno::from_errno(libc::EINVAL));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .map_err(|e| io_to_neg_errno(&e))?;

    let mut full = Vec::with_capacity(LENGTH_PREFIX_SIZE + len);
    full.extend_from_slice(&len_buf);
    full.extend_from_slice(&body);
    Frame::from_bytes(&full).ok_or_else(|| NegErrno::from_errno(libc::EIO))
}

/// One client round-trip: connect, write `request`, read the response,
/// disconnect. Spec §9 Open Question (i): the response's `type` field is
/// only interpreted when the transport call itself succeeded — a
/// connect/write/read failure is surfaced as its own transport error and
/// never read as a (possibly stale, possibly zeroed) response frame.
pub fn call(
    control_dir: &Path,
    pid: i32,
    request: &Frame,
    timeout: Option<Duration>,
) -> Result<Frame, NegErrno> {
    let path = socket_path(control_dir, pid);
    let mut stream = UnixStream::connect(&path).map_err(|e| io_to_neg_errno(&e))?;
    if let Some(t) = timeout {
        let _ = stream.set_read_timeout(Some(t));
        let _ = stream.set_write_timeout(Some(t));
    }
    write_frame(&mut stream, request)?;
    let response = read_frame(&mut stream)?;
    Ok(response)
}

/// Same as [`call`] but additionally rejects a response whose `type`
/// does not match what `request`'s type expects, converting a mismatch
/// into `-EINVAL` (spec §4.4 "type mismatch is an immediate client-side
/// EINVAL") rather than handing the caller a frame of the wrong shape.
pub fn call_typed(
    control_dir: &Path,
    pid: i32,
    request: &Frame,
    timeout: Option<Duration>,
) -> Result<Frame, NegErrno> {
    let response = call(control_dir, pid, request, timeout)?;
    let want = MsgType::try_from(request.header.msg_type)
        .ok()
        .and_then(MsgType::expected_response);
    let got = response.msg_type()?;
    match want {
        Some(expected) if expected == got => Ok(response),
        Some(_) if got == MsgType::Error => Ok(response),
        _ => Err(NegErrno::from_errno(libc::EINVAL)),
    }
}

/// Server-side: reads one request frame, hands it to `handle`, writes
/// back whatever frame `handle` produces, and returns whether the
/// connection should stay open for another request (spec says one
/// request per connection in practice, but nothing in the framing
/// forbids pipelining, so the loop is left to the caller).
pub fn serve_one(stream: &mut UnixStream, handle: impl FnOnce(Frame) -> Frame) -> Result<(), NegErrno> {
    let request = read_frame(stream)?;
    let response = handle(request);
    write_frame(stream, &response)
}

/// Builds an error response frame with the same cookie as `request`
/// (spec: `response.error` carries a normalised negative errno).
pub fn error_response(request: &Frame, err: NegErrno) -> Frame {
    let mut f = Frame::new(MsgType::Error, request.header.cookie);
    f.set_payload(&crate::wire::ResponsePayload {
        error: err.get(),
        message: [0u8; crate::wire::PATH_MAX],
    });
    f
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;
    use crate::wire::PidPayload;

    #[test]
    fn call_round_trips_over_a_real_socket() {
        let dir = std::env::temp_dir().join(format!("tap-ctl-proto-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = socket_path(&dir, 1234);
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve_one(&mut stream, |req| {
                let payload: PidPayload = req.payload_as();
                assert_eq!(payload.pid, 42);
                let mut resp = Frame::new(MsgType::PidRsp, req.header.cookie);
                resp.set_payload(&PidPayload { pid: payload.pid });
                resp
            })
            .unwrap();
        });

        let mut req = Frame::new(MsgType::Pid, 9);
        req.set_payload(&PidPayload { pid: 42 });
        let resp = call_typed(&dir, 1234, &req, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(resp.msg_type().unwrap(), MsgType::PidRsp);
        let payload: PidPayload = resp.payload_as();
        assert_eq!(payload.pid, 42);

        server.join().unwrap();
        let _ = std::fs::remove_file(&sock_path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn mismatched_response_type_is_einval() {
        let dir = std::env::temp_dir().join(format!("tap-ctl-proto-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = socket_path(&dir, 5678);
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve_one(&mut stream, |req| {
                Frame::new(MsgType::AttachRsp, req.header.cookie)
            })
            .unwrap();
        });

        let mut req = Frame::new(MsgType::Pid, 1);
        req.set_payload(&PidPayload { pid: 1 });
        let err = call_typed(&dir, 5678, &req, Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err, NegErrno::from_errno(libc::EINVAL));

        server.join().unwrap();
        let _ = std::fs::remove_file(&sock_path);
        let _ = std::fs::remove_dir(&dir);
    }
}
