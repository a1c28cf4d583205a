//! Component G: the control-socket wire protocol and its UNIX-socket
//! transport (spec §4.4, §6.1, §6.2).

pub mod flags;
pub mod transport;
pub mod wire;

pub use flags::OpenFlags;
pub use transport::{
    call, call_typed, error_response, read_frame, serve_one, socket_path, write_frame, CONTROL_DIR,
};
pub use wire::{
    BlkifPayload, Frame, FrameHeader, ImagePayload, ListPayload, MinorsPayload, MsgType,
    ParamsPayload, PidPayload, ResponsePayload, StringPayload, FRAME_SIZE, GREF_MAX,
    LENGTH_PREFIX_SIZE, MINORS_MAX, PATH_MAX, PATH_USABLE, PAYLOAD_SIZE,
};
pub use wire::{pack_path, unpack_path};
