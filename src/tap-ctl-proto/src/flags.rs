//! `OPEN`/`params` flag bits (spec §6.2).

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct OpenFlags: u32 {
        const SHARED    = 0x001;
        const RDONLY    = 0x002;
        const ADD_CACHE = 0x004;
        const VHD_INDEX = 0x008;
        const LOG_DIRTY = 0x010;
        const ADD_LCACHE = 0x020;
        const REUSE_PRT = 0x040;
        const SECONDARY = 0x080;
        const STANDBY   = 0x100;
    }
}
