//! The broker-side device (spec §3 "Broker-side device"): everything the
//! broker tracks in memory for one guest virtual disk between discovery
//! and removal.

use tap_types::{DevId, DomId, EvtchnPort, Serial};

use crate::frontend_state::FrontendState;

/// Key identifying one device in the broker's in-memory set: the pair the
/// discovery loop walks `backend/xenio/<domid>/<name>` by (spec §4.5).
pub type DeviceKey = (u16, String);

pub fn device_key(domid: DomId, name: &str) -> DeviceKey {
    (domid.get(), name.to_string())
}

#[derive(Debug, Clone)]
pub struct BrokerDevice {
    pub domid: DomId,
    pub name: String,
    pub devid: DevId,
    pub serial: Serial,
    pub frontend_path: String,
    pub frontend_state_path: String,
    pub backend_path: String,

    /// pid of the tap worker located for this device, once found.
    pub tap_pid: Option<i32>,

    pub sector_size: u32,
    pub sectors: u64,
    pub info: u32,

    /// Ring refs and port granted by the frontend, captured at connect
    /// time (spec §3 "granted ring refs and event port (after connect)").
    pub ring_refs: Vec<u32>,
    pub ring_order: u8,
    pub port: Option<EvtchnPort>,
    pub protocol: u32,

    pub last_frontend_state: FrontendState,
    pub connected: bool,
}

impl BrokerDevice {
    pub fn new(domid: DomId, name: String, serial: Serial) -> Self {
        let devid = DevId::new(name.parse().unwrap_or(0));
        let backend_path = format!("backend/xenio/{}/{}", domid.get(), name);
        BrokerDevice {
            domid,
            frontend_path: String::new(),
            frontend_state_path: String::new(),
            backend_path,
            name,
            devid,
            serial,
            tap_pid: None,
            sector_size: 0,
            sectors: 0,
            info: 0,
            ring_refs: Vec::new(),
            ring_order: 0,
            port: None,
            protocol: 0,
            last_frontend_state: FrontendState::Unknown,
            connected: false,
        }
    }

    pub fn set_frontend(&mut self, frontend_path: String) {
        self.frontend_state_path = format!("{frontend_path}/state");
        self.frontend_path = frontend_path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devid_parses_from_device_name() {
        let d = BrokerDevice::new(DomId::new(3), "51712".to_string(), Serial::new(1));
        assert_eq!(d.devid, DevId::new(51712));
        assert_eq!(d.backend_path, "backend/xenio/3/51712");
    }

    #[test]
    fn frontend_state_path_derives_from_frontend_path() {
        let mut d = BrokerDevice::new(DomId::new(3), "51712".to_string(), Serial::new(1));
        d.set_frontend("/local/domain/3/device/vbd/51712".to_string());
        assert_eq!(d.frontend_state_path, "/local/domain/3/device/vbd/51712/state");
    }
}
