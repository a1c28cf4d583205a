//! Component H: the broker/discovery daemon (spec §4.5). Watches the
//! configuration store for guest block devices, drives the per-device
//! frontend-state machine, and mediates tap-worker lifecycle through
//! `tap-ctl-proto`'s control-socket protocol.
//!
//! The event-loop wiring (real xenstore watches registered on a
//! [`tap_sched::Scheduler`]) lives in `main.rs`; everything in this crate
//! is plain synchronous logic driven by a [`config_store::ConfigStore`],
//! testable without a scheduler or a real xenstore daemon.

pub mod broker;
pub mod config_store;
pub mod device;
pub mod frontend_state;
pub mod tap_locator;

pub use broker::{Broker, DeviceEvent, BACKEND_ROOT, TOKEN_BACKEND_XENIO, TOKEN_OTHEREND_STATE};
pub use config_store::{ConfigStore, FakeConfigStore, XenstoreCliStore};
pub use device::{device_key, BrokerDevice, DeviceKey};
pub use frontend_state::{Action, FrontendState};
pub use tap_locator::{CliTapLocator, FakeTapLocator, TapLocator};
