// Cardbeam - proximity card exchange over BLE advertising

pub mod ble;
pub mod config;
pub mod proximity;

pub use ble::BleError;
pub use config::ProximityConfig;
pub use proximity::{CardInbox, ProximityNode};
