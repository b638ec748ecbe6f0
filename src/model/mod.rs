//! Core data model: devices, networks, hardware addresses and ip ranges.

mod device;
mod mac;
mod network;
mod range;

pub use device::{Device, DeviceMeta, ServerInfo, SnmpInfo, Tag};
pub use mac::Mac;
pub use network::Network;
pub use range::IpRange;
