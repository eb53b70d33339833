//! Modem control over the AT command port.

pub mod at;
pub mod imei;

pub use at::{AtPort, FakeAtPort, SerialAtPort};
pub use imei::ImeiVault;
