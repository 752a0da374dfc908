//! Everything needed to establish secured communication between peers using the physical
//! radio module.

pub mod airtime;
pub mod crypto;
pub mod device;
pub mod frame;
pub mod hal;
#[cfg(test)]
pub(crate) mod mock;
pub mod radio;
pub mod region;

pub use device::*;
pub use radio::{LinkError, LinkLayer, LinkSettings, LinkState};
