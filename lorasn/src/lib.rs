//! Secured LoRa link layer with an MQTT-SN client layered on top.
//!
//! The [device] module moves one authenticated frame at a time through a duty-cycle constrained
//! LoRa channel, the [mqttsn] module drives the publish/subscribe protocol over it, and the
//! [serial] and [modem] modules carry link packets over a byte-stuffed serial line for
//! host/modem deployments.

pub mod config;
pub mod device;
pub mod error;
pub mod modem;
pub mod mqttsn;
pub mod serial;
pub mod time;

pub use error::{ConfigError, LinkStatus};

/// Destination of a link packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoRaDestination {
    /// Every device of the PAN (multicast address).
    Global,
    Unique(LoRaAddress),
}

pub type LoRaAddress = u8;
pub type PanId = u16;

impl From<LoRaDestination> for LoRaAddress {
    fn from(dest: LoRaDestination) -> Self {
        match dest {
            LoRaDestination::Global => device::frame::MULTICAST_ADDRESS,
            LoRaDestination::Unique(addr) => addr,
        }
    }
}

impl From<LoRaAddress> for LoRaDestination {
    fn from(addr: LoRaAddress) -> Self {
        if addr == device::frame::MULTICAST_ADDRESS {
            LoRaDestination::Global
        } else {
            LoRaDestination::Unique(addr)
        }
    }
}
