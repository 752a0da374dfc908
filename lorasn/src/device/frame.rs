//! On-air layout of a secured link packet.
//!
//! ```text
//! | pan_id (u16 BE) | dest (u8) | source (u8) | payload_type (u8) | payload (n) | MIC (u32 BE) |
//! ```
//!
//! The payload travels encrypted and the MIC authenticates the header together with the
//! encrypted payload (see [crate::device::crypto]).
use crate::{LoRaAddress, PanId};

/// Encoded size of [LinkHeader].
pub const HEADER_LENGTH: usize = 5;
/// Encoded size of the message integrity code.
pub const MIC_LENGTH: usize = 4;
/// Largest frame handed to the radio.
pub const MAX_PHY_PAYLOAD: usize = 255;
/// Largest payload whatever the region is.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_PHY_PAYLOAD - HEADER_LENGTH - MIC_LENGTH;
/// Destination address accepted by every device of a PAN.
pub const MULTICAST_ADDRESS: LoRaAddress = 0xFF;

/// Trait to calculate size on frame for every component on frame.
pub trait FrameSize {
    /// Calculate component size on frame (meaning encoded) in bytes.
    fn size(&self) -> usize;
}

/// Tag of the upper protocol carried by a packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const MQTT_SN: PayloadType = PayloadType(0x01);
}

impl From<u8> for PayloadType {
    fn from(inner: u8) -> Self {
        PayloadType(inner)
    }
}

impl From<PayloadType> for u8 {
    fn from(value: PayloadType) -> Self {
        value.0
    }
}

/// Addressing part of a link packet, covered by the MIC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkHeader {
    pub pan_id: PanId,
    pub dest: LoRaAddress,
    pub source: LoRaAddress,
    pub payload_type: PayloadType,
}

/// Full link packet. `payload` holds ciphertext while on air and plaintext once verified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkPacket {
    pub header: LinkHeader,
    pub payload: Vec<u8>,
    pub mic: u32,
}

/// Packet delivered by the link layer after verification and decryption, with its radio metrics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RxPacket {
    pub packet: LinkPacket,
    pub rssi: i16,
    pub snr: i8,
}

impl LinkHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let pan = self.pan_id.to_be_bytes();
        [pan[0], pan[1], self.dest, self.source, self.payload_type.into()]
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort { size: bytes.len() });
        }
        let header = LinkHeader {
            pan_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            dest: bytes[2],
            source: bytes[3],
            payload_type: PayloadType::from(bytes[4]),
        };
        Ok((header, HEADER_LENGTH))
    }

    /// Whether a device with this PAN/address should accept the packet.
    pub fn is_for(&self, pan_id: PanId, address: LoRaAddress) -> bool {
        self.pan_id == pan_id && (self.dest == address || self.dest == MULTICAST_ADDRESS)
    }
}

impl LinkPacket {
    /// Bytes covered by the MIC: the encoded header followed by the payload.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.authenticated_bytes();
        bytes.extend_from_slice(&self.mic.to_be_bytes());
        bytes
    }

    /// Decode a received frame, the payload length being implied by the frame length.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LENGTH + MIC_LENGTH {
            return Err(FrameError::TooShort { size: bytes.len() });
        }
        if bytes.len() > MAX_PHY_PAYLOAD {
            return Err(FrameError::TooLong { size: bytes.len() });
        }
        let (header, read) = LinkHeader::try_from_bytes(bytes)?;
        let mic_start = bytes.len() - MIC_LENGTH;
        let mut mic_raw = [0u8; MIC_LENGTH];
        mic_raw.copy_from_slice(&bytes[mic_start..]);
        Ok(LinkPacket {
            header,
            payload: bytes[read..mic_start].to_vec(),
            mic: u32::from_be_bytes(mic_raw),
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("Frame is too short to hold a header and a MIC (is: {}B, min: {}B)!", .size, HEADER_LENGTH + MIC_LENGTH)]
    TooShort { size: usize },

    #[error("Frame is too long (is: {}B, max: {}B)!", .size, MAX_PHY_PAYLOAD)]
    TooLong { size: usize },
}

impl FrameSize for LinkHeader {
    fn size(&self) -> usize {
        HEADER_LENGTH
    }
}

impl FrameSize for LinkPacket {
    fn size(&self) -> usize {
        self.header.size() + self.payload.len() + MIC_LENGTH
    }
}
