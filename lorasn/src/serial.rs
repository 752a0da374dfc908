//! Byte-stuffed framing used between a host and a LoRa modem over a serial line.
//!
//! ```text
//! 0x7E | length (u16 BE) | api_type | pan_id (u16 BE) | dest | source | payload_type
//!      | rssi (i16 BE) | snr (i16 BE) | payload | checksum
//! ```
//!
//! `length` counts the bytes from `api_type` to the end of the payload and the checksum is
//! `0xFF - sum(api_type..payload)`. Every byte after the delimiter that collides with a control
//! character is sent as `ESCAPE, byte ^ PAD`.
use log::{debug, trace};

use crate::device::frame::{PayloadType, MAX_PHY_PAYLOAD};
use crate::{LoRaAddress, PanId};

/// Magic byte constants of the framing.
#[non_exhaustive]
pub struct Constants;

impl Constants {
    /// Starts a frame.
    pub const DELIMITER: u8 = 0x7E;
    pub const ESCAPE: u8 = 0x7D;
    pub const XON: u8 = 0x11;
    pub const XOFF: u8 = 0x13;
    /// XORed into escaped bytes.
    pub const PAD: u8 = 0x20;
}

/// Bytes between the length field and the payload.
pub const API_HEADER_LENGTH: usize = 10;
/// Largest `length` field accepted.
pub const MAX_API_LENGTH: usize = API_HEADER_LENGTH + MAX_PHY_PAYLOAD;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApiType {
    /// Host asks the modem to transmit.
    TxRequest = 0x40,
    /// Modem reports the outcome of a transmission (one status byte).
    TxResponse = 0x42,
    /// Modem delivers a received packet.
    RxIndication = 0x80,
}

impl TryFrom<u8> for ApiType {
    type Error = ApiError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x40 => Ok(ApiType::TxRequest),
            0x42 => Ok(ApiType::TxResponse),
            0x80 => Ok(ApiType::RxIndication),
            other => Err(ApiError::UnknownApiType(other)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiFrame {
    pub api_type: ApiType,
    pub pan_id: PanId,
    pub dest: LoRaAddress,
    pub source: LoRaAddress,
    pub payload_type: PayloadType,
    pub rssi: i16,
    pub snr: i16,
    pub payload: Vec<u8>,
}

impl ApiFrame {
    /// Unescaped body: everything `length` covers.
    fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(API_HEADER_LENGTH + self.payload.len());
        body.push(self.api_type as u8);
        body.extend_from_slice(&self.pan_id.to_be_bytes());
        body.push(self.dest);
        body.push(self.source);
        body.push(self.payload_type.into());
        body.extend_from_slice(&self.rssi.to_be_bytes());
        body.extend_from_slice(&self.snr.to_be_bytes());
        body.extend_from_slice(&self.payload);
        body
    }

    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.len() < API_HEADER_LENGTH {
            return Err(ApiError::Truncated);
        }
        Ok(ApiFrame {
            api_type: ApiType::try_from(body[0])?,
            pan_id: u16::from_be_bytes([body[1], body[2]]),
            dest: body[3],
            source: body[4],
            payload_type: PayloadType::from(body[5]),
            rssi: i16::from_be_bytes([body[6], body[7]]),
            snr: i16::from_be_bytes([body[8], body[9]]),
            payload: body[API_HEADER_LENGTH..].to_vec(),
        })
    }

    /// Encode into a byte-stuffed frame ready to be written on the line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body();
        let mut raw = Vec::with_capacity(body.len() + 3);
        raw.extend_from_slice(&(body.len() as u16).to_be_bytes());
        raw.extend_from_slice(&body);
        raw.push(checksum(&body));

        let mut encoded = Vec::with_capacity(raw.len() * 2 + 1);
        encoded.push(Constants::DELIMITER);
        for byte in raw {
            if needs_escape(byte) {
                encoded.push(Constants::ESCAPE);
                encoded.push(byte ^ Constants::PAD);
            } else {
                encoded.push(byte);
            }
        }
        encoded
    }
}

fn needs_escape(byte: u8) -> bool {
    matches!(
        byte,
        Constants::DELIMITER | Constants::ESCAPE | Constants::XON | Constants::XOFF
    )
}

fn checksum(body: &[u8]) -> u8 {
    0xFF - body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Incremental decoder, fed one byte at a time.
///
/// A delimiter always starts a new frame, so a corrupted or truncated frame costs at most that
/// frame.
#[derive(Debug, Default)]
pub struct Decoder {
    position: usize,
    length: usize,
    escaped: bool,
    body: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.position = 0;
        self.length = 0;
        self.escaped = false;
        self.body.clear();
    }

    /// Whether a frame is partially decoded.
    pub fn in_frame(&self) -> bool {
        self.position > 0
    }

    /// Feed one raw byte, returning a result whenever a frame ends.
    pub fn decode(&mut self, raw: u8) -> Option<Result<ApiFrame, ApiError>> {
        if raw == Constants::DELIMITER {
            let interrupted = self.position > 1;
            self.reset();
            self.position = 1;
            if interrupted {
                debug!("Frame interrupted by a new delimiter.");
                return Some(Err(ApiError::Truncated));
            }
            return None;
        }
        if self.position == 0 {
            trace!("Skipping {:#04x} outside of a frame.", raw);
            return None;
        }
        if raw == Constants::ESCAPE && !self.escaped {
            self.escaped = true;
            return None;
        }
        let byte = if self.escaped {
            self.escaped = false;
            raw ^ Constants::PAD
        } else {
            raw
        };

        match self.position {
            1 => self.length = (byte as usize) << 8,
            2 => {
                self.length |= byte as usize;
                if !(API_HEADER_LENGTH..=MAX_API_LENGTH).contains(&self.length) {
                    let length = self.length;
                    self.reset();
                    return Some(Err(ApiError::InvalidLength { length }));
                }
            }
            p if p < 3 + self.length => self.body.push(byte),
            _ => {
                let expected = checksum(&self.body);
                let result = if expected == byte {
                    ApiFrame::parse(&self.body)
                } else {
                    Err(ApiError::Checksum {
                        expected,
                        found: byte,
                    })
                };
                self.reset();
                return Some(result);
            }
        }
        self.position += 1;
        None
    }

    /// Feed a chunk of raw bytes, collecting every completed frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ApiFrame, ApiError>> {
        bytes.iter().filter_map(|b| self.decode(*b)).collect()
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum ApiError {
    #[error("Invalid checksum (expected: {:#04x}, found: {:#04x}).", .expected, .found)]
    Checksum { expected: u8, found: u8 },

    #[error("Invalid frame length {} (min: {}, max: {}).", .length, API_HEADER_LENGTH, MAX_API_LENGTH)]
    InvalidLength { length: usize },

    #[error("Truncated frame.")]
    Truncated,

    #[error("Unknown API type {:#04x}.", .0)]
    UnknownApiType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> ApiFrame {
        ApiFrame {
            api_type: ApiType::RxIndication,
            pan_id: 0x0102,
            dest: 0x01,
            source: 0x05,
            payload_type: PayloadType::MQTT_SN,
            rssi: -70,
            snr: 9,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encodes_expected_layout() {
        let bytes = frame(&[0xAA]).to_bytes();
        let rssi = (-70i16).to_be_bytes();
        let body = [0x80, 0x01, 0x02, 0x01, 0x05, 0x01, rssi[0], rssi[1], 0x00, 0x09, 0xAA];
        let sum = body.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        let mut expected = vec![0x7E, 0x00, 0x0B];
        expected.extend_from_slice(&body);
        expected.push(0xFF - sum);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn control_bytes_are_escaped() {
        let original = frame(&[0x7E, 0x7D, 0x11, 0x13, 0x00]);
        let bytes = original.to_bytes();
        assert_eq!(bytes.iter().filter(|b| **b == Constants::DELIMITER).count(), 1);
        assert!(!bytes.contains(&Constants::XON));
        assert!(!bytes.contains(&Constants::XOFF));

        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(&bytes), vec![Ok(original)]);
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let first = frame(b"first");
        let second = ApiFrame {
            api_type: ApiType::TxResponse,
            payload: vec![0],
            ..frame(&[])
        };
        let mut stream = first.to_bytes();
        stream.extend(second.to_bytes());

        let mut decoder = Decoder::new();
        let (a, b) = stream.split_at(7);
        let mut results = decoder.feed(a);
        assert!(decoder.in_frame());
        results.extend(decoder.feed(b));
        assert_eq!(results, vec![Ok(first), Ok(second)]);
    }

    #[test]
    fn corrupted_checksum_is_reported() {
        let mut bytes = frame(b"abc").to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        let results = Decoder::new().feed(&bytes);
        assert!(matches!(results.as_slice(), [Err(ApiError::Checksum { .. })]));
    }

    #[test]
    fn resynchronizes_after_garbage_and_truncation() {
        let good = frame(b"ok");
        let encoded = good.to_bytes();
        let mut stream = vec![0x00, 0x42, 0xFF];
        stream.extend_from_slice(&encoded[..6]);
        stream.extend_from_slice(&encoded);

        let results = Decoder::new().feed(&stream);
        assert_eq!(results, vec![Err(ApiError::Truncated), Ok(good)]);
    }

    #[test]
    fn rejects_unknown_type_and_bad_length() {
        let mut body = frame(&[]).body();
        body[0] = 0x55;
        let mut raw = vec![0x7E, 0x00, body.len() as u8];
        raw.extend_from_slice(&body);
        raw.push(checksum(&body));
        assert_eq!(Decoder::new().feed(&raw), vec![Err(ApiError::UnknownApiType(0x55))]);

        let results = Decoder::new().feed(&[0x7E, 0x00, 0x02]);
        assert_eq!(results, vec![Err(ApiError::InvalidLength { length: 2 })]);
    }
}
