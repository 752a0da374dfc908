//! Link layer exposed as a serial modem.
//!
//! A modem runs in a single role: in [ModemRole::Tx] it reads `TxRequest` frames from the
//! host, transmits them and answers each with a one byte `TxResponse`; in [ModemRole::Rx] it
//! listens on the downlink and forwards every verified packet as an `RxIndication`.
use log::{debug, info, trace, warn};
use serde::Deserialize;
use std::io::{ErrorKind, Read, Write};

use crate::device::frame::LinkHeader;
use crate::device::radio::LinkLayer;
use crate::device::RadioTransport;
use crate::error::LinkStatus;
use crate::mqttsn::SEND_TIMEOUT_MS;
use crate::serial::{ApiFrame, ApiType, Decoder};
use crate::time::{Clock, LowPower};

const READ_CHUNK: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemRole {
    Tx,
    Rx,
}

/// `[modem]` section of the node configuration.
#[derive(Copy, Clone, Debug, Deserialize)]
pub struct ModemConfig {
    pub role: ModemRole,
    /// Bound on channel access for each relayed frame.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u32,
}

fn default_send_timeout() -> u32 {
    SEND_TIMEOUT_MS
}

#[derive(thiserror::Error, Debug)]
pub enum ModemError {
    #[error("Serial port failure.")]
    Io(#[from] std::io::Error),

    #[error("Serial port closed.")]
    Closed,
}

pub struct Modem<R, C, L, S>
where
    R: RadioTransport,
    C: Clock,
    L: LowPower,
    S: Read + Write,
{
    link: LinkLayer<R, C, L>,
    port: S,
    role: ModemRole,
    send_timeout_ms: u32,
    decoder: Decoder,
}

impl<R, C, L, S> Modem<R, C, L, S>
where
    R: RadioTransport,
    C: Clock,
    L: LowPower,
    S: Read + Write,
{
    pub fn new(mut link: LinkLayer<R, C, L>, port: S, config: &ModemConfig) -> Self {
        if config.role == ModemRole::Rx {
            link.set_rx_continuous(true);
        }
        info!("Serial modem ready ({:?} role).", config.role);
        Self {
            link,
            port,
            role: config.role,
            send_timeout_ms: config.send_timeout_ms,
            decoder: Decoder::new(),
        }
    }

    pub fn role(&self) -> ModemRole {
        self.role
    }

    pub fn link(&self) -> &LinkLayer<R, C, L> {
        &self.link
    }

    pub fn port(&self) -> &S {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut S {
        &mut self.port
    }

    /// Serve forever, only returning when the serial port fails.
    pub fn run(&mut self, timeout_ms: u32) -> Result<(), ModemError> {
        loop {
            self.poll(timeout_ms)?;
        }
    }

    /// Handle whatever is available: one read from the host in TX role, one reception window
    /// of `timeout_ms` in RX role. Returns how many frames went to the host.
    pub fn poll(&mut self, timeout_ms: u32) -> Result<usize, ModemError> {
        match self.role {
            ModemRole::Tx => self.relay_requests(),
            ModemRole::Rx => self.forward_reception(timeout_ms),
        }
    }

    fn relay_requests(&mut self) -> Result<usize, ModemError> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = match self.port.read(&mut chunk) {
            Ok(0) => return Err(ModemError::Closed),
            Ok(read) => read,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(0)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        trace!("Read {}B from the host.", read);

        let mut answered = 0;
        for result in self.decoder.feed(&chunk[..read]) {
            match result {
                Ok(frame) if frame.api_type == ApiType::TxRequest => {
                    let status = self.transmit(&frame);
                    self.write_frame(&ApiFrame {
                        api_type: ApiType::TxResponse,
                        rssi: 0,
                        snr: 0,
                        payload: vec![status_byte(status)],
                        ..frame
                    })?;
                    answered += 1;
                }
                Ok(frame) => debug!("Ignoring {:?} frame from the host.", frame.api_type),
                Err(e) => warn!("Dropping host frame: {}", e),
            }
        }
        Ok(answered)
    }

    fn transmit(&mut self, frame: &ApiFrame) -> Result<(), LinkStatus> {
        let header = LinkHeader {
            pan_id: frame.pan_id,
            dest: frame.dest,
            source: frame.source,
            payload_type: frame.payload_type,
        };
        self.link
            .send_frame(header, &frame.payload, self.send_timeout_ms)
            .map_err(|e| {
                warn!("Relaying to {:#04x} failed: {}", frame.dest, e);
                e.status()
            })
    }

    fn forward_reception(&mut self, timeout_ms: u32) -> Result<usize, ModemError> {
        let received = match self.link.receive(timeout_ms) {
            Ok(received) => received,
            Err(e) => {
                if e.status() != LinkStatus::RxTimeout {
                    warn!("Reception failed: {}", e);
                }
                return Ok(0);
            }
        };
        let header = received.packet.header;
        self.write_frame(&ApiFrame {
            api_type: ApiType::RxIndication,
            pan_id: header.pan_id,
            dest: header.dest,
            source: header.source,
            payload_type: header.payload_type,
            rssi: received.rssi,
            snr: received.snr as i16,
            payload: received.packet.payload,
        })?;
        Ok(1)
    }

    fn write_frame(&mut self, frame: &ApiFrame) -> Result<(), ModemError> {
        self.port.write_all(&frame.to_bytes())?;
        self.port.flush()?;
        Ok(())
    }
}

/// Byte reported in `TxResponse`: 0 on success, the [LinkStatus] code otherwise.
pub fn status_byte(status: Result<(), LinkStatus>) -> u8 {
    match status {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::crypto::LinkCipher;
    use crate::device::frame::{LinkPacket, PayloadType, MAX_PAYLOAD_LENGTH};
    use crate::device::mock::MockRadio;
    use crate::device::radio::{LinkSettings, DEFAULT_SYNC_WORD};
    use crate::device::region::{ChannelPlan, SpreadingFactor};
    use crate::time::testing::{ClockSleeper, ManualClock};
    use crate::{LoRaAddress, PanId};
    use std::collections::VecDeque;

    const KEY: [u8; 16] = *b"0123456789abcdef";
    const PAN: PanId = 0x0102;
    const ADDR: LoRaAddress = 0x01;
    const NODE: LoRaAddress = 0x05;

    /// Serial port fed from a queue of chunks, one chunk per read.
    #[derive(Default)]
    struct FakePort {
        input: VecDeque<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.input.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    type TestModem = Modem<MockRadio, ManualClock, ClockSleeper, FakePort>;

    fn modem(role: ModemRole) -> TestModem {
        let clock = ManualClock::default();
        let settings = LinkSettings {
            key: KEY,
            pan_id: PAN,
            address: ADDR,
            sync_word: DEFAULT_SYNC_WORD,
            tx_power: 13,
            plan: ChannelPlan::select(24, 25, SpreadingFactor::Sf7).unwrap(),
            seed: Some(3),
        };
        let link = LinkLayer::new(
            MockRadio::new(clock.clone()),
            clock.clone(),
            ClockSleeper(clock),
            &settings,
        )
        .unwrap();
        let config = ModemConfig {
            role,
            send_timeout_ms: SEND_TIMEOUT_MS,
        };
        Modem::new(link, FakePort::default(), &config)
    }

    fn request(payload: &[u8]) -> ApiFrame {
        ApiFrame {
            api_type: ApiType::TxRequest,
            pan_id: PAN,
            dest: NODE,
            source: ADDR,
            payload_type: PayloadType::MQTT_SN,
            rssi: 0,
            snr: 0,
            payload: payload.to_vec(),
        }
    }

    fn host_frames(modem: &TestModem) -> Vec<ApiFrame> {
        Decoder::new()
            .feed(&modem.port().output)
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn tx_request_is_sealed_and_acknowledged() {
        let mut modem = modem(ModemRole::Tx);
        let bytes = request(b"\x02\x16").to_bytes();
        let (head, tail) = bytes.split_at(5);
        modem.port_mut().input.push_back(head.to_vec());
        modem.port_mut().input.push_back(tail.to_vec());

        assert_eq!(modem.poll(0).unwrap(), 0);
        assert_eq!(modem.poll(0).unwrap(), 1);

        let sent = &modem.link().radio().sent;
        assert_eq!(sent.len(), 1);
        let packet = LinkPacket::try_from_bytes(&sent[0]).unwrap();
        assert_eq!(packet.header.dest, NODE);
        assert_eq!(
            LinkCipher::new(&KEY).open(&packet).unwrap(),
            b"\x02\x16".to_vec()
        );

        let replies = host_frames(&modem);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].api_type, ApiType::TxResponse);
        assert_eq!(replies[0].dest, NODE);
        assert_eq!(replies[0].payload, vec![0]);
    }

    #[test]
    fn failed_transmission_reports_status_code() {
        let mut modem = modem(ModemRole::Tx);
        let oversize = vec![0u8; MAX_PAYLOAD_LENGTH + 1];
        for chunk in request(&oversize).to_bytes().chunks(READ_CHUNK) {
            modem.port_mut().input.push_back(chunk.to_vec());
        }

        let mut answered = 0;
        while !modem.port().input.is_empty() {
            answered += modem.poll(0).unwrap();
        }
        assert_eq!(answered, 1);
        assert!(modem.link().radio().sent.is_empty());
        let replies = host_frames(&modem);
        assert_eq!(replies[0].payload, vec![LinkStatus::LengthError.code()]);
    }

    #[test]
    fn corrupted_and_foreign_frames_are_skipped() {
        let mut modem = modem(ModemRole::Tx);
        let mut corrupted = request(b"x").to_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        let indication = ApiFrame {
            api_type: ApiType::RxIndication,
            ..request(b"y")
        };
        let mut stream = corrupted;
        stream.extend(indication.to_bytes());
        stream.extend(request(b"z").to_bytes());
        for chunk in stream.chunks(16) {
            modem.port_mut().input.push_back(chunk.to_vec());
        }

        let mut answered = 0;
        while !modem.port().input.is_empty() {
            answered += modem.poll(0).unwrap();
        }
        assert_eq!(answered, 1);
        assert_eq!(host_frames(&modem).len(), 1);
        assert_eq!(modem.link().radio().sent.len(), 1);
    }

    #[test]
    fn received_packets_are_forwarded() {
        let mut modem = modem(ModemRole::Rx);
        let header = LinkHeader {
            pan_id: PAN,
            dest: ADDR,
            source: NODE,
            payload_type: PayloadType::MQTT_SN,
        };
        let frame = LinkCipher::new(&KEY).seal(header, b"hello").unwrap().to_bytes();
        modem.link.radio_mut().inbound.push_back(frame);

        assert_eq!(modem.poll(1000).unwrap(), 1);
        let frames = host_frames(&modem);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].api_type, ApiType::RxIndication);
        assert_eq!(frames[0].source, NODE);
        assert_eq!(frames[0].rssi, -60);
        assert_eq!(frames[0].snr, 8);
        assert_eq!(frames[0].payload, b"hello".to_vec());
    }

    #[test]
    fn reception_timeout_writes_nothing() {
        let mut modem = modem(ModemRole::Rx);
        assert_eq!(modem.poll(500).unwrap(), 0);
        assert!(modem.port().output.is_empty());
    }

    #[test]
    fn status_bytes() {
        assert_eq!(status_byte(Ok(())), 0);
        assert_eq!(status_byte(Err(LinkStatus::ChannelNotFree)), 7);
        assert_eq!(status_byte(Err(LinkStatus::TxTimeout)), 11);
    }
}
