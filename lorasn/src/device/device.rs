use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use super::frame::{PayloadType, RxPacket};
use super::region::{Bandwidth, SpreadingFactor};
use crate::error::LinkStatus;
use crate::{LoRaAddress, PanId};

/// LoRa coding rate, `4/(4+n)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodingRate {
    Cr4_5 = 1,
    Cr4_6 = 2,
    Cr4_7 = 3,
    Cr4_8 = 4,
}

/// Transmission parameters applied before each send.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxConfig {
    pub frequency: u32,
    pub power: i8,
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
    pub coding_rate: CodingRate,
    pub preamble_length: u16,
    pub crc_on: bool,
    pub timeout_ms: u32,
}

/// Reception parameters applied when entering receive mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RxConfig {
    pub frequency: u32,
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
    pub coding_rate: CodingRate,
    pub preamble_length: u16,
    /// Single-shot window, in symbols.
    pub symbol_timeout: u16,
    pub max_payload_length: u8,
    pub crc_on: bool,
    pub continuous: bool,
}

/// Driver capability required by the link layer.
///
/// Completions are not returned by these calls: drivers report them by raising [RadioEvent]s on
/// the shared [IrqFlags], either from an interrupt handler or from [RadioTransport::service].
pub trait RadioTransport {
    type Error: Debug;

    fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error>;
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error>;
    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error>;
    /// Start transmitting `buffer`, completion being signalled by [RadioEvent::TxDone] or
    /// [RadioEvent::TxTimeout].
    fn send(&mut self, buffer: &[u8]) -> Result<(), Self::Error>;
    /// Open a reception window (0 means continuous).
    fn set_rx(&mut self, timeout_ms: u32) -> Result<(), Self::Error>;
    /// Listen-before-talk: sample the channel for `duration_ms` and report whether the RSSI
    /// stayed below `rssi_threshold`.
    fn is_channel_free(
        &mut self,
        frequency: u32,
        rssi_threshold: i16,
        duration_ms: u32,
    ) -> Result<bool, Self::Error>;
    /// Airtime of a `length` bytes frame with `config`, in milliseconds.
    fn time_on_air(&self, config: &TxConfig, length: usize) -> u32;
    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Self::Error>;
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Poll the hardware and raise pending events. Interrupt-driven drivers keep the default.
    fn service(&mut self, _irq: &IrqFlags) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Completion events raised by the radio.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RadioEvent {
    TxDone = 0b0000_0001,
    RxDone = 0b0000_0010,
    TxTimeout = 0b0000_0100,
    RxTimeout = 0b0000_1000,
    RxError = 0b0001_0000,
    /// Deferred transmission timer expired.
    TxDelayed = 0b0010_0000,
}

impl RadioEvent {
    pub const ALL: [RadioEvent; 6] = [
        RadioEvent::TxDone,
        RadioEvent::RxDone,
        RadioEvent::TxTimeout,
        RadioEvent::RxTimeout,
        RadioEvent::RxError,
        RadioEvent::TxDelayed,
    ];

    fn mask(&self) -> u8 {
        *self as u8
    }
}

/// Received frame captured by the interrupt path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RxDone {
    pub payload: Vec<u8>,
    pub rssi: i16,
    pub snr: i8,
}

/// Event flags shared between interrupt context and the link-layer loop.
///
/// Producers set bits, the consumer drains all of them with a single atomic swap so no event is
/// lost or handled twice.
#[derive(Debug, Default)]
pub struct IrqFlags {
    pending: AtomicU8,
    received: Mutex<Option<RxDone>>,
}

/// Snapshot of drained events.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PendingEvents(u8);

impl PendingEvents {
    pub fn contains(&self, event: RadioEvent) -> bool {
        self.0 & event.mask() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RadioEvent> + '_ {
        RadioEvent::ALL.into_iter().filter(|e| self.contains(*e))
    }
}

impl IrqFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, event: RadioEvent) {
        self.pending.fetch_or(event.mask(), Ordering::AcqRel);
    }

    /// Store a received frame then raise [RadioEvent::RxDone].
    pub fn raise_rx_done(&self, payload: &[u8], rssi: i16, snr: i8) {
        if let Ok(mut slot) = self.received.lock() {
            *slot = Some(RxDone {
                payload: payload.to_vec(),
                rssi,
                snr,
            });
        }
        self.raise(RadioEvent::RxDone);
    }

    pub fn drain(&self) -> PendingEvents {
        PendingEvents(self.pending.swap(0, Ordering::AcqRel))
    }

    pub fn take_received(&self) -> Option<RxDone> {
        self.received.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Forget every pending event and frame.
    pub fn clear(&self) {
        self.drain();
        self.take_received();
    }
}

/// Secured datagram service offered to upper layers.
pub trait LinkTransport {
    /// Send one payload, waiting for the transmission to complete.
    fn send(
        &mut self,
        dest: LoRaAddress,
        payload_type: PayloadType,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), LinkStatus>;

    /// Wait at most `timeout_ms` (0 waits forever) for a verified packet addressed to us.
    fn receive(&mut self, timeout_ms: u32) -> Result<RxPacket, LinkStatus>;

    fn pan_id(&self) -> PanId;
    fn address(&self) -> LoRaAddress;
    /// Largest payload accepted by [LinkTransport::send].
    fn max_payload(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_each_event_once() {
        let irq = IrqFlags::new();
        irq.raise(RadioEvent::TxDone);
        irq.raise(RadioEvent::RxTimeout);
        irq.raise(RadioEvent::TxDone);
        let events = irq.drain();
        assert!(events.contains(RadioEvent::TxDone));
        assert!(events.contains(RadioEvent::RxTimeout));
        assert!(!events.contains(RadioEvent::RxDone));
        assert_eq!(events.iter().count(), 2);
        assert!(irq.drain().is_empty());
    }

    #[test]
    fn received_frame_is_taken_once() {
        let irq = IrqFlags::new();
        irq.raise_rx_done(&[1, 2, 3], -40, 7);
        assert!(irq.drain().contains(RadioEvent::RxDone));
        let frame = irq.take_received().unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert_eq!(frame.rssi, -40);
        assert!(irq.take_received().is_none());
    }
}
