//! In-memory radio used by the unit tests.
use std::collections::VecDeque;

use super::device::{IrqFlags, RadioEvent, RadioTransport, RxConfig, TxConfig};
use crate::time::testing::ManualClock;
use crate::time::Clock;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

/// Radio reporting completions through [RadioTransport::service]. Frames queued in `inbound`
/// are delivered one per reception window.
pub struct MockRadio {
    clock: ManualClock,
    pub sent: Vec<Vec<u8>>,
    pub sent_at: Vec<u64>,
    pub inbound: VecDeque<Vec<u8>>,
    pub busy_samples: usize,
    pub carrier_checks: usize,
    pub time_on_air: u32,
    pub sync_word: Option<u8>,
    pub silent_tx: bool,
    pub responder: Option<Responder>,
    pub tx_config: Option<TxConfig>,
    pub rx_config: Option<RxConfig>,
    pending: Vec<RadioEvent>,
    listening: bool,
}

impl MockRadio {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            sent: Vec::new(),
            sent_at: Vec::new(),
            inbound: VecDeque::new(),
            busy_samples: 0,
            carrier_checks: 0,
            time_on_air: 50,
            sync_word: None,
            silent_tx: false,
            responder: None,
            tx_config: None,
            rx_config: None,
            pending: Vec::new(),
            listening: false,
        }
    }
}

impl RadioTransport for MockRadio {
    type Error = ();

    fn set_channel(&mut self, _frequency: u32) -> Result<(), ()> {
        Ok(())
    }

    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), ()> {
        self.tx_config = Some(*config);
        Ok(())
    }

    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), ()> {
        self.rx_config = Some(*config);
        Ok(())
    }

    fn send(&mut self, buffer: &[u8]) -> Result<(), ()> {
        self.sent.push(buffer.to_vec());
        self.sent_at.push(self.clock.now_ms());
        if !self.silent_tx {
            self.pending.push(RadioEvent::TxDone);
        }
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(buffer);
            self.inbound.extend(replies);
        }
        Ok(())
    }

    fn set_rx(&mut self, _timeout_ms: u32) -> Result<(), ()> {
        self.listening = true;
        Ok(())
    }

    fn is_channel_free(&mut self, _frequency: u32, _rssi: i16, duration_ms: u32) -> Result<bool, ()> {
        self.carrier_checks += 1;
        self.clock.advance(duration_ms as u64);
        if self.busy_samples > 0 {
            self.busy_samples -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn time_on_air(&self, _config: &TxConfig, _length: usize) -> u32 {
        self.time_on_air
    }

    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), ()> {
        self.sync_word = Some(sync_word);
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), ()> {
        self.listening = false;
        Ok(())
    }

    fn service(&mut self, irq: &IrqFlags) -> Result<(), ()> {
        for event in self.pending.drain(..) {
            irq.raise(event);
        }
        if self.listening {
            if let Some(frame) = self.inbound.pop_front() {
                self.listening = false;
                irq.raise_rx_done(&frame, -60, 8);
            }
        }
        Ok(())
    }
}
