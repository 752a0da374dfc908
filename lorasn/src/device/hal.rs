//! [RadioTransport] implementation for drivers built on the `radio` crate traits.
use embedded_hal::blocking::delay::DelayMs;
use log::{debug, trace};
use radio::{Power, Receive, ReceiveInfo, Rssi, Transmit};
use std::fmt::Debug;

use super::airtime::time_on_air_ms;
use super::device::{CodingRate, IrqFlags, RadioEvent, RadioTransport, RxConfig, TxConfig};
use super::frame::MAX_PHY_PAYLOAD;
use super::region::{Bandwidth, SpreadingFactor};
use crate::time::{Clock, SystemClock};

/// Radio physical device representation.
pub trait Radio<C, E>:
    Transmit<Error = E>
    + Receive<Error = E>
    + Rssi<Error = E>
    + Power<Error = E>
    + radio::Channel<Channel = C, Error = E>
    + DelayMs<u32>
{
}

impl<
        C: Debug,
        E: Debug,
        T: Transmit<Error = E>
            + Receive<Error = E>
            + Rssi<Error = E>
            + Power<Error = E>
            + radio::Channel<Channel = C, Error = E>
            + DelayMs<u32>,
    > Radio<C, E> for T
{
}

/// Modulation settings the driver specific channel type is built from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelSettings {
    pub frequency: u32,
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
    pub coding_rate: CodingRate,
    pub preamble_length: u16,
    pub crc_on: bool,
    pub sync_word: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HalState {
    Idle,
    Transmitting { deadline_ms: u64 },
    Receiving { deadline_ms: Option<u64> },
}

/// Polled adapter: completions are detected in [RadioTransport::service].
pub struct HalRadio<T, C, E, F>
where
    T: Radio<C, E>,
    C: Debug,
    E: Debug,
    F: Fn(&ChannelSettings) -> C,
{
    radio: T,
    make_channel: F,
    settings: ChannelSettings,
    tx_timeout_ms: u32,
    state: HalState,
    clock: SystemClock,
    phantom: std::marker::PhantomData<E>,
}

impl<T, C, E, F> HalRadio<T, C, E, F>
where
    T: Radio<C, E>,
    C: Debug,
    E: Debug,
    F: Fn(&ChannelSettings) -> C,
{
    /// `make_channel` turns link settings into the driver's channel description.
    pub fn new(radio: T, make_channel: F) -> Self {
        Self {
            radio,
            make_channel,
            settings: ChannelSettings {
                frequency: 0,
                bandwidth: Bandwidth::Khz125,
                spreading_factor: SpreadingFactor::Sf7,
                coding_rate: CodingRate::Cr4_5,
                preamble_length: 8,
                crc_on: true,
                sync_word: 0x12,
            },
            tx_timeout_ms: 0,
            state: HalState::Idle,
            clock: SystemClock::new(),
            phantom: std::marker::PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.radio
    }

    fn apply_channel(&mut self) -> Result<(), E> {
        let channel = (self.make_channel)(&self.settings);
        trace!("Applying channel {:?}.", channel);
        self.radio.set_channel(&channel)
    }
}

impl<T, C, E, F> RadioTransport for HalRadio<T, C, E, F>
where
    T: Radio<C, E>,
    C: Debug,
    E: Debug,
    F: Fn(&ChannelSettings) -> C,
{
    type Error = E;

    fn set_channel(&mut self, frequency: u32) -> Result<(), E> {
        self.settings.frequency = frequency;
        Ok(())
    }

    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), E> {
        self.settings = ChannelSettings {
            frequency: config.frequency,
            bandwidth: config.bandwidth,
            spreading_factor: config.spreading_factor,
            coding_rate: config.coding_rate,
            preamble_length: config.preamble_length,
            crc_on: config.crc_on,
            ..self.settings
        };
        self.tx_timeout_ms = config.timeout_ms;
        self.apply_channel()?;
        self.radio.set_power(config.power)
    }

    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), E> {
        self.settings = ChannelSettings {
            frequency: config.frequency,
            bandwidth: config.bandwidth,
            spreading_factor: config.spreading_factor,
            coding_rate: config.coding_rate,
            preamble_length: config.preamble_length,
            crc_on: config.crc_on,
            ..self.settings
        };
        self.apply_channel()
    }

    fn send(&mut self, buffer: &[u8]) -> Result<(), E> {
        self.radio.start_transmit(buffer)?;
        self.state = HalState::Transmitting {
            deadline_ms: self.clock.now_ms() + self.tx_timeout_ms as u64,
        };
        Ok(())
    }

    fn set_rx(&mut self, timeout_ms: u32) -> Result<(), E> {
        self.radio.start_receive()?;
        self.state = HalState::Receiving {
            deadline_ms: match timeout_ms {
                0 => None,
                t => Some(self.clock.now_ms() + t as u64),
            },
        };
        Ok(())
    }

    fn is_channel_free(&mut self, frequency: u32, rssi_threshold: i16, duration_ms: u32) -> Result<bool, E> {
        self.settings.frequency = frequency;
        self.apply_channel()?;
        self.radio.start_receive()?;
        let started = self.clock.now_ms();
        let mut free = true;
        loop {
            let rssi = self.radio.poll_rssi()?;
            if rssi > rssi_threshold {
                debug!("Carrier sensed at {}dBm on {}Hz.", rssi, frequency);
                free = false;
                break;
            }
            if self.clock.elapsed_since(started) >= duration_ms as u64 {
                break;
            }
            self.radio.delay_ms(1);
        }
        self.state = HalState::Idle;
        Ok(free)
    }

    fn time_on_air(&self, config: &TxConfig, length: usize) -> u32 {
        time_on_air_ms(config, length)
    }

    /// Stored and handed to the channel factory with the next configuration.
    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), E> {
        self.settings.sync_word = sync_word;
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), E> {
        self.state = HalState::Idle;
        Ok(())
    }

    fn service(&mut self, irq: &IrqFlags) -> Result<(), E> {
        let now = self.clock.now_ms();
        match self.state {
            HalState::Idle => {}
            HalState::Transmitting { deadline_ms } => {
                if self.radio.check_transmit()? {
                    self.state = HalState::Idle;
                    irq.raise(RadioEvent::TxDone);
                } else if now >= deadline_ms {
                    self.state = HalState::Idle;
                    irq.raise(RadioEvent::TxTimeout);
                }
            }
            HalState::Receiving { deadline_ms } => match self.radio.check_receive(false) {
                Ok(true) => {
                    let mut buffer = [0u8; MAX_PHY_PAYLOAD];
                    self.state = HalState::Idle;
                    match self.radio.get_received(&mut buffer) {
                        Ok((size, info)) => irq.raise_rx_done(&buffer[..size], info.rssi(), 0),
                        Err(e) => {
                            debug!("Failed to fetch received frame: {:?}", e);
                            irq.raise(RadioEvent::RxError);
                        }
                    }
                }
                Ok(false) => {
                    if deadline_ms.map_or(false, |d| now >= d) {
                        self.state = HalState::Idle;
                        irq.raise(RadioEvent::RxTimeout);
                    }
                }
                Err(e) => {
                    debug!("Reception error: {:?}", e);
                    self.state = HalState::Idle;
                    irq.raise(RadioEvent::RxError);
                }
            },
        }
        Ok(())
    }
}
