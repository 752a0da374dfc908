use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::Arc;

use super::crypto::{CryptoError, LinkCipher, KEY_LENGTH};
use super::device::{
    CodingRate, IrqFlags, LinkTransport, RadioEvent, RadioTransport, RxConfig, TxConfig,
};
use super::frame::{
    FrameError, LinkHeader, LinkPacket, PayloadType, RxPacket, HEADER_LENGTH, MIC_LENGTH,
    MULTICAST_ADDRESS,
};
use super::region::ChannelPlan;
use crate::error::LinkStatus;
use crate::time::{Clock, LowPower, IDLE_POLL_MS};
use crate::{LoRaAddress, PanId};

/// Channel considered busy above this RSSI, in dBm.
pub const RSSI_THRESHOLD: i16 = -83;
/// Listen-before-talk sensing duration.
pub const CARRIER_SENSE_MS: u32 = 5;
/// Bounds of the random wait after a busy channel.
pub const LBT_DELAY_MIN_MS: u32 = 100;
pub const LBT_DELAY_MAX_MS: u32 = 400;
/// Radio level transmission timeout.
pub const TX_TIMEOUT_MS: u32 = 4000;
pub const PREAMBLE_LENGTH: u16 = 8;
/// Single reception window, in symbols.
pub const WINDOW_TIMEOUT_SYMBOLS: u16 = 6;
pub const DEFAULT_SYNC_WORD: u8 = 0x55;

/// Link-layer state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    Idle,
    RxInit,
    Rx,
    RxDone,
    RxTimeout,
    RxError,
    TxInit,
    Tx,
    Cycle,
    Sleep,
    TxNoFreeChannel,
    TxDone,
    TxTimeout,
}

/// What the current blocking call waits for, used to drop stray events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Operation {
    Idle,
    Transmitting,
    Receiving,
}

#[derive(Copy, Clone, Debug)]
struct Timer {
    deadline_ms: u64,
    event: RadioEvent,
}

/// Everything needed to bring a link layer up.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub key: [u8; KEY_LENGTH],
    pub pan_id: PanId,
    pub address: LoRaAddress,
    pub sync_word: u8,
    pub tx_power: i8,
    pub plan: ChannelPlan,
    /// Seed of the listen-before-talk delay generator, taken from the OS when absent.
    pub seed: Option<u64>,
}

/// Secured link layer over a [RadioTransport].
///
/// Calls are blocking: each one drives the state machine until its outcome is known, entering
/// low power through `L` whenever it waits on the radio or a timer.
pub struct LinkLayer<R, C, L>
where
    R: RadioTransport,
    C: Clock,
    L: LowPower,
{
    radio: R,
    clock: C,
    sleeper: L,
    irq: Arc<IrqFlags>,
    cipher: LinkCipher,
    plan: ChannelPlan,
    pan_id: PanId,
    address: LoRaAddress,
    state: LinkState,
    operation: Operation,
    tx_config: TxConfig,
    rx_config: RxConfig,
    tx_buffer: Vec<u8>,
    time_on_air_ms: u32,
    last_tx_done_ms: Option<u64>,
    backoff_ms: u32,
    next_tx: bool,
    timer: Option<Timer>,
    rx_deadline_ms: Option<u64>,
    received: Option<RxPacket>,
    rng: StdRng,
}

/// Remaining wait imposed by the duty cycle after a transmission of `time_on_air_ms` that
/// completed `elapsed_ms` ago (`None` if nothing was sent yet).
pub fn backoff_time(time_on_air_ms: u32, duty_cycle: u8, elapsed_ms: Option<u64>) -> u32 {
    if duty_cycle == 0 {
        return 0;
    }
    let backoff = (time_on_air_ms as u64 * 100 / duty_cycle as u64).saturating_sub(time_on_air_ms as u64);
    match elapsed_ms {
        None => 0,
        Some(elapsed) if elapsed >= backoff => 0,
        Some(elapsed) => (backoff - elapsed) as u32,
    }
}

impl<R, C, L> LinkLayer<R, C, L>
where
    R: RadioTransport,
    C: Clock,
    L: LowPower,
{
    pub fn new(
        mut radio: R,
        clock: C,
        sleeper: L,
        settings: &LinkSettings,
    ) -> Result<Self, LinkError<R::Error>> {
        if settings.pan_id == 0 || settings.address == 0 || settings.address == MULTICAST_ADDRESS {
            return Err(LinkError::ParameterInvalid {
                context: format!(
                    "Invalid device identity (pan: {:#06x}, address: {:#04x}).",
                    settings.pan_id, settings.address
                ),
            });
        }
        radio
            .set_sync_word(settings.sync_word)
            .map_err(LinkError::InternalRadioError)?;
        let plan = settings.plan;
        let tx_config = TxConfig {
            frequency: plan.uplink_frequency,
            power: settings.tx_power,
            bandwidth: plan.bandwidth,
            spreading_factor: plan.spreading_factor,
            coding_rate: CodingRate::Cr4_5,
            preamble_length: PREAMBLE_LENGTH,
            crc_on: true,
            timeout_ms: TX_TIMEOUT_MS,
        };
        let rx_config = RxConfig {
            frequency: plan.downlink_frequency,
            bandwidth: plan.bandwidth,
            spreading_factor: plan.spreading_factor,
            coding_rate: CodingRate::Cr4_5,
            preamble_length: PREAMBLE_LENGTH,
            symbol_timeout: WINDOW_TIMEOUT_SYMBOLS,
            max_payload_length: (plan.max_payload as usize + HEADER_LENGTH + MIC_LENGTH) as u8,
            crc_on: true,
            continuous: false,
        };
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            "Link layer up (pan: {:#06x}, address: {:#04x}, {:?}, {:?}).",
            settings.pan_id, settings.address, plan.dwell_time, plan.spreading_factor
        );
        Ok(Self {
            radio,
            clock,
            sleeper,
            irq: Arc::new(IrqFlags::new()),
            cipher: LinkCipher::new(&settings.key),
            plan,
            pan_id: settings.pan_id,
            address: settings.address,
            state: LinkState::Idle,
            operation: Operation::Idle,
            tx_config,
            rx_config,
            tx_buffer: Vec::new(),
            time_on_air_ms: 0,
            last_tx_done_ms: None,
            backoff_ms: 0,
            next_tx: false,
            timer: None,
            rx_deadline_ms: None,
            received: None,
            rng,
        })
    }

    /// Event flags to hand to the radio interrupt handlers.
    pub fn irq(&self) -> Arc<IrqFlags> {
        self.irq.clone()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Switch reception to continuous mode, as done by always-listening nodes.
    pub fn set_rx_continuous(&mut self, continuous: bool) {
        self.rx_config.continuous = continuous;
    }

    /// Encrypt, authenticate and transmit `payload` to `dest`.
    ///
    /// `timeout_ms` bounds the cumulated listen-before-talk waits on a busy channel.
    pub fn send(
        &mut self,
        dest: LoRaAddress,
        payload_type: PayloadType,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), LinkError<R::Error>> {
        let header = LinkHeader {
            pan_id: self.pan_id,
            dest,
            source: self.address,
            payload_type,
        };
        self.send_frame(header, payload, timeout_ms)
    }

    /// Like [LinkLayer::send] with a caller supplied header, used when relaying host frames.
    pub fn send_frame(
        &mut self,
        header: LinkHeader,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), LinkError<R::Error>> {
        let max = self.plan.max_payload as usize;
        if payload.len() > max {
            return Err(LinkError::LengthError {
                size: payload.len(),
                max,
            });
        }
        let packet = self.cipher.seal(header, payload)?;
        self.tx_buffer = packet.to_bytes();
        debug!(
            "Sending {}B to {:#04x} (type: {:?}).",
            payload.len(),
            header.dest,
            header.payload_type
        );
        self.begin(Operation::Transmitting, LinkState::TxInit);
        let result = self.run_tx(timeout_ms);
        self.finish();
        result
    }

    /// Wait up to `timeout_ms` (0 for no limit) for a packet addressed to this device.
    ///
    /// Frames for another PAN or address, and frames failing verification, are dropped and
    /// reception resumes.
    pub fn receive(&mut self, timeout_ms: u32) -> Result<RxPacket, LinkError<R::Error>> {
        self.rx_deadline_ms = match timeout_ms {
            0 => None,
            t => Some(self.clock.now_ms() + t as u64),
        };
        self.begin(Operation::Receiving, LinkState::RxInit);
        let result = self.run_rx();
        self.finish();
        result
    }

    fn begin(&mut self, operation: Operation, state: LinkState) {
        self.irq.clear();
        self.operation = operation;
        self.state = state;
        self.timer = None;
        self.received = None;
    }

    fn finish(&mut self) {
        self.operation = Operation::Idle;
        self.state = LinkState::Idle;
        self.timer = None;
        self.rx_deadline_ms = None;
    }

    fn run_tx(&mut self, timeout_ms: u32) -> Result<(), LinkError<R::Error>> {
        let mut busy_wait_ms = 0u32;
        loop {
            self.handle_irq_events()?;
            match self.state {
                LinkState::TxInit => {
                    self.next_tx = true;
                    self.state = LinkState::Tx;
                }
                LinkState::Tx => {
                    if self.next_tx {
                        self.next_tx = self.schedule_tx()?;
                    }
                }
                LinkState::Cycle => {
                    trace!("Duty cycle backoff of {}ms.", self.backoff_ms);
                    self.arm_timer(self.backoff_ms, RadioEvent::TxDelayed);
                    self.state = LinkState::Sleep;
                }
                LinkState::TxNoFreeChannel => {
                    let delay = self.rng.gen_range(LBT_DELAY_MIN_MS..=LBT_DELAY_MAX_MS);
                    busy_wait_ms += delay;
                    if busy_wait_ms < timeout_ms {
                        debug!("Channel busy, retrying in {}ms.", delay);
                        self.arm_timer(delay, RadioEvent::TxDelayed);
                        self.state = LinkState::Sleep;
                    } else {
                        warn!("Channel stayed busy for {}ms, giving up.", busy_wait_ms);
                        return Err(LinkError::ChannelNotFree);
                    }
                }
                LinkState::Sleep => self.low_power(),
                LinkState::TxDone => return Ok(()),
                LinkState::TxTimeout => return Err(LinkError::TxTimeout),
                state => {
                    return Err(LinkError::Unknown {
                        context: format!("Unexpected state {:?} while transmitting.", state),
                    })
                }
            }
        }
    }

    /// One transmission attempt. Returns whether another attempt must be scheduled later.
    fn schedule_tx(&mut self) -> Result<bool, LinkError<R::Error>> {
        let elapsed = self.last_tx_done_ms.map(|t| self.clock.elapsed_since(t));
        self.backoff_ms = backoff_time(self.time_on_air_ms, self.plan.duty_cycle, elapsed);
        if self.backoff_ms > 0 {
            self.state = LinkState::Cycle;
            return Ok(true);
        }
        let free = self
            .radio
            .is_channel_free(self.tx_config.frequency, RSSI_THRESHOLD, CARRIER_SENSE_MS)
            .map_err(LinkError::InternalRadioError)?;
        if !free {
            self.state = LinkState::TxNoFreeChannel;
            return Ok(true);
        }
        self.radio
            .set_channel(self.tx_config.frequency)
            .map_err(LinkError::InternalRadioError)?;
        self.radio
            .set_tx_config(&self.tx_config)
            .map_err(LinkError::InternalRadioError)?;
        self.time_on_air_ms = self.radio.time_on_air(&self.tx_config, self.tx_buffer.len());
        self.radio
            .send(&self.tx_buffer)
            .map_err(LinkError::InternalRadioError)?;
        // Guards against a radio that never reports completion.
        self.arm_timer(self.tx_config.timeout_ms + self.time_on_air_ms, RadioEvent::TxTimeout);
        self.state = LinkState::Sleep;
        Ok(false)
    }

    fn run_rx(&mut self) -> Result<RxPacket, LinkError<R::Error>> {
        loop {
            self.handle_irq_events()?;
            match self.state {
                LinkState::RxInit => {
                    self.radio
                        .set_channel(self.rx_config.frequency)
                        .map_err(LinkError::InternalRadioError)?;
                    self.radio
                        .set_rx_config(&self.rx_config)
                        .map_err(LinkError::InternalRadioError)?;
                    self.state = LinkState::Rx;
                }
                LinkState::Rx => {
                    let window = match self.rx_deadline_ms {
                        None => 0,
                        Some(deadline) => {
                            let now = self.clock.now_ms();
                            if now >= deadline {
                                return Err(LinkError::RxTimeout);
                            }
                            let window = (deadline - now) as u32;
                            self.arm_timer(window, RadioEvent::RxTimeout);
                            window
                        }
                    };
                    self.radio
                        .set_rx(window)
                        .map_err(LinkError::InternalRadioError)?;
                    self.state = LinkState::Sleep;
                }
                LinkState::Sleep => self.low_power(),
                LinkState::RxDone => {
                    return self.received.take().ok_or_else(|| LinkError::Unknown {
                        context: "Reception completed without a packet.".to_owned(),
                    })
                }
                LinkState::RxTimeout => return Err(LinkError::RxTimeout),
                LinkState::RxError => {
                    debug!("Reception error, listening again.");
                    self.state = LinkState::RxInit;
                }
                state => {
                    return Err(LinkError::Unknown {
                        context: format!("Unexpected state {:?} while receiving.", state),
                    })
                }
            }
        }
    }

    fn arm_timer(&mut self, delay_ms: u32, event: RadioEvent) {
        self.timer = Some(Timer {
            deadline_ms: self.clock.now_ms() + delay_ms as u64,
            event,
        });
    }

    fn low_power(&mut self) {
        let budget = match self.timer {
            Some(timer) => timer.deadline_ms.saturating_sub(self.clock.now_ms()),
            None => IDLE_POLL_MS as u64,
        };
        if budget > 0 {
            self.sleeper.wait_for_event(budget.min(u32::MAX as u64) as u32);
        }
    }

    fn handle_irq_events(&mut self) -> Result<(), LinkError<R::Error>> {
        self.radio
            .service(&self.irq)
            .map_err(LinkError::InternalRadioError)?;
        if let Some(timer) = self.timer {
            if self.clock.now_ms() >= timer.deadline_ms {
                self.timer = None;
                self.irq.raise(timer.event);
            }
        }
        let events = self.irq.drain();
        for event in events.iter() {
            match (event, self.operation) {
                (RadioEvent::TxDone, Operation::Transmitting) => {
                    self.sleep_radio()?;
                    self.timer = None;
                    self.last_tx_done_ms = Some(self.clock.now_ms());
                    self.state = LinkState::TxDone;
                }
                (RadioEvent::TxTimeout, Operation::Transmitting) => {
                    self.sleep_radio()?;
                    self.timer = None;
                    self.state = LinkState::TxTimeout;
                }
                (RadioEvent::TxDelayed, Operation::Transmitting) => {
                    self.backoff_ms = 0;
                    self.next_tx = true;
                    self.state = LinkState::Tx;
                }
                (RadioEvent::RxDone, Operation::Receiving) => {
                    self.sleep_radio()?;
                    self.process_rx_done();
                }
                (RadioEvent::RxTimeout, Operation::Receiving) => {
                    self.sleep_radio()?;
                    self.timer = None;
                    self.state = LinkState::RxTimeout;
                }
                (RadioEvent::RxError, Operation::Receiving) => {
                    self.sleep_radio()?;
                    self.state = LinkState::RxError;
                }
                (event, operation) => {
                    trace!("Ignoring {:?} while {:?}.", event, operation);
                }
            }
        }
        Ok(())
    }

    fn sleep_radio(&mut self) -> Result<(), LinkError<R::Error>> {
        self.radio.sleep().map_err(LinkError::InternalRadioError)
    }

    fn process_rx_done(&mut self) {
        self.state = LinkState::RxInit;
        let Some(frame) = self.irq.take_received() else {
            return;
        };
        let mut packet = match LinkPacket::try_from_bytes(&frame.payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed frame: {}", e);
                return;
            }
        };
        if !packet.header.is_for(self.pan_id, self.address) {
            trace!(
                "Frame ignored because it is not addressed for us (pan: {:#06x}, dest: {:#04x}).",
                packet.header.pan_id,
                packet.header.dest
            );
            return;
        }
        match self.cipher.open(&packet) {
            Ok(plaintext) => {
                packet.payload = plaintext;
                debug!(
                    "Received {}B from {:#04x} (rssi: {}, snr: {}).",
                    packet.payload.len(),
                    packet.header.source,
                    frame.rssi,
                    frame.snr
                );
                self.received = Some(RxPacket {
                    packet,
                    rssi: frame.rssi,
                    snr: frame.snr,
                });
                self.state = LinkState::RxDone;
            }
            Err(e) => warn!("Dropping frame from {:#04x}: {}", packet.header.source, e),
        }
    }
}

impl<R, C, L> LinkTransport for LinkLayer<R, C, L>
where
    R: RadioTransport,
    C: Clock,
    L: LowPower,
{
    fn send(
        &mut self,
        dest: LoRaAddress,
        payload_type: PayloadType,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), LinkStatus> {
        LinkLayer::send(self, dest, payload_type, payload, timeout_ms).map_err(|e| {
            debug!("Link send failed: {}", e);
            e.status()
        })
    }

    fn receive(&mut self, timeout_ms: u32) -> Result<RxPacket, LinkStatus> {
        LinkLayer::receive(self, timeout_ms).map_err(|e| e.status())
    }

    fn pan_id(&self) -> PanId {
        self.pan_id
    }

    fn address(&self) -> LoRaAddress {
        self.address
    }

    fn max_payload(&self) -> usize {
        self.plan.max_payload as usize
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LinkError<R>
where
    R: Debug,
{
    #[error("Payload is too big to be transmitted (is: {}B, max: {}B)!", .size, .max)]
    LengthError { size: usize, max: usize },

    #[error("Invalid parameter. Context: {}", .context)]
    ParameterInvalid { context: String },

    #[error("Channel not free until the transmission timeout.")]
    ChannelNotFree,

    #[error("Radio did not complete the transmission.")]
    TxTimeout,

    #[error("No packet received before the timeout.")]
    RxTimeout,

    #[error("Bad frame error.")]
    FrameError(#[from] FrameError),

    #[error("Cryptographic error.")]
    CryptoError(#[from] CryptoError),

    #[error("Internal radio error.")]
    InternalRadioError(R),

    #[error("Unknown link error. Context: {}", .context)]
    Unknown { context: String },
}

impl<R: Debug> LinkError<R> {
    /// Coarse status reported to upper layers.
    pub fn status(&self) -> LinkStatus {
        match self {
            LinkError::LengthError { .. } => LinkStatus::LengthError,
            LinkError::ParameterInvalid { .. } => LinkStatus::ParameterInvalid,
            LinkError::ChannelNotFree => LinkStatus::ChannelNotFree,
            LinkError::TxTimeout => LinkStatus::TxTimeout,
            LinkError::RxTimeout => LinkStatus::RxTimeout,
            LinkError::CryptoError(_) => LinkStatus::CryptoError,
            LinkError::FrameError(_) | LinkError::InternalRadioError(_) | LinkError::Unknown { .. } => {
                LinkStatus::Error
            }
        }
    }
}
