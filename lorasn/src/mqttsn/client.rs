//! Connection state machine and message loop of the MQTT-SN client.
use log::{debug, info, trace, warn};

use super::message::{Flags, Message, ReturnCode};
use super::publish::PendingPublish;
use super::register::PendingRegister;
use super::subscribe::{PendingSubscribe, Subscription};
use super::topic::TopicRegistry;
use super::SnError;
use crate::config::ClientConfig;
use crate::device::frame::{PayloadType, MULTICAST_ADDRESS};
use crate::device::LinkTransport;
use crate::error::LinkStatus;
use crate::time::Clock;
use crate::{LoRaAddress, PanId};

/// Longest client identifier allowed in CONNECT.
const MAX_CLIENT_ID_LENGTH: usize = 23;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    GwLost,
    Searching,
    Connecting,
    WaitWillTopicReq,
    SendWillTopic,
    WaitWillMsgReq,
    SendWillMsg,
    WaitConnAck,
    Active,
    WaitPingResp,
    Disconnecting,
    Asleep,
    Awake,
    Disconnected,
}

/// Gateway the client talks to, learnt from GWINFO.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Gateway {
    pub id: u8,
    pub pan_id: PanId,
    pub address: LoRaAddress,
}

/// Link-level origin of a received message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Origin {
    pub pan_id: PanId,
    pub address: LoRaAddress,
    pub rssi: i16,
    pub snr: i8,
}

/// MQTT-SN client bound to one gateway.
///
/// Every request is sent at most `retry_count` times, waiting `response_timeout_ms` for its
/// response after each attempt. Messages unrelated to the request in flight are dispatched as
/// they arrive, so publications keep flowing while a handshake is pending.
pub struct SnClient<T, C> {
    pub(super) link: T,
    pub(super) clock: C,
    pub(super) config: ClientConfig,
    client_id: String,
    pub(super) state: ClientState,
    gateway: Option<Gateway>,
    next_msg_id: u16,
    pub(super) qos_m1: bool,
    ping_deadline: Option<u64>,
    wake_deadline: Option<u64>,
    sleep_duration: Option<u16>,
    advertise_interval_ms: Option<u64>,
    resumed_from_sleep: bool,
    subscribed_on_connect: bool,
    connack_rejection: Option<ReturnCode>,
    last_origin: Option<Origin>,
    pub(super) awaiting_publish: bool,
    pub(super) topics: TopicRegistry,
    pub(super) subscriptions: Vec<Subscription>,
    pub(super) pending_publish: Option<PendingPublish>,
    pub(super) pending_register: Option<PendingRegister>,
    pub(super) pending_subscribe: Option<PendingSubscribe>,
    pub(super) inbound_qos2: Vec<u16>,
}

impl<T, C> SnClient<T, C>
where
    T: LinkTransport,
    C: Clock,
{
    pub fn new(link: T, clock: C, config: &ClientConfig) -> Result<Self, SnError> {
        config
            .validate()
            .map_err(|err| SnError::ParameterInvalid {
                context: err.to_string(),
            })?;
        let client_id = format!(
            "{}{:04x}{:02x}",
            config.client_id_prefix,
            link.pan_id(),
            link.address()
        );
        if client_id.len() > MAX_CLIENT_ID_LENGTH {
            return Err(SnError::ParameterInvalid {
                context: format!(
                    "Client id {} is too long (is: {}B, max: {}B).",
                    client_id,
                    client_id.len(),
                    MAX_CLIENT_ID_LENGTH
                ),
            });
        }
        debug!("MQTT-SN client {} initialized.", client_id);

        Ok(Self {
            link,
            clock,
            config: config.clone(),
            client_id,
            state: ClientState::GwLost,
            gateway: None,
            next_msg_id: 1,
            qos_m1: false,
            ping_deadline: None,
            wake_deadline: None,
            sleep_duration: None,
            advertise_interval_ms: None,
            resumed_from_sleep: false,
            subscribed_on_connect: false,
            connack_rejection: None,
            last_origin: None,
            awaiting_publish: false,
            topics: TopicRegistry::new(),
            subscriptions: Vec::new(),
            pending_publish: None,
            pending_register: None,
            pending_subscribe: None,
            inbound_qos2: Vec::new(),
        })
    }

    /// Client limited to QoS -1 publications on predefined or short topics.
    ///
    /// It starts ACTIVE and never connects: messages go straight to `gateway`.
    pub fn new_qos_m1(
        link: T,
        clock: C,
        client_id_prefix: &str,
        gateway: LoRaAddress,
    ) -> Result<Self, SnError> {
        let config = ClientConfig {
            client_id_prefix: client_id_prefix.to_owned(),
            ..ClientConfig::default()
        };
        let pan_id = link.pan_id();
        let mut client = Self::new(link, clock, &config)?;
        client.qos_m1 = true;
        client.state = ClientState::Active;
        client.gateway = Some(Gateway {
            id: 0,
            pan_id,
            address: gateway,
        });
        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn gateway(&self) -> Option<Gateway> {
        self.gateway
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Origin and signal quality of the last message received.
    pub fn last_origin(&self) -> Option<Origin> {
        self.last_origin
    }

    /// Gateway advertisement period observed from ADVERTISE, with some slack.
    pub fn advertise_interval_ms(&self) -> Option<u64> {
        self.advertise_interval_ms
    }

    pub fn link(&self) -> &T {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut T {
        &mut self.link
    }

    pub fn into_link(self) -> T {
        self.link
    }

    /// Connect to the gateway, searching for one first when none is known.
    ///
    /// Goes through the will exchange when a will topic and message are configured, then
    /// subscribes the subscription list. Exhausting the retry budget at any step forgets the
    /// gateway so the next attempt starts with a new search.
    pub fn connect(&mut self) -> Result<(), SnError> {
        if self.qos_m1 {
            return Ok(());
        }
        self.state = match self.state {
            ClientState::Active => return Ok(()),
            ClientState::GwLost | ClientState::Searching => ClientState::GwLost,
            _ if self.gateway.is_none() => ClientState::GwLost,
            _ => ClientState::Connecting,
        };

        loop {
            match self.state {
                ClientState::Active => break,
                ClientState::GwLost => {
                    self.state = ClientState::Searching;
                    let request = Message::SearchGw { radius: 0 };
                    self.step(&request, ClientState::Searching)?;
                }
                ClientState::Connecting => {
                    let with_will = !self.config.will_topic.is_empty()
                        && !self.config.will_message.is_empty();
                    let request = Message::Connect {
                        flags: Flags::new()
                            .with_will(with_will)
                            .with_clean_session(self.config.clean_session),
                        duration: self.config.keep_alive,
                        client_id: self.client_id.clone(),
                    };
                    let waiting = if with_will {
                        ClientState::WaitWillTopicReq
                    } else {
                        ClientState::WaitConnAck
                    };
                    self.state = waiting;
                    self.step(&request, waiting)?;
                }
                ClientState::SendWillTopic => {
                    let request = Message::WillTopic {
                        flags: Flags::new()
                            .with_qos(self.config.will_qos)
                            .with_retain(self.config.will_retain),
                        topic: self.config.will_topic.clone(),
                    };
                    self.state = ClientState::WaitWillMsgReq;
                    self.step(&request, ClientState::WaitWillMsgReq)?;
                }
                ClientState::SendWillMsg => {
                    let request = Message::WillMsg {
                        message: self.config.will_message.as_bytes().to_vec(),
                    };
                    self.state = ClientState::WaitConnAck;
                    self.step(&request, ClientState::WaitConnAck)?;
                }
                other => return Err(SnError::InvalidState(other)),
            }
            if let Some(return_code) = self.connack_rejection.take() {
                return Err(SnError::Rejected(return_code));
            }
        }

        info!(
            "Connected to gateway {:?} as {}.",
            self.gateway, self.client_id
        );
        self.on_connected()
    }

    /// One connect handshake step: send `request` until the state leaves `waiting`.
    fn step(&mut self, request: &Message, waiting: ClientState) -> Result<(), SnError> {
        let result = self.exchange(request, move |client| client.state != waiting);
        if result.is_err() {
            warn!("Gateway lost while waiting in {:?}.", waiting);
            self.lose_gateway();
        }
        result
    }

    fn on_connected(&mut self) -> Result<(), SnError> {
        let resubscribe = !self.resumed_from_sleep
            && (self.config.clean_session || !self.subscribed_on_connect);
        self.resumed_from_sleep = false;
        if resubscribe && !self.subscriptions.is_empty() {
            self.subscribed_on_connect = true;
            // The session is up; a failed subscription does not undo it.
            if let Err(error) = self.subscribe_all() {
                warn!("Resubscribing after connect failed: {}", error);
            }
        }
        Ok(())
    }

    /// Disconnect from the gateway, or go to sleep for `duration` seconds.
    ///
    /// Publications the gateway still holds after a recent SUBACK are collected first.
    pub fn disconnect(&mut self, duration: Option<u16>) -> Result<(), SnError> {
        match self.state {
            ClientState::GwLost | ClientState::Disconnected | ClientState::Disconnecting => {
                return Ok(())
            }
            _ if self.qos_m1 => return Ok(()),
            _ => {}
        }
        if self.awaiting_publish {
            self.drain_publications();
        }

        self.sleep_duration = duration.filter(|seconds| *seconds > 0);
        self.state = ClientState::Disconnecting;
        let request = Message::Disconnect {
            duration: self.sleep_duration,
        };
        let result = self.exchange(&request, |client| {
            client.state != ClientState::Disconnecting
        });
        if result.is_err() {
            self.lose_gateway();
        }
        result
    }

    /// Wake up from ASLEEP: announce ourselves with a PINGREQ, collect the publications
    /// buffered by the gateway and go back to sleep once PINGRESP arrives.
    pub fn wake(&mut self) -> Result<(), SnError> {
        if self.state != ClientState::Asleep {
            return Err(SnError::InvalidState(self.state));
        }
        self.state = ClientState::Awake;
        let request = Message::PingReq {
            client_id: Some(self.client_id.clone()),
        };
        let result = self.exchange(&request, |client| client.state != ClientState::Awake);
        if result.is_err() {
            self.lose_gateway();
        }
        result
    }

    /// Keep-alive ping. Asleep clients wake up instead.
    pub fn ping(&mut self) -> Result<(), SnError> {
        match self.state {
            _ if self.qos_m1 => Ok(()),
            ClientState::Asleep => self.wake(),
            ClientState::Active => {
                self.state = ClientState::WaitPingResp;
                let request = Message::PingReq { client_id: None };
                let result = self.exchange(&request, |client| {
                    client.state != ClientState::WaitPingResp
                });
                if result.is_err() {
                    self.lose_gateway();
                }
                result
            }
            other => Err(SnError::InvalidState(other)),
        }
    }

    /// One step of the cooperative loop.
    ///
    /// Fires the keep-alive ping or the wake-up when due, otherwise waits at most `timeout_ms`
    /// for one inbound message and dispatches it. Asleep clients do not listen.
    pub fn poll(&mut self, timeout_ms: u32) -> Result<(), SnError> {
        let now = self.clock.now_ms();
        let due = |deadline: Option<u64>| deadline.map_or(false, |at| now >= at);
        match self.state {
            ClientState::Asleep if due(self.wake_deadline) => return self.wake(),
            ClientState::Asleep => return Ok(()),
            ClientState::Active if !self.qos_m1 && due(self.ping_deadline) => {
                return self.ping()
            }
            _ => {}
        }

        match self.read_msg(timeout_ms.max(1)) {
            Ok(Some((message, origin))) => self.dispatch(message, origin),
            Ok(None) | Err(LinkStatus::RxTimeout) => {}
            Err(status) => return Err(status.into()),
        }
        Ok(())
    }

    pub(super) fn next_msg_id(&mut self) -> u16 {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        msg_id
    }

    pub(super) fn restart_keep_alive(&mut self) {
        self.ping_deadline = match self.config.keep_alive {
            0 => None,
            seconds => Some(self.clock.now_ms() + seconds as u64 * 1000),
        };
    }

    fn lose_gateway(&mut self) {
        self.state = ClientState::GwLost;
        self.gateway = None;
        self.ping_deadline = None;
        self.resumed_from_sleep = false;
        self.inbound_qos2.clear();
    }

    /// Encode and send one message: SEARCHGW is broadcast, everything else goes to the gateway.
    pub(super) fn write_msg(&mut self, message: &Message) -> Result<(), SnError> {
        let bytes = message.to_bytes()?;
        let dest = match message {
            Message::SearchGw { .. } => MULTICAST_ADDRESS,
            _ => self
                .gateway
                .map(|gateway| gateway.address)
                .ok_or(SnError::InvalidState(self.state))?,
        };
        debug!(
            "Send {:?} to {:#04x} ({}B).",
            message.msg_type(),
            dest,
            bytes.len()
        );
        self.link
            .send(dest, PayloadType::MQTT_SN, &bytes, self.config.send_timeout_ms)?;
        Ok(())
    }

    /// Receive one MQTT-SN message. Foreign payload types and malformed messages yield `None`.
    fn read_msg(&mut self, timeout_ms: u32) -> Result<Option<(Message, Origin)>, LinkStatus> {
        let received = self.link.receive(timeout_ms)?;
        let header = received.packet.header;
        let origin = Origin {
            pan_id: header.pan_id,
            address: header.source,
            rssi: received.rssi,
            snr: received.snr,
        };
        self.last_origin = Some(origin);
        if header.payload_type != PayloadType::MQTT_SN {
            trace!("Ignoring payload type {:?}.", header.payload_type);
            return Ok(None);
        }
        match Message::try_from_bytes(&received.packet.payload) {
            Ok(message) => {
                debug!("Recv {:?} from {:#04x}.", message.msg_type(), origin.address);
                Ok(Some((message, origin)))
            }
            Err(err) => {
                warn!(
                    "Dropping malformed message from {:#04x}: {}",
                    origin.address, err
                );
                Ok(None)
            }
        }
    }

    /// Dispatch inbound messages until `done` holds or `timeout_ms` elapsed.
    pub(super) fn wait_until<F>(&mut self, timeout_ms: u32, done: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = self.clock.now_ms() + timeout_ms as u64;
        while !done(self) {
            let remaining = deadline.saturating_sub(self.clock.now_ms());
            if remaining == 0 {
                break;
            }
            match self.read_msg(remaining.min(u32::MAX as u64) as u32) {
                Ok(Some((message, origin))) => self.dispatch(message, origin),
                Ok(None) => {}
                Err(LinkStatus::RxTimeout) => break,
                Err(status) => {
                    warn!("Receive failed: {}", status);
                    break;
                }
            }
        }
        done(self)
    }

    /// Send `request` until `done` holds, at most `retry_count` times. Retransmissions carry
    /// the DUP flag where the message type has one.
    pub(super) fn exchange<F>(&mut self, request: &Message, done: F) -> Result<(), SnError>
    where
        F: Fn(&Self) -> bool,
    {
        let attempts = self.config.retry_count;
        for attempt in 1..=attempts {
            let message = if attempt == 1 {
                request.clone()
            } else {
                request.as_duplicate()
            };
            match self.write_msg(&message) {
                Ok(()) => {
                    if self.wait_until(self.config.response_timeout_ms, &done) {
                        return Ok(());
                    }
                    debug!(
                        "No response to {:?} ({}/{}).",
                        request.msg_type(),
                        attempt,
                        attempts
                    );
                }
                Err(SnError::Link(status)) => warn!(
                    "Sending {:?} failed ({}/{}): {}",
                    request.msg_type(),
                    attempt,
                    attempts,
                    status
                ),
                Err(err) => return Err(err),
            }
        }
        info!(
            "Giving up on {:?} after {} attempts.",
            request.msg_type(),
            attempts
        );
        Err(SnError::RetryExhausted)
    }

    /// Reply without waiting for anything in return.
    pub(super) fn reply(&mut self, message: &Message) {
        if let Err(err) = self.write_msg(message) {
            warn!("Unable to send {:?}: {}", message.msg_type(), err);
        }
    }

    fn drain_publications(&mut self) {
        let timeout = self.config.response_timeout_ms;
        while let Ok(received) = self.read_msg(timeout) {
            if let Some((message, origin)) = received {
                self.dispatch(message, origin);
            }
        }
        self.awaiting_publish = false;
    }

    fn from_gateway(&self, origin: &Origin) -> bool {
        self.gateway
            .map_or(false, |gateway| gateway.address == origin.address)
    }

    pub(super) fn dispatch(&mut self, message: Message, origin: Origin) {
        let discovery = matches!(message, Message::GwInfo { .. } | Message::Advertise { .. });
        if !discovery && !self.from_gateway(&origin) {
            debug!(
                "Ignoring {:?} from {:#04x}, not our gateway.",
                message.msg_type(),
                origin.address
            );
            return;
        }

        match message {
            Message::GwInfo { gw_id, .. } => self.on_gateway_info(gw_id, origin),
            Message::Advertise { gw_id, duration } => self.on_advertise(gw_id, duration),
            Message::WillTopicReq if self.state == ClientState::WaitWillTopicReq => {
                self.state = ClientState::SendWillTopic
            }
            Message::WillMsgReq if self.state == ClientState::WaitWillMsgReq => {
                self.state = ClientState::SendWillMsg
            }
            Message::ConnAck { return_code } => self.on_connack(return_code, origin),
            Message::Publish {
                flags,
                topic_id,
                msg_id,
                payload,
            } => self.on_publish(flags, topic_id, msg_id, &payload, origin),
            Message::PubAck {
                topic_id,
                msg_id,
                return_code,
            } => self.on_puback(topic_id, msg_id, return_code),
            Message::PubRec { msg_id } => self.on_pubrec(msg_id),
            Message::PubRel { msg_id } => self.on_pubrel(msg_id),
            Message::PubComp { msg_id } => self.on_pubcomp(msg_id),
            Message::Register {
                topic_id,
                msg_id,
                topic_name,
            } => self.on_register(topic_id, msg_id, topic_name),
            Message::RegAck {
                topic_id,
                msg_id,
                return_code,
            } => self.on_regack(topic_id, msg_id, return_code),
            Message::SubAck {
                flags,
                topic_id,
                msg_id,
                return_code,
            } => self.on_suback(flags, topic_id, msg_id, return_code),
            Message::UnsubAck { msg_id } => self.on_unsuback(msg_id),
            Message::PingResp => self.on_pingresp(),
            Message::Disconnect { .. } => self.on_disconnect(),
            other => trace!(
                "Ignoring {:?} in state {:?}.",
                other.msg_type(),
                self.state
            ),
        }
    }

    fn on_gateway_info(&mut self, gw_id: u8, origin: Origin) {
        if self.state != ClientState::Searching {
            return;
        }
        info!("Found gateway {} at {:#04x}.", gw_id, origin.address);
        self.gateway = Some(Gateway {
            id: gw_id,
            pan_id: origin.pan_id,
            address: origin.address,
        });
        self.state = ClientState::Connecting;
    }

    fn on_advertise(&mut self, gw_id: u8, duration: u16) {
        let interval = if duration < 61 {
            duration as u64 * 1500
        } else {
            duration as u64 * 1100
        };
        trace!("Gateway {} advertises every {}s.", gw_id, duration);
        self.advertise_interval_ms = Some(interval);
    }

    fn on_connack(&mut self, return_code: ReturnCode, origin: Origin) {
        if self.state != ClientState::WaitConnAck {
            return;
        }
        if return_code != ReturnCode::Accepted {
            warn!("Connection rejected ({:?}).", return_code);
            self.connack_rejection = Some(return_code);
            self.state = ClientState::Connecting;
            return;
        }
        if let Some(gateway) = self.gateway.as_mut() {
            gateway.pan_id = origin.pan_id;
        }
        self.state = ClientState::Active;
        self.restart_keep_alive();
        if self.config.clean_session {
            self.topics.clear();
            self.inbound_qos2.clear();
        }
    }

    fn on_pingresp(&mut self) {
        match self.state {
            ClientState::Awake => {
                self.state = ClientState::Asleep;
                self.wake_deadline = self
                    .sleep_duration
                    .map(|seconds| self.clock.now_ms() + seconds as u64 * 1000);
            }
            ClientState::WaitPingResp => self.state = ClientState::Active,
            _ => {}
        }
        self.restart_keep_alive();
    }

    fn on_disconnect(&mut self) {
        self.ping_deadline = None;
        match (self.state, self.sleep_duration) {
            (ClientState::Disconnecting, Some(seconds)) => {
                info!("Asleep for {}s.", seconds);
                self.state = ClientState::Asleep;
                self.resumed_from_sleep = true;
                self.wake_deadline = Some(self.clock.now_ms() + seconds as u64 * 1000);
            }
            _ => {
                info!("Disconnected from gateway.");
                self.state = ClientState::Disconnected;
                self.resumed_from_sleep = false;
                self.wake_deadline = None;
            }
        }
    }
}
