//! In-memory link and gateway used by the client tests.
use std::collections::VecDeque;

use super::client::SnClient;
use super::message::{Message, MsgType, QoS, ReturnCode, TopicField, TopicType};
use crate::config::ClientConfig;
use crate::device::frame::{LinkHeader, LinkPacket, PayloadType, RxPacket};
use crate::device::LinkTransport;
use crate::error::LinkStatus;
use crate::time::testing::ManualClock;
use crate::{LoRaAddress, PanId};

type Gateway = Box<dyn FnMut(&Message) -> Vec<Message>>;

/// [LinkTransport] answering every sent message through a scripted gateway.
///
/// Sending takes 50ms, receiving from an empty queue waits the whole timeout.
pub struct ScriptedLink {
    clock: ManualClock,
    gateway: Option<Gateway>,
    inbound: VecDeque<(LoRaAddress, Message)>,
    sent: Vec<(LoRaAddress, Message)>,
}

impl ScriptedLink {
    pub const PAN_ID: PanId = 0x0102;
    pub const ADDRESS: LoRaAddress = 0x05;
    pub const GATEWAY: LoRaAddress = 0x01;
    pub const SEND_TIME_MS: u64 = 50;

    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            gateway: None,
            inbound: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub fn with_gateway<F>(mut self, gateway: F) -> Self
    where
        F: FnMut(&Message) -> Vec<Message> + 'static,
    {
        self.set_gateway(gateway);
        self
    }

    pub fn set_gateway<F>(&mut self, gateway: F)
    where
        F: FnMut(&Message) -> Vec<Message> + 'static,
    {
        self.gateway = Some(Box::new(gateway));
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    /// Queue an unsolicited message from the gateway.
    pub fn push(&mut self, message: Message) {
        self.push_from(Self::GATEWAY, message);
    }

    pub fn push_from(&mut self, source: LoRaAddress, message: Message) {
        self.inbound.push_back((source, message));
    }

    pub fn sent(&self) -> Vec<(LoRaAddress, Message)> {
        self.sent.clone()
    }

    pub fn sent_types(&self) -> Vec<MsgType> {
        self.sent
            .iter()
            .map(|(_, message)| message.msg_type())
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl LinkTransport for ScriptedLink {
    fn send(
        &mut self,
        dest: LoRaAddress,
        payload_type: PayloadType,
        payload: &[u8],
        _timeout_ms: u32,
    ) -> Result<(), LinkStatus> {
        assert_eq!(payload_type, PayloadType::MQTT_SN);
        let message = Message::try_from_bytes(payload).expect("client sent a malformed message");
        self.clock.advance(Self::SEND_TIME_MS);
        if let Some(gateway) = self.gateway.as_mut() {
            for reply in gateway(&message) {
                self.inbound.push_back((Self::GATEWAY, reply));
            }
        }
        self.sent.push((dest, message));
        Ok(())
    }

    fn receive(&mut self, timeout_ms: u32) -> Result<RxPacket, LinkStatus> {
        let (source, message) = match self.inbound.pop_front() {
            Some(inbound) => inbound,
            None => {
                self.clock.advance(timeout_ms as u64);
                return Err(LinkStatus::RxTimeout);
            }
        };
        Ok(RxPacket {
            packet: LinkPacket {
                header: LinkHeader {
                    pan_id: Self::PAN_ID,
                    dest: Self::ADDRESS,
                    source,
                    payload_type: PayloadType::MQTT_SN,
                },
                payload: message.to_bytes().expect("scripted message too long"),
                mic: 0,
            },
            rssi: -60,
            snr: 7,
        })
    }

    fn pan_id(&self) -> PanId {
        Self::PAN_ID
    }

    fn address(&self) -> LoRaAddress {
        Self::ADDRESS
    }

    fn max_payload(&self) -> usize {
        255
    }
}

/// Gateway accepting everything: topic ids are handed out from 1, wildcard subscriptions get 0.
pub fn well_behaved_gateway() -> impl FnMut(&Message) -> Vec<Message> {
    let mut next_topic_id = 0u16;
    let mut assign = move || {
        next_topic_id += 1;
        next_topic_id
    };
    move |message| match message {
        Message::SearchGw { .. } => vec![Message::GwInfo {
            gw_id: 1,
            gw_address: Vec::new(),
        }],
        Message::Connect { flags, .. } if flags.will() => vec![Message::WillTopicReq],
        Message::Connect { .. } | Message::WillMsg { .. } => vec![Message::ConnAck {
            return_code: ReturnCode::Accepted,
        }],
        Message::WillTopic { .. } => vec![Message::WillMsgReq],
        Message::Register { msg_id, .. } => vec![Message::RegAck {
            topic_id: assign(),
            msg_id: *msg_id,
            return_code: ReturnCode::Accepted,
        }],
        Message::Publish {
            flags,
            topic_id,
            msg_id,
            ..
        } => match flags.qos() {
            QoS::AtLeastOnce => vec![Message::PubAck {
                topic_id: *topic_id,
                msg_id: *msg_id,
                return_code: ReturnCode::Accepted,
            }],
            QoS::ExactlyOnce => vec![Message::PubRec { msg_id: *msg_id }],
            _ => Vec::new(),
        },
        Message::PubRel { msg_id } => vec![Message::PubComp { msg_id: *msg_id }],
        Message::Subscribe {
            flags,
            msg_id,
            topic,
        } => {
            let wildcard =
                matches!(topic, TopicField::Name(name) if name.contains(['+', '#']));
            let topic_id = match flags.topic_type() {
                Ok(TopicType::Normal) if !wildcard => assign(),
                _ => 0,
            };
            vec![Message::SubAck {
                flags: *flags,
                topic_id,
                msg_id: *msg_id,
                return_code: ReturnCode::Accepted,
            }]
        }
        Message::Unsubscribe { msg_id, .. } => vec![Message::UnsubAck { msg_id: *msg_id }],
        Message::PingReq { .. } => vec![Message::PingResp],
        Message::Disconnect { .. } => vec![Message::Disconnect { duration: None }],
        _ => Vec::new(),
    }
}

/// Client connected to [well_behaved_gateway] with the given configuration.
pub fn connected_client(
    config: ClientConfig,
) -> (SnClient<ScriptedLink, ManualClock>, ManualClock) {
    let clock = ManualClock::default();
    let link = ScriptedLink::new(clock.clone()).with_gateway(well_behaved_gateway());
    let mut client =
        SnClient::new(link, clock.clone(), &config).expect("valid client configuration");
    client.connect().expect("scripted gateway accepts connections");
    (client, clock)
}
