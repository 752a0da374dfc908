//! MQTT-SN v1.2 message codec (single byte length form).
use serde::Deserialize;

use super::MAX_MESSAGE_LENGTH;

/// Version carried by CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

pub const FLAG_DUP: u8 = 0x80;
pub const FLAG_QOS_MASK: u8 = 0x60;
pub const FLAG_RETAIN: u8 = 0x10;
pub const FLAG_WILL: u8 = 0x08;
pub const FLAG_CLEAN_SESSION: u8 = 0x04;
pub const FLAG_TOPIC_TYPE_MASK: u8 = 0x03;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    ConnAck = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    RegAck = 0x0B,
    Publish = 0x0C,
    PubAck = 0x0D,
    PubComp = 0x0E,
    PubRec = 0x0F,
    PubRel = 0x10,
    Subscribe = 0x12,
    SubAck = 0x13,
    Unsubscribe = 0x14,
    UnsubAck = 0x15,
    PingReq = 0x16,
    PingResp = 0x17,
    Disconnect = 0x18,
}

impl TryFrom<u8> for MsgType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => MsgType::Advertise,
            0x01 => MsgType::SearchGw,
            0x02 => MsgType::GwInfo,
            0x04 => MsgType::Connect,
            0x05 => MsgType::ConnAck,
            0x06 => MsgType::WillTopicReq,
            0x07 => MsgType::WillTopic,
            0x08 => MsgType::WillMsgReq,
            0x09 => MsgType::WillMsg,
            0x0A => MsgType::Register,
            0x0B => MsgType::RegAck,
            0x0C => MsgType::Publish,
            0x0D => MsgType::PubAck,
            0x0E => MsgType::PubComp,
            0x0F => MsgType::PubRec,
            0x10 => MsgType::PubRel,
            0x12 => MsgType::Subscribe,
            0x13 => MsgType::SubAck,
            0x14 => MsgType::Unsubscribe,
            0x15 => MsgType::UnsubAck,
            0x16 => MsgType::PingReq,
            0x17 => MsgType::PingResp,
            0x18 => MsgType::Disconnect,
            other => return Err(MessageError::UnsupportedType(other)),
        })
    }
}

/// Quality of service, including the connectionless QoS -1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(try_from = "i8")]
pub enum QoS {
    FireAndForget,
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn flags(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0x00,
            QoS::AtLeastOnce => 0x20,
            QoS::ExactlyOnce => 0x40,
            QoS::FireAndForget => 0x60,
        }
    }

    pub fn from_flags(flags: u8) -> Self {
        match flags & FLAG_QOS_MASK {
            0x00 => QoS::AtMostOnce,
            0x20 => QoS::AtLeastOnce,
            0x40 => QoS::ExactlyOnce,
            _ => QoS::FireAndForget,
        }
    }

    /// Whether the receiver acknowledges the publication.
    pub fn is_acknowledged(&self) -> bool {
        *self >= QoS::AtLeastOnce
    }
}

impl TryFrom<i8> for QoS {
    type Error = MessageError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(QoS::FireAndForget),
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MessageError::InvalidQoS(other)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TopicType {
    Normal = 0,
    Predefined = 1,
    Short = 2,
}

impl TopicType {
    pub fn from_flags(flags: u8) -> Result<Self, MessageError> {
        match flags & FLAG_TOPIC_TYPE_MASK {
            0 => Ok(TopicType::Normal),
            1 => Ok(TopicType::Predefined),
            2 => Ok(TopicType::Short),
            _ => Err(MessageError::InvalidTopicType),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnCode {
    Accepted = 0x00,
    Congestion = 0x01,
    InvalidTopicId = 0x02,
    NotSupported = 0x03,
}

impl From<u8> for ReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ReturnCode::Accepted,
            0x01 => ReturnCode::Congestion,
            0x02 => ReturnCode::InvalidTopicId,
            _ => ReturnCode::NotSupported,
        }
    }
}

/// Compact representation of the flags byte.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub fn new() -> Self {
        Self(0)
    }

    fn with(self, mask: u8, on: bool) -> Self {
        if on {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    pub fn with_dup(self, dup: bool) -> Self {
        self.with(FLAG_DUP, dup)
    }

    pub fn with_qos(self, qos: QoS) -> Self {
        Self((self.0 & !FLAG_QOS_MASK) | qos.flags())
    }

    pub fn with_retain(self, retain: bool) -> Self {
        self.with(FLAG_RETAIN, retain)
    }

    pub fn with_will(self, will: bool) -> Self {
        self.with(FLAG_WILL, will)
    }

    pub fn with_clean_session(self, clean: bool) -> Self {
        self.with(FLAG_CLEAN_SESSION, clean)
    }

    pub fn with_topic_type(self, topic_type: TopicType) -> Self {
        Self((self.0 & !FLAG_TOPIC_TYPE_MASK) | topic_type as u8)
    }

    pub fn dup(&self) -> bool {
        self.0 & FLAG_DUP != 0
    }

    pub fn qos(&self) -> QoS {
        QoS::from_flags(self.0)
    }

    pub fn retain(&self) -> bool {
        self.0 & FLAG_RETAIN != 0
    }

    pub fn will(&self) -> bool {
        self.0 & FLAG_WILL != 0
    }

    pub fn clean_session(&self) -> bool {
        self.0 & FLAG_CLEAN_SESSION != 0
    }

    pub fn topic_type(&self) -> Result<TopicType, MessageError> {
        TopicType::from_flags(self.0)
    }
}

impl From<u8> for Flags {
    fn from(inner: u8) -> Self {
        Flags(inner)
    }
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> Self {
        flags.0
    }
}

/// Topic field of SUBSCRIBE/UNSUBSCRIBE: a name for normal and short topics, an id otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TopicField {
    Name(String),
    Id(u16),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Advertise { gw_id: u8, duration: u16 },
    SearchGw { radius: u8 },
    GwInfo { gw_id: u8, gw_address: Vec<u8> },
    Connect { flags: Flags, duration: u16, client_id: String },
    ConnAck { return_code: ReturnCode },
    WillTopicReq,
    WillTopic { flags: Flags, topic: String },
    WillMsgReq,
    WillMsg { message: Vec<u8> },
    Register { topic_id: u16, msg_id: u16, topic_name: String },
    RegAck { topic_id: u16, msg_id: u16, return_code: ReturnCode },
    Publish { flags: Flags, topic_id: u16, msg_id: u16, payload: Vec<u8> },
    PubAck { topic_id: u16, msg_id: u16, return_code: ReturnCode },
    PubRec { msg_id: u16 },
    PubRel { msg_id: u16 },
    PubComp { msg_id: u16 },
    Subscribe { flags: Flags, msg_id: u16, topic: TopicField },
    SubAck { flags: Flags, topic_id: u16, msg_id: u16, return_code: ReturnCode },
    Unsubscribe { flags: Flags, msg_id: u16, topic: TopicField },
    UnsubAck { msg_id: u16 },
    PingReq { client_id: Option<String> },
    PingResp,
    Disconnect { duration: Option<u16> },
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, MessageError> {
        let byte = *self.bytes.get(self.position).ok_or(MessageError::Truncated)?;
        self.position += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, MessageError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.position.min(self.bytes.len())..];
        self.position = self.bytes.len();
        rest
    }

    fn string(&mut self) -> Result<String, MessageError> {
        String::from_utf8(self.rest().to_vec()).map_err(|_| MessageError::InvalidUtf8)
    }

    fn is_empty(&self) -> bool {
        self.position >= self.bytes.len()
    }
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Advertise { .. } => MsgType::Advertise,
            Message::SearchGw { .. } => MsgType::SearchGw,
            Message::GwInfo { .. } => MsgType::GwInfo,
            Message::Connect { .. } => MsgType::Connect,
            Message::ConnAck { .. } => MsgType::ConnAck,
            Message::WillTopicReq => MsgType::WillTopicReq,
            Message::WillTopic { .. } => MsgType::WillTopic,
            Message::WillMsgReq => MsgType::WillMsgReq,
            Message::WillMsg { .. } => MsgType::WillMsg,
            Message::Register { .. } => MsgType::Register,
            Message::RegAck { .. } => MsgType::RegAck,
            Message::Publish { .. } => MsgType::Publish,
            Message::PubAck { .. } => MsgType::PubAck,
            Message::PubRec { .. } => MsgType::PubRec,
            Message::PubRel { .. } => MsgType::PubRel,
            Message::PubComp { .. } => MsgType::PubComp,
            Message::Subscribe { .. } => MsgType::Subscribe,
            Message::SubAck { .. } => MsgType::SubAck,
            Message::Unsubscribe { .. } => MsgType::Unsubscribe,
            Message::UnsubAck { .. } => MsgType::UnsubAck,
            Message::PingReq { .. } => MsgType::PingReq,
            Message::PingResp => MsgType::PingResp,
            Message::Disconnect { .. } => MsgType::Disconnect,
        }
    }

    /// Same message flagged as a retransmission, for the messages carrying a DUP bit.
    pub fn as_duplicate(&self) -> Message {
        match self.clone() {
            Message::Publish {
                flags,
                topic_id,
                msg_id,
                payload,
            } => Message::Publish {
                flags: flags.with_dup(true),
                topic_id,
                msg_id,
                payload,
            },
            Message::Subscribe { flags, msg_id, topic } => Message::Subscribe {
                flags: flags.with_dup(true),
                msg_id,
                topic,
            },
            other => other,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = vec![0u8, self.msg_type() as u8];
        fn topic(bytes: &mut Vec<u8>, topic: &TopicField) {
            match topic {
                TopicField::Name(name) => bytes.extend_from_slice(name.as_bytes()),
                TopicField::Id(id) => bytes.extend_from_slice(&id.to_be_bytes()),
            }
        }
        match self {
            Message::Advertise { gw_id, duration } => {
                bytes.push(*gw_id);
                bytes.extend_from_slice(&duration.to_be_bytes());
            }
            Message::SearchGw { radius } => bytes.push(*radius),
            Message::GwInfo { gw_id, gw_address } => {
                bytes.push(*gw_id);
                bytes.extend_from_slice(gw_address);
            }
            Message::Connect {
                flags,
                duration,
                client_id,
            } => {
                bytes.push((*flags).into());
                bytes.push(PROTOCOL_ID);
                bytes.extend_from_slice(&duration.to_be_bytes());
                bytes.extend_from_slice(client_id.as_bytes());
            }
            Message::ConnAck { return_code } => bytes.push(*return_code as u8),
            Message::WillTopicReq | Message::WillMsgReq | Message::PingResp => {}
            Message::WillTopic { flags, topic } => {
                bytes.push((*flags).into());
                bytes.extend_from_slice(topic.as_bytes());
            }
            Message::WillMsg { message } => bytes.extend_from_slice(message),
            Message::Register {
                topic_id,
                msg_id,
                topic_name,
            } => {
                bytes.extend_from_slice(&topic_id.to_be_bytes());
                bytes.extend_from_slice(&msg_id.to_be_bytes());
                bytes.extend_from_slice(topic_name.as_bytes());
            }
            Message::RegAck {
                topic_id,
                msg_id,
                return_code,
            }
            | Message::PubAck {
                topic_id,
                msg_id,
                return_code,
            } => {
                bytes.extend_from_slice(&topic_id.to_be_bytes());
                bytes.extend_from_slice(&msg_id.to_be_bytes());
                bytes.push(*return_code as u8);
            }
            Message::Publish {
                flags,
                topic_id,
                msg_id,
                payload,
            } => {
                bytes.push((*flags).into());
                bytes.extend_from_slice(&topic_id.to_be_bytes());
                bytes.extend_from_slice(&msg_id.to_be_bytes());
                bytes.extend_from_slice(payload);
            }
            Message::PubRec { msg_id }
            | Message::PubRel { msg_id }
            | Message::PubComp { msg_id }
            | Message::UnsubAck { msg_id } => bytes.extend_from_slice(&msg_id.to_be_bytes()),
            Message::Subscribe {
                flags,
                msg_id,
                topic: field,
            }
            | Message::Unsubscribe {
                flags,
                msg_id,
                topic: field,
            } => {
                bytes.push((*flags).into());
                bytes.extend_from_slice(&msg_id.to_be_bytes());
                topic(&mut bytes, field);
            }
            Message::SubAck {
                flags,
                topic_id,
                msg_id,
                return_code,
            } => {
                bytes.push((*flags).into());
                bytes.extend_from_slice(&topic_id.to_be_bytes());
                bytes.extend_from_slice(&msg_id.to_be_bytes());
                bytes.push(*return_code as u8);
            }
            Message::PingReq { client_id } => {
                if let Some(client_id) = client_id {
                    bytes.extend_from_slice(client_id.as_bytes());
                }
            }
            Message::Disconnect { duration } => {
                if let Some(duration) = duration {
                    bytes.extend_from_slice(&duration.to_be_bytes());
                }
            }
        }
        if bytes.len() > MAX_MESSAGE_LENGTH {
            return Err(MessageError::TooLong { size: bytes.len() });
        }
        bytes[0] = bytes.len() as u8;
        Ok(bytes)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < 2 {
            return Err(MessageError::Truncated);
        }
        let length = bytes[0] as usize;
        if length == 0x01 {
            return Err(MessageError::UnsupportedLength);
        }
        if length < 2 || length > bytes.len() {
            return Err(MessageError::Truncated);
        }
        let msg_type = MsgType::try_from(bytes[1])?;
        let mut r = Reader {
            bytes: &bytes[..length],
            position: 2,
        };
        let message = match msg_type {
            MsgType::Advertise => Message::Advertise {
                gw_id: r.u8()?,
                duration: r.u16()?,
            },
            MsgType::SearchGw => Message::SearchGw { radius: r.u8()? },
            MsgType::GwInfo => Message::GwInfo {
                gw_id: r.u8()?,
                gw_address: r.rest().to_vec(),
            },
            MsgType::Connect => {
                let flags = Flags::from(r.u8()?);
                let protocol = r.u8()?;
                if protocol != PROTOCOL_ID {
                    return Err(MessageError::UnsupportedProtocol(protocol));
                }
                Message::Connect {
                    flags,
                    duration: r.u16()?,
                    client_id: r.string()?,
                }
            }
            MsgType::ConnAck => Message::ConnAck {
                return_code: ReturnCode::from(r.u8()?),
            },
            MsgType::WillTopicReq => Message::WillTopicReq,
            MsgType::WillTopic => Message::WillTopic {
                flags: Flags::from(r.u8()?),
                topic: r.string()?,
            },
            MsgType::WillMsgReq => Message::WillMsgReq,
            MsgType::WillMsg => Message::WillMsg {
                message: r.rest().to_vec(),
            },
            MsgType::Register => Message::Register {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                topic_name: r.string()?,
            },
            MsgType::RegAck => Message::RegAck {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                return_code: ReturnCode::from(r.u8()?),
            },
            MsgType::Publish => Message::Publish {
                flags: Flags::from(r.u8()?),
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                payload: r.rest().to_vec(),
            },
            MsgType::PubAck => Message::PubAck {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                return_code: ReturnCode::from(r.u8()?),
            },
            MsgType::PubRec => Message::PubRec { msg_id: r.u16()? },
            MsgType::PubRel => Message::PubRel { msg_id: r.u16()? },
            MsgType::PubComp => Message::PubComp { msg_id: r.u16()? },
            MsgType::Subscribe | MsgType::Unsubscribe => {
                let flags = Flags::from(r.u8()?);
                let msg_id = r.u16()?;
                let topic = match flags.topic_type()? {
                    TopicType::Predefined => TopicField::Id(r.u16()?),
                    _ => TopicField::Name(r.string()?),
                };
                if msg_type == MsgType::Subscribe {
                    Message::Subscribe { flags, msg_id, topic }
                } else {
                    Message::Unsubscribe { flags, msg_id, topic }
                }
            }
            MsgType::SubAck => Message::SubAck {
                flags: Flags::from(r.u8()?),
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                return_code: ReturnCode::from(r.u8()?),
            },
            MsgType::UnsubAck => Message::UnsubAck { msg_id: r.u16()? },
            MsgType::PingReq => Message::PingReq {
                client_id: if r.is_empty() { None } else { Some(r.string()?) },
            },
            MsgType::PingResp => Message::PingResp,
            MsgType::Disconnect => Message::Disconnect {
                duration: if r.is_empty() { None } else { Some(r.u16()?) },
            },
        };
        Ok(message)
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum MessageError {
    #[error("Message is truncated.")]
    Truncated,

    #[error("Three bytes length form is not supported.")]
    UnsupportedLength,

    #[error("Message is too long (is: {}B, max: {}B)!", .size, MAX_MESSAGE_LENGTH)]
    TooLong { size: usize },

    #[error("Unsupported message type {:#04x}.", .0)]
    UnsupportedType(u8),

    #[error("Unsupported protocol id {:#04x}.", .0)]
    UnsupportedProtocol(u8),

    #[error("Reserved topic type.")]
    InvalidTopicType,

    #[error("Invalid QoS {}.", .0)]
    InvalidQoS(i8),

    #[error("Topic name or client id is not valid UTF-8.")]
    InvalidUtf8,
}
