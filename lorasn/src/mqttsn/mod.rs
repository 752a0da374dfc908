//! MQTT-SN client running over the secured link layer.
//!
//! [SnClient] drives the gateway discovery, connect, register, subscribe and publish handshakes
//! over any [LinkTransport](crate::device::LinkTransport), one outstanding operation of each kind
//! at a time. Inbound publications are routed through the [TopicRegistry] to application handlers.

pub mod client;
pub mod message;
pub mod publish;
pub mod register;
pub mod subscribe;
pub mod topic;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientState, SnClient};
pub use message::{Message, QoS, ReturnCode, TopicType};
pub use topic::{Handler, Publication, TopicHandler, TopicRegistry};

use crate::error::LinkStatus;
use message::MessageError;

/// Largest MQTT-SN message carried in one link packet.
pub const MAX_MESSAGE_LENGTH: usize = 245;
/// Longest topic name accepted by the client.
pub const MAX_TOPIC_LENGTH: usize = 64;
/// Keep-alive interval sent in CONNECT, in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 3600;
/// Attempts made for every acknowledged request.
pub const RETRY_COUNT: u8 = 3;
/// How long each attempt waits for its response.
pub const RESPONSE_TIMEOUT_MS: u32 = 10_000;
/// Bound on channel access for each outgoing message.
pub const SEND_TIMEOUT_MS: u32 = 4000;

/// Topic referenced by publish and subscribe calls.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    /// Topic name or filter. Two character names are sent as short topics.
    Name(String),
    /// Id agreed with the gateway beforehand.
    Predefined(u16),
}

impl Topic {
    pub fn topic_type(&self) -> TopicType {
        match self {
            Topic::Name(name) if name.len() == 2 => TopicType::Short,
            Topic::Name(_) => TopicType::Normal,
            Topic::Predefined(_) => TopicType::Predefined,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Topic::Name(name) => Some(name),
            Topic::Predefined(_) => None,
        }
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::Name(name.to_owned())
    }
}

impl From<u16> for Topic {
    fn from(id: u16) -> Self {
        Topic::Predefined(id)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SnError {
    #[error("No response from the gateway, retry budget exhausted!")]
    RetryExhausted,

    #[error("Operation not allowed while the client is {:?}.", .0)]
    InvalidState(ClientState),

    #[error("Gateway rejected the request ({:?}).", .0)]
    Rejected(ReturnCode),

    #[error("Topic is too long (is: {}B, max: {}B)!", .size, .max)]
    TopicTooLong { size: usize, max: usize },

    #[error("Payload is too long (is: {}B, max: {}B)!", .size, .max)]
    PayloadTooLong { size: usize, max: usize },

    #[error("Invalid parameter. Context: {}", .context)]
    ParameterInvalid { context: String },

    #[error("Link layer failure: {}", .0)]
    Link(#[from] LinkStatus),

    #[error("Malformed message: {}", .0)]
    Message(#[from] MessageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_kinds() {
        assert_eq!(Topic::from("ty").topic_type(), TopicType::Short);
        assert_eq!(Topic::from("sensors/temp").topic_type(), TopicType::Normal);
        assert_eq!(Topic::from(7).topic_type(), TopicType::Predefined);
        assert_eq!(Topic::from(7).name(), None);
    }
}
