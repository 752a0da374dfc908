//! Topic registration, in both directions.
use log::{debug, info, warn};

use super::client::SnClient;
use super::message::{Message, ReturnCode, TopicType};
use super::{SnError, MAX_TOPIC_LENGTH};
use crate::device::LinkTransport;
use crate::time::Clock;

/// The single registration in flight.
#[derive(Clone, Debug)]
pub(super) struct PendingRegister {
    pub msg_id: u16,
    pub topic_name: String,
    pub outcome: Option<Result<u16, ReturnCode>>,
}

impl<T, C> SnClient<T, C>
where
    T: LinkTransport,
    C: Clock,
{
    /// Ask the gateway for the id of `name` and cache it in the topic table.
    pub fn register_topic(&mut self, name: &str) -> Result<u16, SnError> {
        if name.len() > MAX_TOPIC_LENGTH {
            return Err(SnError::TopicTooLong {
                size: name.len(),
                max: MAX_TOPIC_LENGTH,
            });
        }
        if name.is_empty() || name.contains(['+', '#']) {
            return Err(SnError::ParameterInvalid {
                context: format!("Cannot register topic {:?}.", name),
            });
        }
        if self.qos_m1 {
            return Err(SnError::InvalidState(self.state));
        }
        self.connect()?;

        let msg_id = self.next_msg_id();
        self.pending_register = Some(PendingRegister {
            msg_id,
            topic_name: name.to_owned(),
            outcome: None,
        });
        let request = Message::Register {
            topic_id: 0,
            msg_id,
            topic_name: name.to_owned(),
        };
        let result = self.exchange(&request, |client| {
            client
                .pending_register
                .as_ref()
                .map_or(true, |pending| pending.outcome.is_some())
        });
        let outcome = self
            .pending_register
            .take()
            .and_then(|pending| pending.outcome);
        result?;
        match outcome {
            Some(Ok(topic_id)) => Ok(topic_id),
            Some(Err(return_code)) => Err(SnError::Rejected(return_code)),
            None => Err(SnError::RetryExhausted),
        }
    }

    pub(super) fn on_regack(&mut self, topic_id: u16, msg_id: u16, return_code: ReturnCode) {
        let pending = match self.pending_register.as_mut() {
            Some(pending) if pending.msg_id == msg_id && pending.outcome.is_none() => pending,
            _ => {
                debug!("Unexpected REGACK for message {}.", msg_id);
                return;
            }
        };
        if return_code != ReturnCode::Accepted || topic_id == 0 {
            warn!(
                "Registration of {} rejected ({:?}).",
                pending.topic_name, return_code
            );
            pending.outcome = Some(Err(match return_code {
                ReturnCode::Accepted => ReturnCode::InvalidTopicId,
                other => other,
            }));
            return;
        }

        info!("Topic {} registered as {}.", pending.topic_name, topic_id);
        pending.outcome = Some(Ok(topic_id));
        let name = pending.topic_name.clone();
        self.topics.add(&name, topic_id, TopicType::Normal, None);
        self.release_suspended(&name, topic_id);
    }

    /// Gateway-initiated REGISTER: the gateway is about to publish on a concrete topic that
    /// matched one of our wildcard subscriptions.
    pub(super) fn on_register(&mut self, topic_id: u16, msg_id: u16, topic_name: String) {
        let return_code = match self.topics.find_match(&topic_name) {
            Some(entry) => {
                let handler = entry.handler.clone();
                debug!(
                    "Topic {} registered as {} through {}.",
                    topic_name, topic_id, entry.name
                );
                self.topics
                    .add(&topic_name, topic_id, TopicType::Normal, handler);
                ReturnCode::Accepted
            }
            None => {
                warn!("Gateway registered unexpected topic {}.", topic_name);
                ReturnCode::InvalidTopicId
            }
        };
        self.reply(&Message::RegAck {
            topic_id,
            msg_id,
            return_code,
        });
    }
}
