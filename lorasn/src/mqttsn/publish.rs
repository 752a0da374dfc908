//! Outbound publish handshakes and inbound publication delivery.
use log::{debug, info, warn};

use super::client::{Origin, SnClient};
use super::message::{Flags, Message, QoS, ReturnCode, TopicType};
use super::topic::{short_topic_id, Publication};
use super::{SnError, Topic, MAX_MESSAGE_LENGTH, MAX_TOPIC_LENGTH};
use crate::device::LinkTransport;
use crate::time::Clock;

/// Bytes preceding the payload in a PUBLISH message.
pub const PUBLISH_HEADER_LENGTH: usize = 7;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishStatus {
    /// Waiting for the topic registration.
    Suspended,
    Ready,
    WaitPubAck,
    WaitPubRec,
    WaitPubComp,
    Rejected(ReturnCode),
    Done,
}

/// The single publication in flight.
#[derive(Clone, Debug)]
pub(super) struct PendingPublish {
    pub msg_id: u16,
    pub topic: Topic,
    pub topic_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub status: PublishStatus,
}

impl PendingPublish {
    fn to_message(&self) -> Message {
        Message::Publish {
            flags: Flags::new()
                .with_qos(self.qos)
                .with_retain(self.retain)
                .with_topic_type(self.topic.topic_type()),
            topic_id: self.topic_id,
            msg_id: self.msg_id,
            payload: self.payload.clone(),
        }
    }
}

impl<T, C> SnClient<T, C>
where
    T: LinkTransport,
    C: Clock,
{
    /// Publish `payload` on `topic`.
    ///
    /// Topic names without an id are registered first, the publication being released by the
    /// REGACK. QoS 1 waits for PUBACK and QoS 2 for PUBREC then PUBCOMP, while QoS 0 and -1
    /// complete once the message left the radio. QoS -1 needs a predefined or short topic and
    /// does not connect.
    pub fn publish(
        &mut self,
        topic: &Topic,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SnError> {
        let max = MAX_MESSAGE_LENGTH
            .min(self.link.max_payload())
            .saturating_sub(PUBLISH_HEADER_LENGTH);
        if payload.len() > max {
            return Err(SnError::PayloadTooLong {
                size: payload.len(),
                max,
            });
        }
        let topic_type = topic.topic_type();
        if qos == QoS::FireAndForget && topic_type == TopicType::Normal {
            return Err(SnError::ParameterInvalid {
                context: "QoS -1 needs a predefined or short topic.".to_owned(),
            });
        }
        if self.qos_m1 && qos != QoS::FireAndForget {
            return Err(SnError::ParameterInvalid {
                context: format!("{:?} is not available without a connection.", qos),
            });
        }
        let topic_id = match topic {
            Topic::Predefined(id) => *id,
            Topic::Name(name) => {
                if name.len() > MAX_TOPIC_LENGTH {
                    return Err(SnError::TopicTooLong {
                        size: name.len(),
                        max: MAX_TOPIC_LENGTH,
                    });
                }
                if name.is_empty() || name.contains(['+', '#']) {
                    return Err(SnError::ParameterInvalid {
                        context: format!("Cannot publish on topic {:?}.", name),
                    });
                }
                match topic_type {
                    TopicType::Short => short_topic_id(name).unwrap_or_default(),
                    _ => self.topics.id_of(name),
                }
            }
        };

        if qos != QoS::FireAndForget {
            self.connect()?;
        }
        let msg_id = if qos.is_acknowledged() {
            self.next_msg_id()
        } else {
            0
        };
        let status = if topic_id == 0 {
            PublishStatus::Suspended
        } else {
            PublishStatus::Ready
        };
        self.pending_publish = Some(PendingPublish {
            msg_id,
            topic: topic.clone(),
            topic_id,
            qos,
            retain,
            payload: payload.to_vec(),
            status,
        });
        let result = self.drive_publish();
        self.pending_publish = None;
        result
    }

    fn publish_status(&self) -> Option<PublishStatus> {
        self.pending_publish.as_ref().map(|pending| pending.status)
    }

    fn drive_publish(&mut self) -> Result<(), SnError> {
        // The first registration plus one after an invalid topic id rejection.
        let mut registrations = 0;
        loop {
            let pending = match &self.pending_publish {
                Some(pending) => pending.clone(),
                None => return Ok(()),
            };
            match pending.status {
                PublishStatus::Done => return Ok(()),
                PublishStatus::Rejected(return_code) => {
                    return Err(SnError::Rejected(return_code))
                }
                PublishStatus::Suspended => {
                    let name = match pending.topic.name() {
                        Some(name) if registrations < 2 => name.to_owned(),
                        _ => return Err(SnError::Rejected(ReturnCode::InvalidTopicId)),
                    };
                    registrations += 1;
                    debug!("Publish on {} suspended until registration.", name);
                    self.register_topic(&name)?;
                }
                PublishStatus::Ready => self.transmit_publish(&pending)?,
                PublishStatus::WaitPubComp => {
                    let request = Message::PubRel {
                        msg_id: pending.msg_id,
                    };
                    self.exchange(&request, |client| {
                        client.publish_status() != Some(PublishStatus::WaitPubComp)
                    })?;
                }
                PublishStatus::WaitPubAck | PublishStatus::WaitPubRec => {
                    return Err(SnError::InvalidState(self.state))
                }
            }
        }
    }

    fn transmit_publish(&mut self, pending: &PendingPublish) -> Result<(), SnError> {
        let request = pending.to_message();
        let waiting = match pending.qos {
            QoS::FireAndForget | QoS::AtMostOnce => {
                self.write_msg(&request)?;
                self.set_publish_status(PublishStatus::Done);
                self.restart_keep_alive();
                return Ok(());
            }
            QoS::AtLeastOnce => PublishStatus::WaitPubAck,
            QoS::ExactlyOnce => PublishStatus::WaitPubRec,
        };
        self.set_publish_status(waiting);
        self.exchange(&request, move |client| {
            client.publish_status() != Some(waiting)
        })?;
        self.restart_keep_alive();
        Ok(())
    }

    fn set_publish_status(&mut self, status: PublishStatus) {
        if let Some(pending) = self.pending_publish.as_mut() {
            pending.status = status;
        }
    }

    /// Hand the topic id from a REGACK to the publication waiting for it.
    pub(super) fn release_suspended(&mut self, name: &str, topic_id: u16) {
        if let Some(pending) = self.pending_publish.as_mut() {
            if pending.status == PublishStatus::Suspended && pending.topic.name() == Some(name) {
                debug!("Releasing publish on {} with topic id {}.", name, topic_id);
                pending.topic_id = topic_id;
                pending.status = PublishStatus::Ready;
            }
        }
    }

    pub(super) fn on_puback(&mut self, topic_id: u16, msg_id: u16, return_code: ReturnCode) {
        let pending = match self.pending_publish.as_mut() {
            Some(pending)
                if pending.msg_id == msg_id && pending.status == PublishStatus::WaitPubAck =>
            {
                pending
            }
            _ => {
                debug!("Unexpected PUBACK for message {}.", msg_id);
                return;
            }
        };
        match return_code {
            ReturnCode::Accepted => pending.status = PublishStatus::Done,
            ReturnCode::InvalidTopicId => {
                info!("Topic id {} rejected, registering again.", topic_id);
                pending.topic_id = 0;
                pending.status = PublishStatus::Suspended;
                if let Some(name) = pending.topic.name() {
                    self.topics.set_id(name, 0, TopicType::Normal);
                }
            }
            other => {
                warn!("Publish {} rejected ({:?}).", msg_id, other);
                pending.status = PublishStatus::Rejected(other);
            }
        }
    }

    pub(super) fn on_pubrec(&mut self, msg_id: u16) {
        match self.publish_status() {
            Some(PublishStatus::WaitPubRec) if self.pending_msg_id() == Some(msg_id) => {
                self.set_publish_status(PublishStatus::WaitPubComp)
            }
            // Our PUBREL was lost.
            Some(PublishStatus::WaitPubComp) if self.pending_msg_id() == Some(msg_id) => {
                self.reply(&Message::PubRel { msg_id })
            }
            _ => debug!("Unexpected PUBREC for message {}.", msg_id),
        }
    }

    pub(super) fn on_pubcomp(&mut self, msg_id: u16) {
        match self.publish_status() {
            Some(PublishStatus::WaitPubComp) if self.pending_msg_id() == Some(msg_id) => {
                self.set_publish_status(PublishStatus::Done)
            }
            _ => debug!("Unexpected PUBCOMP for message {}.", msg_id),
        }
    }

    fn pending_msg_id(&self) -> Option<u16> {
        self.pending_publish.as_ref().map(|pending| pending.msg_id)
    }

    /// Inbound PUBLISH: deliver it to the topic handler and acknowledge as its QoS requires.
    /// QoS 2 publications are delivered once, on the first copy.
    pub(super) fn on_publish(
        &mut self,
        flags: Flags,
        topic_id: u16,
        msg_id: u16,
        payload: &[u8],
        origin: Origin,
    ) {
        let topic_type = match flags.topic_type() {
            Ok(topic_type) => topic_type,
            Err(err) => {
                warn!("Dropping publish on topic {}: {}", topic_id, err);
                return;
            }
        };
        let qos = flags.qos();
        let duplicate = qos == QoS::ExactlyOnce && self.inbound_qos2.contains(&msg_id);
        let known = match self.topics.get_by_id(topic_id, topic_type) {
            Some(entry) => {
                match &entry.handler {
                    Some(handler) if !duplicate => handler.on_publish(&Publication {
                        topic_id,
                        topic_type,
                        topic_name: Some(entry.name.as_str()).filter(|name| !name.is_empty()),
                        qos,
                        retain: flags.retain(),
                        payload,
                        rssi: origin.rssi,
                        snr: origin.snr,
                    }),
                    Some(_) => debug!("Duplicate publish {} on topic {}.", msg_id, topic_id),
                    None => debug!("No handler for topic {}.", topic_id),
                }
                true
            }
            None => {
                warn!("Publish on unknown topic {} ({:?}).", topic_id, topic_type);
                false
            }
        };

        let return_code = if known {
            ReturnCode::Accepted
        } else {
            ReturnCode::InvalidTopicId
        };
        match qos {
            QoS::AtLeastOnce => self.reply(&Message::PubAck {
                topic_id,
                msg_id,
                return_code,
            }),
            QoS::ExactlyOnce if known => {
                if !duplicate {
                    self.inbound_qos2.push(msg_id);
                }
                self.reply(&Message::PubRec { msg_id })
            }
            QoS::ExactlyOnce => self.reply(&Message::PubAck {
                topic_id,
                msg_id,
                return_code,
            }),
            QoS::AtMostOnce | QoS::FireAndForget => {}
        }
    }

    pub(super) fn on_pubrel(&mut self, msg_id: u16) {
        self.inbound_qos2.retain(|id| *id != msg_id);
        self.reply(&Message::PubComp { msg_id });
    }
}
