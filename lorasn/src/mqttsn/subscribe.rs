//! Subscriptions: the application's subscription list and the SUBSCRIBE/UNSUBSCRIBE handshakes.
use log::{debug, info, warn};

use super::client::SnClient;
use super::message::{Flags, Message, QoS, ReturnCode, TopicField, TopicType};
use super::topic::{short_topic_id, Handler};
use super::{SnError, Topic, MAX_TOPIC_LENGTH};
use crate::device::LinkTransport;
use crate::time::Clock;

/// Entry of the subscription list, subscribed again after a clean session connect.
#[derive(Clone)]
pub struct Subscription {
    pub topic: Topic,
    pub qos: QoS,
    pub handler: Handler,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum SubscribeKind {
    Subscribe,
    Unsubscribe,
}

/// The single subscribe or unsubscribe in flight.
#[derive(Clone, Debug)]
pub(super) struct PendingSubscribe {
    pub kind: SubscribeKind,
    pub msg_id: u16,
    pub topic: Topic,
    pub outcome: Option<Result<(), ReturnCode>>,
}

fn check_topic(topic: &Topic, qos: QoS) -> Result<(), SnError> {
    if qos == QoS::FireAndForget {
        return Err(SnError::ParameterInvalid {
            context: "Cannot subscribe with QoS -1.".to_owned(),
        });
    }
    match topic {
        Topic::Name(name) if name.len() > MAX_TOPIC_LENGTH => Err(SnError::TopicTooLong {
            size: name.len(),
            max: MAX_TOPIC_LENGTH,
        }),
        Topic::Name(name) if name.is_empty() => Err(SnError::ParameterInvalid {
            context: "Empty topic name.".to_owned(),
        }),
        _ => Ok(()),
    }
}

fn topic_field(topic: &Topic) -> TopicField {
    match topic {
        Topic::Name(name) => TopicField::Name(name.clone()),
        Topic::Predefined(id) => TopicField::Id(*id),
    }
}

impl<T, C> SnClient<T, C>
where
    T: LinkTransport,
    C: Clock,
{
    /// Add `topic` to the subscription list without contacting the gateway. The list is
    /// subscribed on the next connect.
    pub fn add_subscription(
        &mut self,
        topic: Topic,
        qos: QoS,
        handler: Handler,
    ) -> Result<(), SnError> {
        check_topic(&topic, qos)?;
        self.subscriptions.retain(|subscription| subscription.topic != topic);
        self.subscriptions.push(Subscription {
            topic,
            qos,
            handler,
        });
        Ok(())
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// Subscribe to a topic name, filter or predefined id, connecting first if needed.
    ///
    /// The subscription is kept in the subscription list.
    pub fn subscribe(&mut self, topic: Topic, qos: QoS, handler: Handler) -> Result<(), SnError> {
        check_topic(&topic, qos)?;
        if self.qos_m1 {
            return Err(SnError::InvalidState(self.state));
        }
        self.connect()?;
        self.add_subscription(topic.clone(), qos, handler.clone())?;
        self.send_subscribe(&topic, qos, handler)
    }

    /// Subscribe every entry of the subscription list.
    pub(super) fn subscribe_all(&mut self) -> Result<(), SnError> {
        let subscriptions = self.subscriptions.clone();
        for subscription in subscriptions {
            match self.send_subscribe(&subscription.topic, subscription.qos, subscription.handler) {
                Ok(()) | Err(SnError::Rejected(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn send_subscribe(&mut self, topic: &Topic, qos: QoS, handler: Handler) -> Result<(), SnError> {
        let topic_type = topic.topic_type();
        // Publications may arrive before the SUBACK.
        match topic {
            Topic::Name(name) => {
                let topic_id = match topic_type {
                    TopicType::Short => short_topic_id(name).unwrap_or_default(),
                    _ => 0,
                };
                self.topics.add(name, topic_id, topic_type, Some(handler));
            }
            Topic::Predefined(id) => {
                self.topics.add("", *id, topic_type, Some(handler));
            }
        }

        let msg_id = self.next_msg_id();
        self.pending_subscribe = Some(PendingSubscribe {
            kind: SubscribeKind::Subscribe,
            msg_id,
            topic: topic.clone(),
            outcome: None,
        });
        let request = Message::Subscribe {
            flags: Flags::new().with_qos(qos).with_topic_type(topic_type),
            msg_id,
            topic: topic_field(topic),
        };
        let result = self.finish_subscribe(&request);
        if let Err(SnError::Rejected(_)) = result {
            self.forget_topic(topic);
            self.subscriptions
                .retain(|subscription| &subscription.topic != topic);
        }
        result
    }

    /// Unsubscribe from `topic` and drop it from the subscription list.
    pub fn unsubscribe(&mut self, topic: &Topic) -> Result<(), SnError> {
        if self.qos_m1 {
            return Err(SnError::InvalidState(self.state));
        }
        self.connect()?;
        self.subscriptions
            .retain(|subscription| &subscription.topic != topic);

        let msg_id = self.next_msg_id();
        self.pending_subscribe = Some(PendingSubscribe {
            kind: SubscribeKind::Unsubscribe,
            msg_id,
            topic: topic.clone(),
            outcome: None,
        });
        let request = Message::Unsubscribe {
            flags: Flags::new().with_topic_type(topic.topic_type()),
            msg_id,
            topic: topic_field(topic),
        };
        self.finish_subscribe(&request)
    }

    fn finish_subscribe(&mut self, request: &Message) -> Result<(), SnError> {
        let result = self.exchange(request, |client| {
            client
                .pending_subscribe
                .as_ref()
                .map_or(true, |pending| pending.outcome.is_some())
        });
        let outcome = self
            .pending_subscribe
            .take()
            .and_then(|pending| pending.outcome);
        result?;
        match outcome {
            Some(Ok(())) => {
                self.restart_keep_alive();
                Ok(())
            }
            Some(Err(return_code)) => Err(SnError::Rejected(return_code)),
            None => Err(SnError::RetryExhausted),
        }
    }

    fn forget_topic(&mut self, topic: &Topic) {
        match topic {
            Topic::Name(name) => self.topics.remove_by_name(name),
            Topic::Predefined(id) => self.topics.remove_by_id(*id, TopicType::Predefined),
        };
    }

    fn pending_subscribe_mut(
        &mut self,
        kind: SubscribeKind,
        msg_id: u16,
    ) -> Option<&mut PendingSubscribe> {
        self.pending_subscribe.as_mut().filter(|pending| {
            pending.kind == kind && pending.msg_id == msg_id && pending.outcome.is_none()
        })
    }

    pub(super) fn on_suback(
        &mut self,
        flags: Flags,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    ) {
        self.awaiting_publish = true;
        let pending = match self.pending_subscribe_mut(SubscribeKind::Subscribe, msg_id) {
            Some(pending) => pending,
            None => {
                debug!("Unexpected SUBACK for message {}.", msg_id);
                return;
            }
        };
        if return_code != ReturnCode::Accepted {
            warn!(
                "Subscription to {:?} rejected ({:?}), dropping it.",
                pending.topic, return_code
            );
            pending.outcome = Some(Err(return_code));
            return;
        }

        info!(
            "Subscribed to {:?} with {:?}, topic id {}.",
            pending.topic,
            flags.qos(),
            topic_id
        );
        pending.outcome = Some(Ok(()));
        let topic = pending.topic.clone();
        if let (Topic::Name(name), TopicType::Normal) = (&topic, topic.topic_type()) {
            if topic_id != 0 {
                self.topics.set_id(name, topic_id, TopicType::Normal);
            }
        }
    }

    pub(super) fn on_unsuback(&mut self, msg_id: u16) {
        let pending = match self.pending_subscribe_mut(SubscribeKind::Unsubscribe, msg_id) {
            Some(pending) => pending,
            None => {
                debug!("Unexpected UNSUBACK for message {}.", msg_id);
                return;
            }
        };
        pending.outcome = Some(Ok(()));
        let topic = pending.topic.clone();
        info!("Unsubscribed from {:?}.", topic);
        self.forget_topic(&topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::mqttsn::message::MsgType;
    use crate::mqttsn::testing::{connected_client, well_behaved_gateway, ScriptedLink};
    use crate::mqttsn::topic::Publication;
    use crate::mqttsn::ClientState;
    use crate::time::testing::ManualClock;
    use std::rc::Rc;

    fn noop() -> Handler {
        Rc::new(|_: &Publication<'_>| {})
    }

    #[test]
    fn subscribe_by_name_records_topic_id() {
        let (mut client, _clock) = connected_client(ClientConfig::default());
        client.link_mut().clear_sent();

        client
            .subscribe(Topic::from("sensors/temp"), QoS::AtLeastOnce, noop())
            .unwrap();
        let sent = client.link().sent();
        match &sent[0].1 {
            Message::Subscribe {
                flags,
                topic,
                ..
            } => {
                assert_eq!(flags.qos(), QoS::AtLeastOnce);
                assert!(!flags.dup());
                assert_eq!(topic, &TopicField::Name("sensors/temp".to_owned()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_ne!(client.topics().id_of("sensors/temp"), 0);
        assert_eq!(client.subscriptions().count(), 1);
    }

    #[test]
    fn subscribe_retransmissions_carry_dup() {
        let (mut client, _clock) = connected_client(ClientConfig::default());
        client.link_mut().set_gateway(|_| Vec::new());
        client.link_mut().clear_sent();

        assert_eq!(
            client.subscribe(Topic::Predefined(5), QoS::AtMostOnce, noop()),
            Err(SnError::RetryExhausted)
        );
        let flags: Vec<(bool, u16)> = client
            .link()
            .sent()
            .into_iter()
            .filter_map(|(_, message)| match message {
                Message::Subscribe { flags, msg_id, .. } => Some((flags.dup(), msg_id)),
                _ => None,
            })
            .collect();
        assert_eq!(flags.len(), 3);
        assert!(!flags[0].0);
        assert!(flags[1..].iter().all(|(dup, _)| *dup));
        assert!(flags.iter().all(|(_, id)| *id == flags[0].1));
    }

    #[test]
    fn rejected_subscription_drops_table_entry() {
        let (mut client, _clock) = connected_client(ClientConfig::default());
        client.link_mut().set_gateway(|message| match message {
            Message::Subscribe { flags, msg_id, .. } => vec![Message::SubAck {
                flags: *flags,
                topic_id: 0,
                msg_id: *msg_id,
                return_code: ReturnCode::NotSupported,
            }],
            _ => Vec::new(),
        });

        assert_eq!(
            client.subscribe(Topic::from("a/b"), QoS::AtMostOnce, noop()),
            Err(SnError::Rejected(ReturnCode::NotSupported))
        );
        assert!(client.topics().get_by_name("a/b").is_none());
        assert_eq!(client.subscriptions().count(), 0);
    }

    #[test]
    fn rejected_entry_leaves_the_subscription_list() {
        let link = ScriptedLink::new(ManualClock::default()).with_gateway(well_behaved_gateway());
        let clock = link.clock();
        let mut client = SnClient::new(link, clock, &ClientConfig::default()).unwrap();
        client
            .add_subscription(Topic::from("cmd/denied"), QoS::AtMostOnce, noop())
            .unwrap();
        client
            .add_subscription(Topic::from("cmd/ok"), QoS::AtMostOnce, noop())
            .unwrap();
        let mut gateway = well_behaved_gateway();
        client.link_mut().set_gateway(move |message| match message {
            Message::Subscribe {
                flags,
                msg_id,
                topic: TopicField::Name(name),
            } if name == "cmd/denied" => vec![Message::SubAck {
                flags: *flags,
                topic_id: 0,
                msg_id: *msg_id,
                return_code: ReturnCode::NotSupported,
            }],
            other => gateway(other),
        });

        client.connect().unwrap();
        assert_eq!(client.state(), ClientState::Active);
        let topics: Vec<&Topic> = client
            .subscriptions()
            .map(|subscription| &subscription.topic)
            .collect();
        assert_eq!(topics, vec![&Topic::from("cmd/ok")]);
        assert!(client.topics().get_by_name("cmd/ok").is_some());

        // Only the accepted entry is subscribed again.
        client.disconnect(None).unwrap();
        client.link_mut().clear_sent();
        client.connect().unwrap();
        assert_eq!(
            client.link().sent_types(),
            vec![MsgType::Connect, MsgType::Subscribe]
        );
    }

    #[test]
    fn unanswered_resubscribe_keeps_the_connection() {
        let link = ScriptedLink::new(ManualClock::default()).with_gateway(well_behaved_gateway());
        let clock = link.clock();
        let mut client = SnClient::new(link, clock, &ClientConfig::default()).unwrap();
        client
            .add_subscription(Topic::from("cmd/x"), QoS::AtMostOnce, noop())
            .unwrap();
        let mut gateway = well_behaved_gateway();
        client.link_mut().set_gateway(move |message| match message {
            Message::Subscribe { .. } => Vec::new(),
            other => gateway(other),
        });

        assert_eq!(client.connect(), Ok(()));
        assert_eq!(client.state(), ClientState::Active);
        assert!(client.gateway().is_some());
        let subscribes = client
            .link()
            .sent_types()
            .into_iter()
            .filter(|msg_type| *msg_type == MsgType::Subscribe)
            .count();
        assert_eq!(subscribes, 3);
        assert_eq!(client.subscriptions().count(), 1);
    }

    #[test]
    fn unsubscribe_removes_topic() {
        let (mut client, _clock) = connected_client(ClientConfig::default());
        client
            .subscribe(Topic::from("a/#"), QoS::AtMostOnce, noop())
            .unwrap();
        client
            .subscribe(Topic::from("ty"), QoS::AtMostOnce, noop())
            .unwrap();
        assert_eq!(client.topics().get_by_name("ty").map(|e| e.id), Some(0x7479));
        client.link_mut().clear_sent();

        client.unsubscribe(&Topic::from("a/#")).unwrap();
        assert_eq!(client.link().sent_types(), vec![MsgType::Unsubscribe]);
        assert!(client.topics().get_by_name("a/#").is_none());
        assert!(client.topics().get_by_name("ty").is_some());
        assert_eq!(client.subscriptions().count(), 1);
    }

    #[test]
    fn subscription_list_is_subscribed_on_connect() {
        let link = ScriptedLink::new(ManualClock::default()).with_gateway(well_behaved_gateway());
        let clock = link.clock();
        let mut client = SnClient::new(link, clock, &ClientConfig::default()).unwrap();
        client
            .add_subscription(Topic::from("cmd/+"), QoS::AtLeastOnce, noop())
            .unwrap();
        client
            .add_subscription(Topic::Predefined(3), QoS::AtMostOnce, noop())
            .unwrap();

        client.connect().unwrap();
        assert_eq!(
            client.link().sent_types(),
            vec![
                MsgType::SearchGw,
                MsgType::Connect,
                MsgType::Subscribe,
                MsgType::Subscribe
            ]
        );

        // A clean session reconnect subscribes again.
        client.disconnect(None).unwrap();
        client.link_mut().clear_sent();
        client.connect().unwrap();
        assert_eq!(
            client.link().sent_types(),
            vec![MsgType::Connect, MsgType::Subscribe, MsgType::Subscribe]
        );
        assert!(client.topics().get_by_name("cmd/+").is_some());
    }

    #[test]
    fn persistent_session_subscribes_once() {
        let link = ScriptedLink::new(ManualClock::default()).with_gateway(well_behaved_gateway());
        let clock = link.clock();
        let config = ClientConfig {
            clean_session: false,
            ..ClientConfig::default()
        };
        let mut client = SnClient::new(link, clock, &config).unwrap();
        client
            .add_subscription(Topic::from("cmd/+"), QoS::AtLeastOnce, noop())
            .unwrap();

        client.connect().unwrap();
        client.disconnect(None).unwrap();
        client.link_mut().clear_sent();
        client.connect().unwrap();
        assert_eq!(client.link().sent_types(), vec![MsgType::Connect]);
    }

    #[test]
    fn reconnect_after_failed_wake_resubscribes() {
        let link = ScriptedLink::new(ManualClock::default()).with_gateway(well_behaved_gateway());
        let clock = link.clock();
        let mut client = SnClient::new(link, clock, &ClientConfig::default()).unwrap();
        client
            .add_subscription(Topic::from("cmd/x"), QoS::AtMostOnce, noop())
            .unwrap();
        client.connect().unwrap();
        client.disconnect(Some(60)).unwrap();
        assert_eq!(client.state(), ClientState::Asleep);

        client.link_mut().set_gateway(|_| Vec::new());
        assert!(client.wake().is_err());
        assert_eq!(client.state(), ClientState::GwLost);

        client.link_mut().set_gateway(well_behaved_gateway());
        client.link_mut().clear_sent();
        client.connect().unwrap();
        assert_eq!(
            client.link().sent_types(),
            vec![MsgType::SearchGw, MsgType::Connect, MsgType::Subscribe]
        );
        assert!(client.topics().get_by_name("cmd/x").is_some());
    }

    #[test]
    fn pending_publications_are_collected_before_disconnect() {
        let (mut client, _clock) = connected_client(ClientConfig::default());
        client
            .subscribe(Topic::Predefined(3), QoS::AtMostOnce, noop())
            .unwrap();
        client.link_mut().clear_sent();
        client.link_mut().push(Message::Publish {
            flags: Flags::new()
                .with_qos(QoS::AtLeastOnce)
                .with_topic_type(TopicType::Predefined),
            topic_id: 3,
            msg_id: 8,
            payload: b"retained".to_vec(),
        });

        client.disconnect(None).unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(
            client.link().sent_types(),
            vec![MsgType::PubAck, MsgType::Disconnect]
        );
    }

    #[test]
    fn qos_m1_client_cannot_subscribe() {
        let link = ScriptedLink::new(ManualClock::default());
        let clock = link.clock();
        let mut client = SnClient::new_qos_m1(link, clock, "Sensor", 0x01).unwrap();
        assert!(matches!(
            client.subscribe(Topic::Predefined(1), QoS::AtMostOnce, noop()),
            Err(SnError::InvalidState(ClientState::Active))
        ));
        assert!(matches!(
            client.subscribe(Topic::Predefined(1), QoS::FireAndForget, noop()),
            Err(SnError::ParameterInvalid { .. })
        ));
    }
}
