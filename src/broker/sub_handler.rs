// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! SUBSCRIBE handling: topic tree and pipe index mutation, retained-message
//! replay collection, SUBACK composition.

use codec::{topic, PublishPacket, SubscribeAck, SubscribeAckPacket, SubscribePacket};

use super::Broker;
use crate::types::PipeId;

/// Apply a SUBSCRIBE from `pipe`: one tree/index insertion per filter, one
/// return code per filter in request order, and the retained messages each
/// filter matches, shaped for replay (retain=1, QoS downgraded to the
/// request).
///
/// A filter that fails validation gets return code 0x80; the remaining
/// filters still proceed.
#[must_use]
pub fn sub_ctx_handle(
    broker: &Broker,
    pipe: PipeId,
    packet: &SubscribePacket,
) -> (SubscribeAckPacket, Vec<PublishPacket>) {
    let mut acks = Vec::with_capacity(packet.topics().len());
    let mut replays = Vec::new();

    for sub_topic in packet.topics() {
        let filter = sub_topic.topic();
        if topic::validate_sub_topic(filter).is_err() {
            log::warn!("subscribe: invalid filter {filter} from pipe {pipe}");
            acks.push(SubscribeAck::Failed);
            continue;
        }

        {
            let mut db = broker.db.write().unwrap();
            let mut pipes = broker.pipes.lock().unwrap();
            db.insert(filter, pipe, sub_topic.qos());
            pipes.add_topic(pipe, filter, sub_topic.qos());
        }
        acks.push(SubscribeAck::QoS(sub_topic.qos()));

        // Replays are duplicated across filters on purpose: each matching
        // filter earns its own copy.
        for (ret_topic, retained) in broker.db_ret.read().unwrap().retained_for(filter) {
            match PublishPacket::new(
                &ret_topic,
                retained.qos.min(sub_topic.qos()),
                retained.payload,
            ) {
                Ok(mut replay) => {
                    replay.set_retain(true);
                    replays.push(replay);
                }
                Err(err) => {
                    log::error!("subscribe: bad retained topic {ret_topic}: {err:?}");
                }
            }
        }
    }

    (
        SubscribeAckPacket::with_vec(packet.packet_id(), acks),
        replays,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use bytes::Bytes;
    use codec::{QoS, SubscribeTopic};

    fn subscribe(filters: &[(&str, QoS)]) -> SubscribePacket {
        let topics = filters
            .iter()
            .map(|(filter, qos)| SubscribeTopic::new(filter, *qos).unwrap())
            .collect();
        SubscribePacket::new(9, topics)
    }

    #[test]
    fn test_subscribe_mutates_tree_and_index() {
        let broker = Broker::new(Config::default());
        let (ack, replays) =
            sub_ctx_handle(&broker, 4, &subscribe(&[("sport/#", QoS::AtLeastOnce)]));

        assert_eq!(ack.packet_id(), 9);
        assert_eq!(ack.acks(), &[SubscribeAck::QoS(QoS::AtLeastOnce)]);
        assert!(replays.is_empty());

        let subs = broker.db.read().unwrap().match_topic("sport/tennis");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].pipe, 4);
        assert_eq!(broker.pipes.lock().unwrap().get_topics(4).len(), 1);
    }

    #[test]
    fn test_subscribe_replays_retained() {
        let broker = Broker::new(Config::default());
        broker.db_ret.write().unwrap().retain(
            "state/door",
            Bytes::from_static(b"open"),
            QoS::AtLeastOnce,
        );

        let (_ack, replays) =
            sub_ctx_handle(&broker, 2, &subscribe(&[("state/+", QoS::AtMostOnce)]));
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0].topic(), "state/door");
        assert!(replays[0].retain());
        // Replay QoS is min(retained, requested).
        assert_eq!(replays[0].qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_subscribe_replay_per_matching_filter() {
        let broker = Broker::new(Config::default());
        broker.db_ret.write().unwrap().retain(
            "state/door",
            Bytes::from_static(b"open"),
            QoS::AtMostOnce,
        );

        let (_ack, replays) = sub_ctx_handle(
            &broker,
            2,
            &subscribe(&[("state/door", QoS::AtMostOnce), ("state/#", QoS::AtMostOnce)]),
        );
        // One copy per matching filter is expected.
        assert_eq!(replays.len(), 2);
    }

    #[test]
    fn test_subscribe_multiple_filters() {
        let broker = Broker::new(Config::default());
        let (ack, _replays) = sub_ctx_handle(
            &broker,
            1,
            &subscribe(&[("a/b", QoS::AtMostOnce), ("c/#", QoS::ExactOnce)]),
        );
        assert_eq!(
            ack.acks(),
            &[
                SubscribeAck::QoS(QoS::AtMostOnce),
                SubscribeAck::QoS(QoS::ExactOnce)
            ]
        );
        assert_eq!(broker.pipes.lock().unwrap().get_topics(1).len(), 2);
    }
}
