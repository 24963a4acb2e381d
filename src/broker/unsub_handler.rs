// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! UNSUBSCRIBE handling, symmetric to subscription.

use codec::{UnsubscribeAckPacket, UnsubscribePacket};

use super::Broker;
use crate::types::PipeId;

/// Drop each listed filter from the tree and the pipe index. Filters the
/// pipe never subscribed to are ignored, as are unknown pipes.
#[must_use]
pub fn unsub_ctx_handle(
    broker: &Broker,
    pipe: PipeId,
    packet: &UnsubscribePacket,
) -> UnsubscribeAckPacket {
    let mut count = 0;
    {
        let mut db = broker.db.write().unwrap();
        let mut pipes = broker.pipes.lock().unwrap();
        for filter in packet.topics() {
            if db.delete(filter, pipe).is_some() {
                count += 1;
            }
            pipes.del_topic(pipe, filter);
        }
    }
    log::debug!("unsubscribe: pipe {pipe} dropped {count} filters");
    UnsubscribeAckPacket::new(packet.packet_id(), count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::dbtree::Dbtree;
    use crate::broker::sub_handler::sub_ctx_handle;
    use crate::config::Config;
    use codec::{QoS, SubTopic, SubscribePacket, SubscribeTopic};

    #[test]
    fn test_subscribe_unsubscribe_is_identity() {
        let broker = Broker::new(Config::default());
        let subscribe = SubscribePacket::new(
            3,
            vec![SubscribeTopic::new("sport/+/player", QoS::AtLeastOnce).unwrap()],
        );
        let _ = sub_ctx_handle(&broker, 8, &subscribe);

        let unsubscribe =
            UnsubscribePacket::new(4, vec![SubTopic::new("sport/+/player").unwrap()]);
        let ack = unsub_ctx_handle(&broker, 8, &unsubscribe);
        assert_eq!(ack.packet_id(), 4);

        // Tree and pipe index are bit-identical to their pre-state.
        assert_eq!(*broker.db.read().unwrap(), Dbtree::new());
        assert!(broker.pipes.lock().unwrap().get_topics(8).is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_filter() {
        let broker = Broker::new(Config::default());
        let unsubscribe = UnsubscribePacket::new(5, vec![SubTopic::new("ghost").unwrap()]);
        let ack = unsub_ctx_handle(&broker, 1, &unsubscribe);
        assert_eq!(ack.packet_id(), 5);
    }
}
