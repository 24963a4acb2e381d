// Copyright (c) 2022 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use codec::QoS;

mod common;
use common::{start_broker, test_config, Client, READ_TIMEOUT};

#[test]
fn test_wildcard_fan_out() {
    let address = start_broker(test_config(19841));

    let mut sub_plus = Client::connect(&address, "sub-plus");
    sub_plus.subscribe(&[("sport/+/player", QoS::AtLeastOnce)]);
    let mut sub_hash = Client::connect(&address, "sub-hash");
    sub_hash.subscribe(&[("sport/#", QoS::AtLeastOnce)]);
    let mut sub_literal = Client::connect(&address, "sub-literal");
    sub_literal.subscribe(&[("sport/tennis/player", QoS::AtLeastOnce)]);

    let mut publisher = Client::connect(&address, "publisher");
    publisher.publish("sport/tennis/player", QoS::AtLeastOnce, false, b"p1");

    for subscriber in [&mut sub_plus, &mut sub_hash, &mut sub_literal] {
        let publish = subscriber
            .recv_publish(READ_TIMEOUT)
            .expect("every matching subscriber gets the message");
        assert_eq!(publish.topic(), "sport/tennis/player");
        assert_eq!(publish.message().as_ref(), b"p1");
        assert_eq!(publish.qos(), QoS::AtLeastOnce);
        assert!(!publish.retain());
        // Exactly once per subscriber.
        subscriber.expect_silence();
    }
}

#[test]
fn test_retained_replay_on_late_subscribe() {
    let address = start_broker(test_config(19842));

    let mut publisher = Client::connect(&address, "publisher");
    publisher.publish("state/door", QoS::AtMostOnce, true, b"open");

    let mut early = Client::connect(&address, "early");
    early.subscribe(&[("state/door", QoS::AtMostOnce)]);
    let replay = early
        .recv_publish(READ_TIMEOUT)
        .expect("retained message replayed to new subscriber");
    assert_eq!(replay.topic(), "state/door");
    assert_eq!(replay.message().as_ref(), b"open");
    assert!(replay.retain());

    // An empty retained payload clears the entry.
    publisher.publish("state/door", QoS::AtMostOnce, true, b"");
    let mut late = Client::connect(&address, "late");
    late.subscribe(&[("state/door", QoS::AtMostOnce)]);
    late.expect_silence();
}

#[test]
fn test_qos_downgrade() {
    let address = start_broker(test_config(19843));

    let mut sub_q0 = Client::connect(&address, "sub-q0");
    sub_q0.subscribe(&[("meter/power", QoS::AtMostOnce)]);
    let mut sub_q2 = Client::connect(&address, "sub-q2");
    sub_q2.subscribe(&[("meter/power", QoS::ExactOnce)]);

    let mut publisher = Client::connect(&address, "publisher");
    publisher.publish("meter/power", QoS::AtLeastOnce, false, b"42");

    let publish = sub_q0.recv_publish(READ_TIMEOUT).expect("qos0 delivery");
    assert_eq!(publish.qos(), QoS::AtMostOnce);

    let publish = sub_q2.recv_publish(READ_TIMEOUT).expect("qos1 delivery");
    // min(publish qos 1, requested qos 2) = 1.
    assert_eq!(publish.qos(), QoS::AtLeastOnce);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let address = start_broker(test_config(19844));

    let mut subscriber = Client::connect(&address, "subscriber");
    subscriber.subscribe(&[("news/flash", QoS::AtMostOnce)]);

    let mut publisher = Client::connect(&address, "publisher");
    publisher.publish("news/flash", QoS::AtMostOnce, false, b"one");
    assert!(subscriber.recv_publish(READ_TIMEOUT).is_some());

    subscriber.unsubscribe(&["news/flash"]);
    publisher.publish("news/flash", QoS::AtMostOnce, false, b"two");
    subscriber.expect_silence();
}

#[test]
fn test_publish_to_dollar_topic_not_seen_by_wildcards() {
    let address = start_broker(test_config(19845));

    let mut subscriber = Client::connect(&address, "subscriber");
    subscriber.subscribe(&[("#", QoS::AtMostOnce)]);

    // Other clients joining publish $SYS connect events; a `#` subscriber
    // must not see them.
    let other = Client::connect(&address, "other");
    subscriber.expect_silence();
    other.disconnect();
}
