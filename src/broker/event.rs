// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Will promotion and `$SYS` connect/disconnect event composition.

use bytes::Bytes;
use codec::PublishPacket;

use crate::conn_param::ConnParam;

const CONNECTED_TOPIC: &str = "$SYS/brokers/connected";
const DISCONNECTED_TOPIC: &str = "$SYS/brokers/disconnected";

/// Promote the will fields of a connection into a PUBLISH, delivered through
/// the ordinary publish path when the connection drops abnormally.
#[must_use]
pub fn compose_will(cparam: &ConnParam) -> Option<PublishPacket> {
    if !cparam.will() {
        return None;
    }
    match PublishPacket::new(
        cparam.will_topic(),
        cparam.will_qos(),
        cparam.will_message().clone(),
    ) {
        Ok(mut packet) => {
            packet.set_retain(cparam.will_retain());
            Some(packet)
        }
        Err(err) => {
            log::error!(
                "will: invalid topic {} for client {}: {err:?}",
                cparam.will_topic(),
                cparam.client_id()
            );
            None
        }
    }
}

/// Join notification, published after the CONNACK is forwarded. The payload
/// carries the client id and the CONNECT flags byte.
#[must_use]
pub fn notify_connect(cparam: &ConnParam) -> PublishPacket {
    let payload = format!(
        "{{\"client_id\":\"{}\",\"flags\":{}}}",
        cparam.client_id(),
        cparam.flags_byte()
    );
    // The topic is a compile-time literal, encode cannot fail.
    PublishPacket::new(
        CONNECTED_TOPIC,
        codec::QoS::AtMostOnce,
        Bytes::from(payload.into_bytes()),
    )
    .unwrap()
}

/// Symmetric leave notification for DISCONNECT_EV.
#[must_use]
pub fn notify_disconnect(cparam: &ConnParam) -> PublishPacket {
    let payload = format!("{{\"client_id\":\"{}\"}}", cparam.client_id());
    PublishPacket::new(
        DISCONNECTED_TOPIC,
        codec::QoS::AtMostOnce,
        Bytes::from(payload.into_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{ConnectPacket, QoS};

    #[test]
    fn test_compose_will() {
        let mut packet = ConnectPacket::new("alice");
        packet
            .set_will("lastwill/alice", Bytes::from_static(b"bye"), QoS::AtLeastOnce, false)
            .unwrap();
        let cparam = ConnParam::new(&packet);

        let will = compose_will(&cparam).unwrap();
        assert_eq!(will.topic(), "lastwill/alice");
        assert_eq!(will.qos(), QoS::AtLeastOnce);
        assert_eq!(will.message().as_ref(), b"bye");
        assert!(!will.retain());
    }

    #[test]
    fn test_compose_will_without_flag() {
        let cparam = ConnParam::new(&ConnectPacket::new("bob"));
        assert!(compose_will(&cparam).is_none());
    }

    #[test]
    fn test_notify_topics() {
        let cparam = ConnParam::new(&ConnectPacket::new("carol"));
        let joined = notify_connect(&cparam);
        assert_eq!(joined.topic(), "$SYS/brokers/connected");
        assert!(String::from_utf8_lossy(joined.message()).contains("carol"));

        let left = notify_disconnect(&cparam);
        assert_eq!(left.topic(), "$SYS/brokers/disconnected");
    }
}
