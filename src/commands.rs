// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use codec::{
    ConnectAckPacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribePacket, UnsubscribePacket,
};
use std::sync::Arc;

use crate::conn_param::ConnParam;
use crate::types::PipeId;

/// Command type of a work message, the broker-side rendition of a framed
/// packet. Exhaustive by design: adding a packet type breaks every match
/// until it is handled.
#[derive(Debug, Clone)]
pub enum Packet {
    /// The transport accepted a CONNECT; the worker delivers the CONNACK
    /// and emits the connect event.
    Connack(ConnectAckPacket),

    Publish(PublishPacket),

    PubAck(PublishAckPacket),
    PubRec(PublishReceivedPacket),
    PubRel(PublishReleasePacket),
    PubComp(PublishCompletePacket),

    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),

    PingReq,

    /// The connection is gone. `send_will` is false when the client sent a
    /// clean DISCONNECT before closing.
    Disconnect { send_will: bool },

    /// Post-disconnect teardown event: leave notification, session caching
    /// and subscription cleanup.
    DisconnectEvent,
}

impl Packet {
    /// Short command name, used by log lines.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connack(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PubRec(_) => "PUBREC",
            Self::PubRel(_) => "PUBREL",
            Self::PubComp(_) => "PUBCOMP",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::PingReq => "PINGREQ",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::DisconnectEvent => "DISCONNECT_EV",
        }
    }
}

/// One unit of inbound work, delivered by the transport into the shared
/// worker channel.
#[derive(Debug, Clone)]
pub struct WorkMessage {
    /// Source pipe. Zero for messages injected by the bridge.
    pub pipe: PipeId,

    pub cparam: Arc<ConnParam>,

    pub packet: Packet,
}
