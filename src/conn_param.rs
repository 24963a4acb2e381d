// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use bytes::Bytes;
use codec::{ConnectPacket, ProtocolLevel, QoS};

/// Immutable snapshot of the CONNECT fields of one client connection.
///
/// Shared between the transport, the workers and the session cache through
/// `Arc<ConnParam>`; every async path that outlives the inbound packet holds
/// its own clone, and the snapshot is freed when the last clone drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParam {
    client_id: String,
    clean_session: bool,
    keep_alive: u16,
    protocol_level: ProtocolLevel,

    will: bool,
    will_qos: QoS,
    will_retain: bool,
    will_topic: String,
    will_message: Bytes,

    username: String,
    password: Bytes,
}

impl ConnParam {
    #[must_use]
    pub fn new(packet: &ConnectPacket) -> Self {
        let flags = packet.connect_flags();
        Self {
            client_id: packet.client_id().to_string(),
            clean_session: flags.clean_session,
            keep_alive: packet.keep_alive(),
            protocol_level: packet.protocol_level(),
            will: flags.will,
            will_qos: flags.will_qos,
            will_retain: flags.will_retain,
            will_topic: packet.will_topic().unwrap_or_default().to_string(),
            will_message: packet.will_message().clone(),
            username: packet.username().to_string(),
            password: packet.password().clone(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn will(&self) -> bool {
        self.will
    }

    #[must_use]
    pub const fn will_qos(&self) -> QoS {
        self.will_qos
    }

    #[must_use]
    pub const fn will_retain(&self) -> bool {
        self.will_retain
    }

    #[must_use]
    pub fn will_topic(&self) -> &str {
        &self.will_topic
    }

    #[must_use]
    pub const fn will_message(&self) -> &Bytes {
        &self.will_message
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The CONNECT flags byte as it appeared on the wire, carried by the
    /// connect event notification.
    #[must_use]
    pub fn flags_byte(&self) -> u8 {
        codec::ConnectFlags {
            username: !self.username.is_empty(),
            password: !self.password.is_empty(),
            will_retain: self.will_retain,
            will_qos: self.will_qos,
            will: self.will,
            clean_session: self.clean_session,
        }
        .to_byte()
    }
}
