// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::io::Write;

use crate::base::{DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::{encode_empty_properties, skip_properties};
use crate::topic::PubTopic;

/// `PublishPacket` transports an application message, client to server or
/// server to client.
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// +-----------------------+
/// | Topic name length     |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// `packet_id` is only present in `QoS` 1 and `QoS` 2 packets.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishPacket {
    dup: bool,
    qos: QoS,
    retain: bool,
    topic: PubTopic,
    packet_id: PacketId,
    msg: Bytes,
}

impl PublishPacket {
    /// # Errors
    ///
    /// Returns error if `topic` contains wildcard characters.
    pub fn new(topic: &str, qos: QoS, msg: Bytes) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: 0,
            msg,
        })
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    pub fn set_dup(&mut self, dup: bool) -> &mut Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = 0;
        }
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Only meaningful when `QoS` is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn message(&self) -> &Bytes {
        &self.msg
    }

    /// Decode for a client speaking `level`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is malformed.
    pub fn decode_with(ba: &mut ByteArray, level: ProtocolLevel) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let body_start = ba.offset();
        let topic = PubTopic::decode(ba)?;
        log::trace!("publish topic: {:?}", &topic);
        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            let packet_id = ba.read_u16()?;
            if packet_id == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };
        if level == ProtocolLevel::V5 {
            skip_properties(ba)?;
        }

        let header_len = ba.offset() - body_start;
        let msg_len = fixed_header
            .remaining_length()
            .checked_sub(header_len)
            .ok_or(DecodeError::InvalidRemainingLength)?;
        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }

    /// Encode for a client speaking `level`.
    ///
    /// # Errors
    ///
    /// Returns error if the packet is oversized.
    pub fn encode_with(
        &self,
        level: ProtocolLevel,
        buf: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        if level == ProtocolLevel::V5 {
            remaining_length += 1;
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        let fixed_header = FixedHeader::new(packet_type, remaining_length)?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            buf.extend_from_slice(&self.packet_id.to_be_bytes());
        }
        if level == ProtocolLevel::V5 {
            encode_empty_properties(buf);
        }
        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Self::decode_with(ba, ProtocolLevel::V311)
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.encode_with(ProtocolLevel::V311, buf)
    }
}
