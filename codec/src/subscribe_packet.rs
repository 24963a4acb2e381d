// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::{encode_empty_properties, skip_properties};
use crate::topic::SubTopic;

/// Topic filter/QoS pair in the SUBSCRIBE payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeTopic {
    topic: SubTopic,
    qos: QoS,
}

impl SubscribeTopic {
    /// # Errors
    ///
    /// Returns error if wildcards in `topic` are misplaced.
    pub fn new(topic: &str, qos: QoS) -> Result<Self, EncodeError> {
        let topic = SubTopic::new(topic)?;
        Ok(Self { topic, qos })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }
}

/// A client subscription request.
///
/// The payload is a non-empty list of topic filters, each with the maximum
/// QoS the server may use when forwarding to this subscription.
///
/// A server receiving a SUBSCRIBE packet with multiple topic filters MUST
/// handle it as if it had received a sequence of multiple SUBSCRIBE packets,
/// combining the responses into a single SUBACK [MQTT-3.8.4-4].
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    topics: Vec<SubscribeTopic>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: PacketId, topics: Vec<SubscribeTopic>) -> Self {
        Self { packet_id, topics }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }

    /// Decode for a client speaking `level`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is malformed or no topic is present.
    pub fn decode_with(ba: &mut ByteArray, level: ProtocolLevel) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let body_start = ba.offset();
        let packet_id = ba.read_u16()?;
        if packet_id == 0 {
            return Err(DecodeError::InvalidPacketId);
        }
        if level == ProtocolLevel::V5 {
            skip_properties(ba)?;
        }

        let mut topics = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            let topic = SubTopic::decode(ba)?;
            // v5 puts subscription options in the low bits of this byte.
            let qos = QoS::try_from(ba.read_byte()? & 0b0000_0011)?;
            topics.push(SubscribeTopic { topic, qos });
        }

        // A SUBSCRIBE packet with no payload is a protocol violation
        // [MQTT-3.8.3-3].
        if topics.is_empty() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self { packet_id, topics })
    }

    /// Encode for a peer speaking `level`.
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
        let mut remaining_length = 2;
        if level == ProtocolLevel::V5 {
            remaining_length += 1;
        }
        for topic in &self.topics {
            remaining_length += topic.topic.bytes() + 1;
        }

        let fixed_header = FixedHeader::new(PacketType::Subscribe, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        if level == ProtocolLevel::V5 {
            encode_empty_properties(buf);
        }
        for topic in &self.topics {
            topic.topic.encode(buf)?;
            buf.push(topic.qos as u8);
        }
        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Self::decode_with(ba, ProtocolLevel::V311)
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.encode_with(ProtocolLevel::V311, buf)
    }
}
