// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::{encode_empty_properties, skip_properties};

/// Per-filter return code in a SUBACK payload: the granted QoS, or 0x80 for
/// a filter the server refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeAck {
    QoS(QoS),
    Failed,
}

impl SubscribeAck {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::QoS(qos) => qos as u8,
            Self::Failed => 0x80,
        }
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        if v == 0x80 {
            Ok(Self::Failed)
        } else {
            Ok(Self::QoS(QoS::try_from(v)?))
        }
    }
}

/// Reply to a SUBSCRIBE packet, one return code per requested filter, in
/// request order.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,
    acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn with_vec(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        Self { packet_id, acks }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acks(&self) -> &[SubscribeAck] {
        &self.acks
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
        let mut remaining_length = 2 + self.acks.len();
        if level == ProtocolLevel::V5 {
            remaining_length += 1;
        }
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        if level == ProtocolLevel::V5 {
            encode_empty_properties(buf);
        }
        for ack in &self.acks {
            buf.push(ack.to_byte());
        }
        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Self::decode_with(ba, ProtocolLevel::V311)
    }
}

impl SubscribeAckPacket {
    /// # Errors
    ///
    /// Returns error if the buffer is malformed.
    pub fn decode_with(ba: &mut ByteArray, level: ProtocolLevel) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }
        let body_start = ba.offset();
        let packet_id = ba.read_u16()?;
        if level == ProtocolLevel::V5 {
            skip_properties(ba)?;
        }
        let mut acks = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            acks.push(SubscribeAck::try_from(ba.read_byte()?)?);
        }
        Ok(Self { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.encode_with(ProtocolLevel::V311, buf)
    }
}
