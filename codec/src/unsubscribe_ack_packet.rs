// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, PacketId, ProtocolLevel};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::encode_empty_properties;

/// Reply to an UNSUBSCRIBE packet.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnsubscribeAckPacket {
    packet_id: PacketId,

    /// Number of filters acknowledged; v5 emits one success reason code per
    /// filter.
    topics: usize,
}

impl UnsubscribeAckPacket {
    #[must_use]
    pub const fn new(packet_id: PacketId, topics: usize) -> Self {
        Self { packet_id, topics }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
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
        let remaining_length = if level == ProtocolLevel::V5 {
            2 + 1 + self.topics
        } else {
            2
        };
        let fixed_header = FixedHeader::new(PacketType::UnsubscribeAck, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        if level == ProtocolLevel::V5 {
            encode_empty_properties(buf);
            for _ in 0..self.topics {
                buf.push(0x00);
            }
        }
        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for UnsubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::UnsubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }
        let packet_id = ba.read_u16()?;
        if fixed_header.remaining_length() > 2 {
            ba.read_bytes(fixed_header.remaining_length() - 2)?;
        }
        Ok(Self {
            packet_id,
            topics: 0,
        })
    }
}

impl EncodePacket for UnsubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.encode_with(ProtocolLevel::V311, buf)
    }
}
