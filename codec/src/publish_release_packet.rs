// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, PacketId};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Response to a PUBREC packet; second step of the `QoS` 2 handshake.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReleasePacket {
    packet_id: PacketId,
}

impl PublishReleasePacket {
    #[must_use]
    pub const fn new(packet_id: PacketId) -> Self {
        Self { packet_id }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }
}

impl DecodePacket for PublishReleasePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishRelease {
            return Err(DecodeError::InvalidPacketType);
        }
        let packet_id = ba.read_u16()?;
        if fixed_header.remaining_length() > 2 {
            ba.read_bytes(fixed_header.remaining_length() - 2)?;
        }
        Ok(Self { packet_id })
    }
}

impl EncodePacket for PublishReleasePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::PublishRelease, 2)?;
        let header_len = fixed_header.encode(buf)?;
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        Ok(header_len + 2)
    }
}
