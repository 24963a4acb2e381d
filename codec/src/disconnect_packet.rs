// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Final packet from a client before it closes the connection cleanly.
///
/// Receiving this packet discards any will message associated with the
/// connection [MQTT-3.1.2-8]. A v5 peer may append a reason code and
/// properties; both are ignored.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisconnectPacket;

impl DisconnectPacket {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DecodePacket for DisconnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Disconnect {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() > 0 {
            ba.read_bytes(fixed_header.remaining_length())?;
        }
        Ok(Self)
    }
}

impl EncodePacket for DisconnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::Disconnect, 0)?;
        fixed_header.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_bytes() {
        let mut buf = Vec::new();
        DisconnectPacket::new().encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0xe0, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert!(DisconnectPacket::decode(&mut ba).is_ok());
    }
}
