// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket, ProtocolLevel};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::{encode_empty_properties, skip_properties};

/// Values returned in the CONNACK variable header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The server does not support the level of the MQTT protocol requested
    /// by the client.
    UnacceptableProtocolVersion = 1,

    /// The client identifier is correct UTF-8 but not allowed by the server.
    IdentifierRejected = 2,

    /// The network connection has been made but the MQTT service is
    /// unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed.
    BadUserNameOrPassword = 4,

    /// The client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// The corresponding v5 connect reason code.
    #[must_use]
    pub const fn v5_reason_code(self) -> u8 {
        match self {
            Self::Accepted => 0x00,
            Self::UnacceptableProtocolVersion => 0x84,
            Self::IdentifierRejected => 0x85,
            Self::ServerUnavailable => 0x88,
            Self::BadUserNameOrPassword => 0x86,
            Self::NotAuthorized => 0x87,
        }
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUserNameOrPassword),
            5 => Ok(Self::NotAuthorized),
            _ => Err(DecodeError::InvalidPacketFlags),
        }
    }
}

/// Reply to a CONNECT packet. Carries the session-present flag and the
/// connect return code.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectAckPacket {
    session_present: bool,
    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    #[must_use]
    pub const fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }

    /// The acknowledge flags byte, as sent on the wire.
    #[must_use]
    pub const fn flags_byte(&self) -> u8 {
        self.session_present as u8
    }

    /// Encode for a client speaking `level`; v5 gets a reason code and an
    /// empty property block.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer write fails.
    pub fn encode_with(
        &self,
        level: ProtocolLevel,
        buf: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let remaining_length = if level == ProtocolLevel::V5 { 3 } else { 2 };
        let fixed_header = FixedHeader::new(PacketType::ConnectAck, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.push(self.flags_byte());
        if level == ProtocolLevel::V5 {
            buf.push(self.return_code.v5_reason_code());
            encode_empty_properties(buf);
        } else {
            buf.push(self.return_code as u8);
        }
        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        let ack_flags = ba.read_byte()?;
        let return_code = ConnectReturnCode::try_from(ba.read_byte()?)?;
        if fixed_header.remaining_length() > 2 {
            // v5 property block.
            skip_properties(ba)?;
        }
        Ok(Self {
            session_present: (ack_flags & 0b0000_0001) == 0b0000_0001,
            return_code,
        })
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.encode_with(ProtocolLevel::V311, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_ack_round_trip() {
        let packet = ConnectAckPacket::new(true, ConnectReturnCode::Accepted);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x01, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectAckPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_connect_ack_rejected() {
        let packet = ConnectAckPacket::new(false, ConnectReturnCode::NotAuthorized);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x00, 0x05]);
    }
}
