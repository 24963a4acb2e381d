// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use std::convert::TryFrom;
use std::io::Write;

use crate::base::{DecodePacket, EncodePacket, ProtocolLevel, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::property::{encode_empty_properties, skip_properties};
use crate::topic::PubTopic;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_NAME_V31: &str = "MQIsdp";

/// Connect flags byte:
///
/// ```txt
///        7               6              5          4-3          2            1             0
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// | Username Flag | Password Flag | Will Retain | Will QoS | Will Flag | Clean Session | Reserved |
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl ConnectFlags {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        let mut byte = (self.will_qos as u8) << 3;
        if self.username {
            byte |= 0b1000_0000;
        }
        if self.password {
            byte |= 0b0100_0000;
        }
        if self.will_retain {
            byte |= 0b0010_0000;
        }
        if self.will {
            byte |= 0b0000_0100;
        }
        if self.clean_session {
            byte |= 0b0000_0010;
        }
        byte
    }

    /// # Errors
    ///
    /// Returns error if the will-qos bits are invalid.
    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(Self {
            username: (byte & 0b1000_0000) != 0,
            password: (byte & 0b0100_0000) != 0,
            will_retain: (byte & 0b0010_0000) != 0,
            will_qos: QoS::try_from((byte & 0b0001_1000) >> 3)?,
            will: (byte & 0b0000_0100) != 0,
            clean_session: (byte & 0b0000_0010) != 0,
        })
    }
}

/// The first packet a client sends after opening a connection.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_level: ProtocolLevel,
    connect_flags: ConnectFlags,
    keep_alive: u16,
    client_id: String,
    will_topic: Option<PubTopic>,
    will_message: Bytes,
    username: String,
    password: Bytes,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            keep_alive: 60,
            connect_flags: ConnectFlags {
                clean_session: true,
                ..ConnectFlags::default()
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    pub fn set_protocol_level(&mut self, level: ProtocolLevel) -> &mut Self {
        self.protocol_level = level;
        self
    }

    #[must_use]
    pub const fn connect_flags(&self) -> ConnectFlags {
        self.connect_flags
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.connect_flags.clean_session = clean_session;
        self
    }

    /// Arm the will message sent on behalf of this client when its
    /// connection drops abnormally.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` contains wildcard characters.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = message;
        self.connect_flags.will = true;
        self.connect_flags.will_qos = qos;
        self.connect_flags.will_retain = retain;
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    #[must_use]
    pub const fn will_message(&self) -> &Bytes {
        &self.will_message
    }

    pub fn set_credentials(&mut self, username: &str, password: &[u8]) -> &mut Self {
        self.username = username.to_string();
        self.password = Bytes::copy_from_slice(password);
        self.connect_flags.username = !username.is_empty();
        self.connect_flags.password = !password.is_empty();
        self
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub const fn password(&self) -> &Bytes {
        &self.password
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = ba.read_string()?;
        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        let expected_name = if protocol_level == ProtocolLevel::V31 {
            PROTOCOL_NAME_V31
        } else {
            PROTOCOL_NAME
        };
        if protocol_name != expected_name {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = ConnectFlags::from_byte(ba.read_byte()?)?;
        let keep_alive = ba.read_u16()?;

        if protocol_level == ProtocolLevel::V5 {
            skip_properties(ba)?;
        }

        let client_id = ba.read_string()?;

        let (will_topic, will_message) = if connect_flags.will {
            if protocol_level == ProtocolLevel::V5 {
                // Will properties precede the will topic.
                skip_properties(ba)?;
            }
            let topic = PubTopic::decode(ba)?;
            let msg_len = ba.read_u16()? as usize;
            let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);
            (Some(topic), msg)
        } else {
            (None, Bytes::new())
        };

        let username = if connect_flags.username {
            ba.read_string()?
        } else {
            String::new()
        };
        let password = if connect_flags.password {
            let len = ba.read_u16()? as usize;
            Bytes::copy_from_slice(ba.read_bytes(len)?)
        } else {
            Bytes::new()
        };

        Ok(Self {
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = 2
            + PROTOCOL_NAME.len()
            + 1 // protocol level
            + 1 // connect flags
            + 2 // keep alive
            + 2
            + self.client_id.len();
        if self.protocol_level == ProtocolLevel::V5 {
            remaining_length += 1;
        }
        if let Some(will_topic) = &self.will_topic {
            if self.protocol_level == ProtocolLevel::V5 {
                remaining_length += 1;
            }
            remaining_length += will_topic.bytes() + 2 + self.will_message.len();
        }
        if self.connect_flags.username {
            remaining_length += 2 + self.username.len();
        }
        if self.connect_flags.password {
            remaining_length += 2 + self.password.len();
        }

        let fixed_header = FixedHeader::new(PacketType::Connect, remaining_length)?;
        fixed_header.encode(buf)?;

        buf.write_u16::<BigEndian>(PROTOCOL_NAME.len() as u16)?;
        buf.write_all(PROTOCOL_NAME.as_bytes())?;
        buf.push(self.protocol_level as u8);
        buf.push(self.connect_flags.to_byte());
        buf.write_u16::<BigEndian>(self.keep_alive)?;
        if self.protocol_level == ProtocolLevel::V5 {
            encode_empty_properties(buf);
        }

        buf.write_u16::<BigEndian>(self.client_id.len() as u16)?;
        buf.write_all(self.client_id.as_bytes())?;
        if let Some(will_topic) = &self.will_topic {
            if self.protocol_level == ProtocolLevel::V5 {
                encode_empty_properties(buf);
            }
            will_topic.encode(buf)?;
            buf.write_u16::<BigEndian>(self.will_message.len() as u16)?;
            buf.write_all(&self.will_message)?;
        }
        if self.connect_flags.username {
            buf.write_u16::<BigEndian>(self.username.len() as u16)?;
            buf.write_all(self.username.as_bytes())?;
        }
        if self.connect_flags.password {
            buf.write_u16::<BigEndian>(self.password.len() as u16)?;
            buf.write_all(&self.password)?;
        }

        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_round_trip() {
        let mut packet = ConnectPacket::new("alice");
        packet
            .set_keep_alive(30)
            .set_clean_session(false)
            .set_credentials("user", b"pass");
        packet
            .set_will("lastwill/alice", Bytes::from_static(b"bye"), QoS::AtLeastOnce, false)
            .unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.will_topic(), Some("lastwill/alice"));
        assert!(decoded.connect_flags().will);
        assert!(!decoded.connect_flags().clean_session);
    }

    #[test]
    fn test_connect_flags_byte() {
        let flags = ConnectFlags {
            username: true,
            password: true,
            will_retain: false,
            will_qos: QoS::AtLeastOnce,
            will: true,
            clean_session: true,
        };
        assert_eq!(flags.to_byte(), 0b1100_1110);
        assert_eq!(ConnectFlags::from_byte(0b1100_1110).unwrap(), flags);
    }

    #[test]
    fn test_connect_bad_protocol_name() {
        let mut packet_bytes = Vec::new();
        ConnectPacket::new("x").encode(&mut packet_bytes).unwrap();
        // Corrupt the protocol name.
        packet_bytes[4] = b'X';
        let mut ba = ByteArray::new(&packet_bytes);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }
}
