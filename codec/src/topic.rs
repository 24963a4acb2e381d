// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Topic names, topic filters and filter matching.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::base::{DecodePacket, EncodePacket};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,

    /// Wildcard character at an invalid position, or in a topic name.
    InvalidChar,
}

/// Validate a topic filter.
///
/// Rules are defined in `MQTT chapter-4.7 Topic Names and Topic Filters`:
/// `#` must be the last level and occupy a whole level; `+` must occupy a
/// whole level.
///
/// # Errors
///
/// Returns error if `filter` is empty or wildcards are misplaced.
pub fn validate_sub_topic(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if filter.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "#" => {
                if index != levels.len() - 1 {
                    return Err(TopicError::InvalidChar);
                }
            }
            "+" => {}
            _ => {
                if level.contains(|c| c == '#' || c == '+') {
                    return Err(TopicError::InvalidChar);
                }
            }
        }
    }
    Ok(())
}

/// Validate a topic name: no wildcard characters allowed.
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or contains `#`/`+`.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }
    if topic.contains(|c| c == '#' || c == '+') {
        return Err(TopicError::InvalidChar);
    }
    Ok(())
}

/// Match a topic name against a topic filter.
///
/// Filters starting with a wildcard do not match topics whose first level
/// starts with `$`, so `#` never delivers `$SYS` traffic
/// [MQTT-4.7.2-1].
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('#') || filter.starts_with('+')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `sport/#` also matches `sport` itself [MQTT-4.7.1-2].
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

/// A validated topic name, as carried by PUBLISH packets.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// # Errors
    ///
    /// Returns error if `topic` contains wildcard characters.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Bytes this topic occupies on the wire, length prefix included.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = ba.read_string()?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(2 + self.0.len())
    }
}

/// A validated topic filter, as carried by (UN)SUBSCRIBE packets.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// # Errors
    ///
    /// Returns error if wildcards in `filter` are misplaced.
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        validate_sub_topic(filter)?;
        Ok(Self(filter.to_string()))
    }

    #[must_use]
    pub const fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = ba.read_string()?;
        validate_sub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(2 + self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("sport/tennis/player/#").is_ok());
        assert!(validate_sub_topic("#").is_ok());
        assert!(validate_sub_topic("+").is_ok());
        assert!(validate_sub_topic("+/tennis/#").is_ok());
        assert!(validate_sub_topic("sport/tennis/player#").is_err());
        assert!(validate_sub_topic("sport/#/player").is_err());
        assert!(validate_sub_topic("sport+").is_err());
        assert!(validate_sub_topic("").is_err());
    }

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sport/tennis/player").is_ok());
        assert!(validate_pub_topic("sport/tennis/+").is_err());
        assert!(validate_pub_topic("sport/#").is_err());
        assert!(validate_pub_topic("").is_err());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("sport/tennis/player", "sport/tennis/player"));
        assert!(topic_matches("sport/+/player", "sport/tennis/player"));
        assert!(topic_matches("sport/#", "sport/tennis/player"));
        assert!(topic_matches("sport/#", "sport"));
        assert!(topic_matches("#", "sport"));
        assert!(!topic_matches("sport/+", "sport/tennis/player"));
        assert!(!topic_matches("sport/tennis", "sport/squash"));
        assert!(!topic_matches("+/+", "sport"));
    }

    #[test]
    fn test_dollar_topics_need_explicit_filter() {
        assert!(!topic_matches("#", "$SYS/brokers/connected"));
        assert!(!topic_matches("+/brokers/connected", "$SYS/brokers/connected"));
        assert!(topic_matches("$SYS/#", "$SYS/brokers/connected"));
    }
}
