// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::DecodeError;

/// Convert byte slice into a UTF-8 string.
///
/// Control characters are rejected as required by
/// `MQTT chapter-1.5.3 UTF-8 encoded strings`.
///
/// # Errors
///
/// Returns error if `bytes` is not a well-formed UTF-8 string.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, DecodeError> {
    let s = String::from_utf8(bytes.to_vec())?;
    if s.chars().any(|c| ('\u{0000}'..='\u{001f}').contains(&c)) {
        return Err(DecodeError::InvalidString);
    }
    Ok(s)
}

/// Generate a random client id with `prefix`.
///
/// Used when a client (notably the bridge) connects without a configured id.
#[must_use]
pub fn random_client_id(prefix: &str) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utf8_string() {
        assert_eq!(to_utf8_string(b"nanomq").unwrap(), "nanomq");
        assert!(to_utf8_string(&[0xff, 0xfe]).is_err());
        assert!(to_utf8_string(b"a\x01b").is_err());
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id("bridge-");
        assert!(id.starts_with("bridge-"));
        assert_eq!(id.len(), "bridge-".len() + 10);
    }
}
