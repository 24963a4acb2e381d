// Copyright (c) 2022 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Minimal handling of the MQTT v5 property block.
//!
//! The broker forwards v5 traffic without inspecting individual properties;
//! the block is skipped on decode (its size still bounded by the configured
//! `property_size`) and written back empty on encode.

use crate::base::{DecodePacket, EncodePacket};
use crate::byte_array::ByteArray;
use crate::error::DecodeError;
use crate::header::RemainingLength;

/// Skip the property block at the cursor and return its total size in bytes,
/// length prefix included.
///
/// # Errors
///
/// Returns error if the length prefix is malformed or overruns the buffer.
pub fn skip_properties(ba: &mut ByteArray) -> Result<usize, DecodeError> {
    let start = ba.offset();
    let len = RemainingLength::decode(ba)?;
    ba.read_bytes(len.value() as usize)?;
    Ok(ba.offset() - start)
}

/// Write an empty property block, one zero byte.
pub fn encode_empty_properties(buf: &mut Vec<u8>) {
    let _ = RemainingLength(0).encode(buf);
}
