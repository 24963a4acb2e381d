// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! PUBLISH resolution: match the topic against the live tree, build the
//! fan-out descriptor, and update the retained store.

use codec::{PublishPacket, QoS};

use super::Broker;
use crate::types::PipeId;

/// One fan-out destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    pub pipe: PipeId,

    /// min(publish QoS, subscriber requested QoS).
    pub qos: QoS,
}

/// Ordered destination list computed from a single PUBLISH match, consumed
/// by the worker's WAIT/SEND transitions and reset once dispatched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipeFanout {
    pipe_info: Vec<PipeInfo>,
    current_index: usize,
}

impl PipeFanout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.pipe_info.len()
    }

    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    /// Destinations not dispatched yet.
    #[must_use]
    pub fn remaining(&self) -> &[PipeInfo] {
        &self.pipe_info[self.current_index..]
    }

    pub fn advance(&mut self) {
        self.current_index += 1;
        debug_assert!(self.current_index <= self.pipe_info.len());
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.current_index >= self.pipe_info.len()
    }

    /// Release per-publish state. Idempotent.
    pub fn reset(&mut self) {
        self.pipe_info.clear();
        self.current_index = 0;
    }
}

/// Resolve a decoded PUBLISH against the topic tree and record the retained
/// message when the retain flag is set.
///
/// Wildcarded topics never get here: the codec rejects them at decode and
/// the transport drops the packet silently.
#[must_use]
pub fn handle_pub(broker: &Broker, packet: &PublishPacket) -> PipeFanout {
    let matched = broker.db.read().unwrap().match_topic(packet.topic());
    let pipe_info = matched
        .iter()
        .map(|sub| PipeInfo {
            pipe: sub.pipe,
            qos: packet.qos().min(sub.qos),
        })
        .collect();

    if packet.retain() {
        broker.db_ret.write().unwrap().retain(
            packet.topic(),
            packet.message().clone(),
            packet.qos(),
        );
    }

    PipeFanout {
        pipe_info,
        current_index: 0,
    }
}
