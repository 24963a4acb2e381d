// Copyright (c) 2022 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Outstanding QoS>=1 outbound publishes, rescanned by the resend timer.
//!
//! This path is orthogonal to the worker state machine; retransmissions go
//! through the per-pipe writer channel, so per-pipe ordering is preserved.

use codec::{ProtocolLevel, PublishPacket};
use std::collections::{HashMap, VecDeque};

use crate::types::PipeId;

#[derive(Debug, Clone)]
struct Outstanding {
    packet_id: u16,
    packet: PublishPacket,
    level: ProtocolLevel,
}

/// Per-pipe queues of unacknowledged publishes, each bounded at `msq_len`
/// with the oldest entry dropped on overflow.
#[derive(Debug)]
pub struct ResendQueue {
    map: HashMap<PipeId, VecDeque<Outstanding>>,
    msq_len: usize,
}

impl ResendQueue {
    #[must_use]
    pub fn new(msq_len: usize) -> Self {
        Self {
            map: HashMap::new(),
            msq_len: msq_len.max(1),
        }
    }

    /// Track a QoS>=1 publish sent to `pipe` until its PUBACK/PUBCOMP
    /// arrives.
    pub fn record(
        &mut self,
        pipe: PipeId,
        packet_id: u16,
        packet: PublishPacket,
        level: ProtocolLevel,
    ) {
        let queue = self.map.entry(pipe).or_default();
        if queue.len() >= self.msq_len {
            queue.pop_front();
        }
        queue.push_back(Outstanding {
            packet_id,
            packet,
            level,
        });
    }

    /// Clear the entry acknowledged by `packet_id`. Returns false for
    /// unknown ids, which is normal after a retransmit race.
    pub fn ack(&mut self, pipe: PipeId, packet_id: u16) -> bool {
        let Some(queue) = self.map.get_mut(&pipe) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.packet_id != packet_id);
        if queue.is_empty() {
            self.map.remove(&pipe);
        }
        before > self.map.get(&pipe).map_or(0, VecDeque::len)
    }

    pub fn drop_pipe(&mut self, pipe: PipeId) {
        self.map.remove(&pipe);
    }

    /// Encoded retransmissions for every outstanding entry, dup flag set.
    #[must_use]
    pub fn pending(&self) -> Vec<(PipeId, Vec<u8>)> {
        let mut out = Vec::new();
        for (pipe, queue) in &self.map {
            for entry in queue {
                let mut packet = entry.packet.clone();
                packet.set_dup(true);
                let mut buf = Vec::new();
                if packet.encode_with(entry.level, &mut buf).is_ok() {
                    out.push((*pipe, buf));
                }
            }
        }
        out
    }

    #[must_use]
    pub fn outstanding(&self, pipe: PipeId) -> usize {
        self.map.get(&pipe).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::QoS;

    fn publish(packet_id: u16) -> PublishPacket {
        let mut packet =
            PublishPacket::new("t", QoS::AtLeastOnce, Bytes::from_static(b"x")).unwrap();
        packet.set_packet_id(packet_id);
        packet
    }

    #[test]
    fn test_record_ack() {
        let mut queue = ResendQueue::new(8);
        queue.record(1, 10, publish(10), ProtocolLevel::V311);
        assert_eq!(queue.outstanding(1), 1);
        assert!(queue.ack(1, 10));
        assert_eq!(queue.outstanding(1), 0);
        assert!(!queue.ack(1, 10));
    }

    #[test]
    fn test_bounded_by_msq_len() {
        let mut queue = ResendQueue::new(2);
        for id in 1..=3 {
            queue.record(1, id, publish(id), ProtocolLevel::V311);
        }
        assert_eq!(queue.outstanding(1), 2);
        // Oldest entry was dropped.
        assert!(!queue.ack(1, 1));
        assert!(queue.ack(1, 3));
    }

    #[test]
    fn test_pending_sets_dup() {
        let mut queue = ResendQueue::new(4);
        queue.record(2, 5, publish(5), ProtocolLevel::V311);
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 2);
        // Header byte of QoS1 PUBLISH with dup: 0b0011_1010.
        assert_eq!(pending[0].1[0], 0x3a);
    }

    #[test]
    fn test_drop_pipe() {
        let mut queue = ResendQueue::new(4);
        queue.record(3, 1, publish(1), ProtocolLevel::V311);
        queue.drop_pipe(3);
        assert!(queue.pending().is_empty());
    }
}
