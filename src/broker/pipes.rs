// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Hash indexes keyed by pipe id and client id: the topic list owned by each
//! live pipe, its outbound handle, and the session cache for
//! clean-session=false reconnects.

use bytes::Bytes;
use codec::{ProtocolLevel, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use crate::conn_param::ConnParam;
use crate::types::PipeId;

/// One topic filter held by a pipe, the dual of a tree subscriber entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribedTopic {
    pub filter: String,
    pub qos: QoS,
}

/// Outbound half of a pipe: the writer-task channel, the protocol level the
/// client speaks, and the per-pipe packet id counter for QoS>=1 sends.
#[derive(Debug, Clone)]
pub struct PipeHandle {
    sender: Sender<Bytes>,
    protocol_level: ProtocolLevel,
    next_packet_id: Arc<AtomicU16>,
}

impl PipeHandle {
    #[must_use]
    pub fn new(sender: Sender<Bytes>, protocol_level: ProtocolLevel) -> Self {
        Self {
            sender,
            protocol_level,
            next_packet_id: Arc::new(AtomicU16::new(1)),
        }
    }

    #[must_use]
    pub const fn sender(&self) -> &Sender<Bytes> {
        &self.sender
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    /// Next non-zero packet id for this pipe.
    #[must_use]
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Pipe-id keyed index over live connections.
///
/// The topic lists here and the subscriber sets in the live tree are exact
/// duals; callers mutate both while holding the tree write guard and this
/// index together.
#[derive(Debug, Default)]
pub struct PipeIndex {
    topics: HashMap<PipeId, Vec<SubscribedTopic>>,
    handles: HashMap<PipeId, PipeHandle>,
}

impl PipeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipe: PipeId, handle: PipeHandle) {
        self.handles.insert(pipe, handle);
        self.topics.entry(pipe).or_default();
    }

    #[must_use]
    pub fn check_id(&self, pipe: PipeId) -> bool {
        self.topics.contains_key(&pipe)
    }

    #[must_use]
    pub fn handle(&self, pipe: PipeId) -> Option<PipeHandle> {
        self.handles.get(&pipe).cloned()
    }

    #[must_use]
    pub fn get_topics(&self, pipe: PipeId) -> Vec<SubscribedTopic> {
        self.topics.get(&pipe).cloned().unwrap_or_default()
    }

    /// Record `filter` for `pipe`, updating the QoS when already present.
    pub fn add_topic(&mut self, pipe: PipeId, filter: &str, qos: QoS) {
        let list = self.topics.entry(pipe).or_default();
        match list.iter_mut().find(|topic| topic.filter == filter) {
            Some(topic) => topic.qos = qos,
            None => list.push(SubscribedTopic {
                filter: filter.to_string(),
                qos,
            }),
        }
    }

    pub fn del_topic(&mut self, pipe: PipeId, filter: &str) {
        if let Some(list) = self.topics.get_mut(&pipe) {
            list.retain(|topic| topic.filter != filter);
        }
    }

    /// Drop everything known about `pipe`, returning its topic list.
    pub fn del(&mut self, pipe: PipeId) -> Vec<SubscribedTopic> {
        self.handles.remove(&pipe);
        self.topics.remove(&pipe).unwrap_or_default()
    }
}

/// Session state kept after a clean-session=false client disconnects.
#[derive(Debug, Clone)]
pub struct CachedSession {
    pub cparam: Arc<ConnParam>,

    /// Pipe id at cache time; only informational once cached.
    pub pipe: PipeId,

    pub topics: Vec<SubscribedTopic>,
}

/// Client-id keyed session cache, bounded by `cache_cap`; the oldest entry
/// is evicted at capacity.
#[derive(Debug)]
pub struct SessionCache {
    map: HashMap<String, CachedSession>,
    order: VecDeque<String>,
    cap: usize,
}

impl SessionCache {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.map.contains_key(client_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn cache(&mut self, client_id: &str, session: CachedSession) {
        if self.map.insert(client_id.to_string(), session).is_none() {
            self.order.push_back(client_id.to_string());
        }
        while self.map.len() > self.cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }

    /// Consume the cached session for `client_id`, if any.
    pub fn take(&mut self, client_id: &str) -> Option<CachedSession> {
        let session = self.map.remove(client_id)?;
        self.order.retain(|id| id != client_id);
        Some(session)
    }

    /// Drop a cached session without restoring it, as a clean-session=true
    /// CONNECT does.
    pub fn evict(&mut self, client_id: &str) {
        if self.map.remove(client_id).is_some() {
            self.order.retain(|id| id != client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::ConnectPacket;
    use tokio::sync::mpsc;

    fn handle() -> PipeHandle {
        let (sender, _receiver) = mpsc::channel(4);
        PipeHandle::new(sender, ProtocolLevel::V311)
    }

    fn session(pipe: PipeId) -> CachedSession {
        CachedSession {
            cparam: Arc::new(ConnParam::new(&ConnectPacket::new("cached"))),
            pipe,
            topics: vec![SubscribedTopic {
                filter: "news/#".to_string(),
                qos: QoS::AtLeastOnce,
            }],
        }
    }

    #[test]
    fn test_add_del_topic() {
        let mut index = PipeIndex::new();
        index.register(3, handle());
        assert!(index.check_id(3));

        index.add_topic(3, "a/b", QoS::AtMostOnce);
        index.add_topic(3, "a/b", QoS::AtLeastOnce);
        index.add_topic(3, "c", QoS::AtMostOnce);
        let topics = index.get_topics(3);
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].qos, QoS::AtLeastOnce);

        index.del_topic(3, "a/b");
        assert_eq!(index.get_topics(3).len(), 1);

        let rest = index.del(3);
        assert_eq!(rest.len(), 1);
        assert!(!index.check_id(3));
        assert!(index.handle(3).is_none());
    }

    #[test]
    fn test_packet_id_never_zero() {
        let handle = handle();
        for _ in 0..(u16::MAX as u32 + 2) {
            assert_ne!(handle.next_packet_id(), 0);
        }
    }

    #[test]
    fn test_session_cache_round_trip() {
        let mut cache = SessionCache::new(16);
        cache.cache("alice", session(1));
        assert!(cache.contains("alice"));

        let restored = cache.take("alice").unwrap();
        assert_eq!(restored.pipe, 1);
        assert_eq!(restored.topics[0].filter, "news/#");
        assert!(!cache.contains("alice"));
    }

    #[test]
    fn test_session_cache_evicts_oldest() {
        let mut cache = SessionCache::new(2);
        cache.cache("a", session(1));
        cache.cache("b", session(2));
        cache.cache("c", session(3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_session_cache_evict() {
        let mut cache = SessionCache::new(4);
        cache.cache("a", session(1));
        cache.evict("a");
        assert!(cache.is_empty());
        assert!(cache.take("a").is_none());
    }
}
