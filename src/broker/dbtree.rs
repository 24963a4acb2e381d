// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Wildcard-capable topic tree, mapping topic filters to subscriber sets and
//! topic names to retained messages.
//!
//! The broker keeps two instances: the live tree, consulted by `match_topic`
//! on every PUBLISH, and the retained tree, where `retain`/`retained_for`
//! store messages at exact literal paths.

use bytes::Bytes;
use codec::QoS;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::types::PipeId;

/// One subscription entry at a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub pipe: PipeId,

    /// QoS requested in the SUBSCRIBE packet.
    pub qos: QoS,
}

/// The last publication sent with retain=1 on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retained {
    pub payload: Bytes,
    pub qos: QoS,
    pub timestamp: SystemTime,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Node {
    /// Children indexed by literal level.
    children: HashMap<String, Node>,

    /// Child for the single-level wildcard `+`.
    plus: Option<Box<Node>>,

    /// Child for the multi-level wildcard `#`. Never has children of its
    /// own.
    hash: Option<Box<Node>>,

    /// At most one entry per pipe.
    subscribers: Vec<Subscriber>,

    retained: Option<Retained>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.plus.is_none()
            && self.hash.is_none()
            && self.subscribers.is_empty()
            && self.retained.is_none()
    }
}

/// The topic tree itself. Concurrency is handled by the caller; the broker
/// wraps each instance in a `RwLock` so `match_topic` runs under a read
/// guard while subscription churn takes the write guard.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dbtree {
    root: Node,
}

impl Dbtree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pipe` as a subscriber of `filter`. A pipe already present at the
    /// terminal node only has its requested QoS updated.
    pub fn insert(&mut self, filter: &str, pipe: PipeId, qos: QoS) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = match level {
                "+" => &mut **node.plus.get_or_insert_with(Box::default),
                "#" => &mut **node.hash.get_or_insert_with(Box::default),
                _ => node.children.entry(level.to_string()).or_default(),
            };
        }
        match node.subscribers.iter_mut().find(|sub| sub.pipe == pipe) {
            Some(sub) => sub.qos = qos,
            None => node.subscribers.push(Subscriber { pipe, qos }),
        }
    }

    /// Remove `pipe` from the subscriber set of `filter`, pruning nodes left
    /// with no children, no subscribers and no retained message.
    pub fn delete(&mut self, filter: &str, pipe: PipeId) -> Option<Subscriber> {
        let levels: Vec<&str> = filter.split('/').collect();
        Self::delete_at(&mut self.root, &levels, pipe)
    }

    fn delete_at(node: &mut Node, levels: &[&str], pipe: PipeId) -> Option<Subscriber> {
        let Some((level, rest)) = levels.split_first() else {
            let pos = node.subscribers.iter().position(|sub| sub.pipe == pipe)?;
            return Some(node.subscribers.remove(pos));
        };
        match *level {
            "+" => {
                let child = node.plus.as_deref_mut()?;
                let removed = Self::delete_at(child, rest, pipe);
                if node.plus.as_ref().map_or(false, |child| child.is_empty()) {
                    node.plus = None;
                }
                removed
            }
            "#" => {
                let child = node.hash.as_deref_mut()?;
                let removed = Self::delete_at(child, rest, pipe);
                if node.hash.as_ref().map_or(false, |child| child.is_empty()) {
                    node.hash = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(*level)?;
                let removed = Self::delete_at(child, rest, pipe);
                if child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// Collect every subscriber whose filter matches `topic`. Duplicate
    /// pipes are collapsed, the highest requested QoS winning.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> Vec<Subscriber> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        if topic.starts_with('$') {
            // Wildcards at the first level never match `$` topics
            // [MQTT-4.7.2-1].
            if let Some(child) = self.root.children.get(levels[0]) {
                Self::collect(child, &levels[1..], &mut out);
            }
        } else {
            Self::collect(&self.root, &levels, &mut out);
        }

        out.sort_by_key(|sub| sub.pipe);
        out.dedup_by(|dup, keep| {
            if dup.pipe == keep.pipe {
                keep.qos = keep.qos.max(dup.qos);
                true
            } else {
                false
            }
        });
        out
    }

    fn collect(node: &Node, levels: &[&str], out: &mut Vec<Subscriber>) {
        // `#` also matches the parent level itself [MQTT-4.7.1-2].
        if let Some(hash) = &node.hash {
            out.extend_from_slice(&hash.subscribers);
        }
        let Some((level, rest)) = levels.split_first() else {
            out.extend_from_slice(&node.subscribers);
            return;
        };
        if let Some(child) = node.children.get(*level) {
            Self::collect(child, rest, out);
        }
        if let Some(plus) = node.plus.as_deref() {
            Self::collect(plus, rest, out);
        }
    }

    /// Store a retained message at the exact literal `topic` path. An empty
    /// payload deletes the entry.
    pub fn retain(&mut self, topic: &str, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            let levels: Vec<&str> = topic.split('/').collect();
            Self::clear_retained_at(&mut self.root, &levels);
            return;
        }
        let mut node = &mut self.root;
        for level in topic.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.retained = Some(Retained {
            payload,
            qos,
            timestamp: SystemTime::now(),
        });
    }

    fn clear_retained_at(node: &mut Node, levels: &[&str]) {
        let Some((level, rest)) = levels.split_first() else {
            node.retained = None;
            return;
        };
        if let Some(child) = node.children.get_mut(*level) {
            Self::clear_retained_at(child, rest);
            if child.is_empty() {
                node.children.remove(*level);
            }
        }
    }

    /// Fetch every retained message whose topic matches `filter`, with the
    /// topic it was stored under.
    #[must_use]
    pub fn retained_for(&self, filter: &str) -> Vec<(String, Retained)> {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        Self::collect_retained(&self.root, &levels, &mut prefix, &mut out);
        out
    }

    fn collect_retained(
        node: &Node,
        levels: &[&str],
        prefix: &mut Vec<String>,
        out: &mut Vec<(String, Retained)>,
    ) {
        let Some((level, rest)) = levels.split_first() else {
            if let Some(retained) = &node.retained {
                out.push((prefix.join("/"), retained.clone()));
            }
            return;
        };
        match *level {
            "#" => Self::collect_retained_all(node, prefix, out),
            "+" => {
                for (name, child) in &node.children {
                    // As in matching, a leading wildcard skips `$` topics.
                    if prefix.is_empty() && name.starts_with('$') {
                        continue;
                    }
                    prefix.push(name.clone());
                    Self::collect_retained(child, rest, prefix, out);
                    prefix.pop();
                }
            }
            _ => {
                if let Some(child) = node.children.get(*level) {
                    prefix.push((*level).to_string());
                    Self::collect_retained(child, rest, prefix, out);
                    prefix.pop();
                }
            }
        }
    }

    fn collect_retained_all(
        node: &Node,
        prefix: &mut Vec<String>,
        out: &mut Vec<(String, Retained)>,
    ) {
        if let Some(retained) = &node.retained {
            out.push((prefix.join("/"), retained.clone()));
        }
        for (name, child) in &node.children {
            if prefix.is_empty() && name.starts_with('$') {
                continue;
            }
            prefix.push(name.clone());
            Self::collect_retained_all(child, prefix, out);
            prefix.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipes(subs: &[Subscriber]) -> Vec<PipeId> {
        subs.iter().map(|sub| sub.pipe).collect()
    }

    #[test]
    fn test_insert_match_literal() {
        let mut db = Dbtree::new();
        db.insert("sport/tennis/player", 1, QoS::AtLeastOnce);
        let subs = db.match_topic("sport/tennis/player");
        assert_eq!(pipes(&subs), vec![1]);
        assert!(db.match_topic("sport/tennis").is_empty());
        assert!(db.match_topic("sport/tennis/player/ranking").is_empty());
    }

    #[test]
    fn test_wildcard_fan_out() {
        let mut db = Dbtree::new();
        db.insert("sport/+/player", 1, QoS::AtLeastOnce);
        db.insert("sport/#", 2, QoS::AtLeastOnce);
        db.insert("sport/tennis/player", 3, QoS::AtLeastOnce);

        let subs = db.match_topic("sport/tennis/player");
        assert_eq!(pipes(&subs), vec![1, 2, 3]);

        let subs = db.match_topic("sport/tennis");
        assert_eq!(pipes(&subs), vec![2]);

        // `sport/#` matches `sport` itself.
        let subs = db.match_topic("sport");
        assert_eq!(pipes(&subs), vec![2]);
    }

    #[test]
    fn test_duplicate_pipe_highest_qos_wins() {
        let mut db = Dbtree::new();
        db.insert("a/+", 7, QoS::AtMostOnce);
        db.insert("a/b", 7, QoS::ExactOnce);
        let subs = db.match_topic("a/b");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].qos, QoS::ExactOnce);
    }

    #[test]
    fn test_insert_same_pipe_updates_qos() {
        let mut db = Dbtree::new();
        db.insert("a/b", 1, QoS::AtMostOnce);
        db.insert("a/b", 1, QoS::AtLeastOnce);
        let subs = db.match_topic("a/b");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_delete_prunes_empty_nodes() {
        let mut db = Dbtree::new();
        db.insert("sport/tennis/player", 1, QoS::AtMostOnce);
        let removed = db.delete("sport/tennis/player", 1);
        assert_eq!(
            removed,
            Some(Subscriber {
                pipe: 1,
                qos: QoS::AtMostOnce
            })
        );
        // Subscribe then unsubscribe restores the empty tree.
        assert_eq!(db, Dbtree::new());
    }

    #[test]
    fn test_delete_keeps_retained_nodes() {
        let mut db = Dbtree::new();
        db.retain("state/door", Bytes::from_static(b"open"), QoS::AtMostOnce);
        db.insert("state/door", 4, QoS::AtMostOnce);
        db.delete("state/door", 4);
        assert_eq!(db.retained_for("state/door").len(), 1);
    }

    #[test]
    fn test_delete_missing() {
        let mut db = Dbtree::new();
        db.insert("a/b", 1, QoS::AtMostOnce);
        assert!(db.delete("a/b", 2).is_none());
        assert!(db.delete("a/c", 1).is_none());
    }

    #[test]
    fn test_dollar_topics_not_matched_by_wildcards() {
        let mut db = Dbtree::new();
        db.insert("#", 1, QoS::AtMostOnce);
        db.insert("+/brokers/connected", 2, QoS::AtMostOnce);
        db.insert("$SYS/brokers/connected", 3, QoS::AtMostOnce);

        let subs = db.match_topic("$SYS/brokers/connected");
        assert_eq!(pipes(&subs), vec![3]);

        let subs = db.match_topic("normal/brokers/connected");
        assert_eq!(pipes(&subs), vec![1, 2]);
    }

    #[test]
    fn test_retain_round_trip() {
        let mut db = Dbtree::new();
        db.retain("state/door", Bytes::from_static(b"open"), QoS::AtMostOnce);
        let found = db.retained_for("state/door");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "state/door");
        assert_eq!(found[0].1.payload.as_ref(), b"open");

        // Empty payload clears the entry and prunes the path.
        db.retain("state/door", Bytes::new(), QoS::AtMostOnce);
        assert!(db.retained_for("state/door").is_empty());
        assert_eq!(db, Dbtree::new());
    }

    #[test]
    fn test_retained_for_wildcards() {
        let mut db = Dbtree::new();
        db.retain("state/door", Bytes::from_static(b"open"), QoS::AtMostOnce);
        db.retain("state/window", Bytes::from_static(b"shut"), QoS::AtMostOnce);
        db.retain("other/door", Bytes::from_static(b"x"), QoS::AtMostOnce);

        let mut found: Vec<String> = db
            .retained_for("state/+")
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
        found.sort();
        assert_eq!(found, vec!["state/door", "state/window"]);

        assert_eq!(db.retained_for("#").len(), 3);
        assert_eq!(db.retained_for("state/#").len(), 2);
    }

    #[test]
    fn test_retained_overwrite() {
        let mut db = Dbtree::new();
        db.retain("t", Bytes::from_static(b"one"), QoS::AtMostOnce);
        db.retain("t", Bytes::from_static(b"two"), QoS::AtLeastOnce);
        let found = db.retained_for("t");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.payload.as_ref(), b"two");
        assert_eq!(found[0].1.qos, QoS::AtLeastOnce);
    }
}
