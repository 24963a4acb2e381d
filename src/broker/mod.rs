// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Broker context: the shared tables every worker and pipe operates on.

pub mod dbtree;
pub mod event;
pub mod pipes;
pub mod pub_handler;
pub mod resend;
pub mod sub_handler;
pub mod unsub_handler;
pub mod worker;

use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::auth::AuthTable;
use crate::commands::WorkMessage;
use crate::config::Config;
use crate::conn_param::ConnParam;
use crate::types::PipeId;
use dbtree::Dbtree;
use pipes::{CachedSession, PipeHandle, PipeIndex, SessionCache};
use resend::ResendQueue;

const CHANNEL_CAPACITY: usize = 64;

/// Process-wide broker state, threaded as a value into every worker and
/// pipe task. There are no module-level mutables.
///
/// Lock order, where several are held: `db` (write) before `pipes`; no lock
/// is held across an await point.
#[derive(Debug)]
pub struct Broker {
    pub config: Config,
    pub auth: AuthTable,

    /// Live subscription tree.
    pub db: RwLock<Dbtree>,

    /// Retained message tree.
    pub db_ret: RwLock<Dbtree>,

    pub pipes: Mutex<PipeIndex>,
    pub sessions: Mutex<SessionCache>,
    pub resend: Mutex<ResendQueue>,

    inbound_tx: mpsc::Sender<WorkMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<WorkMessage>>,

    bridge_ingress_tx: mpsc::Sender<WorkMessage>,
    bridge_ingress_rx: tokio::sync::Mutex<mpsc::Receiver<WorkMessage>>,

    /// Send half of the bridge egress path, set once the bridge client is
    /// connected.
    bridge_egress_tx: Mutex<Option<mpsc::Sender<codec::PublishPacket>>>,
}

impl Broker {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let auth = AuthTable::new(&config.auths, config.allow_anonymous);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (bridge_ingress_tx, bridge_ingress_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cache_cap = config.cache_cap;
        let msq_len = config.msq_len;
        Arc::new(Self {
            config,
            auth,
            db: RwLock::new(Dbtree::new()),
            db_ret: RwLock::new(Dbtree::new()),
            pipes: Mutex::new(PipeIndex::new()),
            sessions: Mutex::new(SessionCache::new(cache_cap)),
            resend: Mutex::new(ResendQueue::new(msq_len)),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            bridge_ingress_tx,
            bridge_ingress_rx: tokio::sync::Mutex::new(bridge_ingress_rx),
            bridge_egress_tx: Mutex::new(None),
        })
    }

    /// Sender used by pipes to push framed packets into the shared worker
    /// channel.
    #[must_use]
    pub fn inbound_sender(&self) -> mpsc::Sender<WorkMessage> {
        self.inbound_tx.clone()
    }

    #[must_use]
    pub fn bridge_ingress_sender(&self) -> mpsc::Sender<WorkMessage> {
        self.bridge_ingress_tx.clone()
    }

    /// Take one work message off the shared channel. Workers block here
    /// between transitions; `None` means shutdown.
    pub async fn recv_inbound(&self) -> Option<WorkMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn recv_bridge_ingress(&self) -> Option<WorkMessage> {
        self.bridge_ingress_rx.lock().await.recv().await
    }

    pub fn set_bridge_egress(&self, sender: mpsc::Sender<codec::PublishPacket>) {
        *self.bridge_egress_tx.lock().unwrap() = Some(sender);
    }

    #[must_use]
    pub fn bridge_egress(&self) -> Option<mpsc::Sender<codec::PublishPacket>> {
        self.bridge_egress_tx.lock().unwrap().clone()
    }

    #[must_use]
    pub fn pipe_handle(&self, pipe: PipeId) -> Option<PipeHandle> {
        self.pipes.lock().unwrap().handle(pipe)
    }

    pub fn register_pipe(&self, pipe: PipeId, handle: PipeHandle) {
        self.pipes.lock().unwrap().register(pipe, handle);
    }

    #[must_use]
    pub fn session_present(&self, client_id: &str) -> bool {
        self.sessions.lock().unwrap().contains(client_id)
    }

    pub fn evict_session(&self, client_id: &str) {
        self.sessions.lock().unwrap().evict(client_id);
    }

    /// Snapshot the subscriptions of `pipe` into the session cache, keyed by
    /// client id. The live entries themselves are torn down separately.
    pub fn cache_session(&self, client_id: &str, cparam: Arc<ConnParam>, pipe: PipeId) {
        let topics = self.pipes.lock().unwrap().get_topics(pipe);
        let session = CachedSession {
            cparam,
            pipe,
            topics,
        };
        self.sessions.lock().unwrap().cache(client_id, session);
        log::debug!("session cached for client: {client_id}");
    }

    /// Re-bind the cached subscriptions of `client_id` to `new_pipe`, in
    /// both the pipe index and the live tree. Returns false when nothing was
    /// cached.
    pub fn restore_session(&self, client_id: &str, new_pipe: PipeId) -> bool {
        let Some(session) = self.sessions.lock().unwrap().take(client_id) else {
            return false;
        };
        let mut db = self.db.write().unwrap();
        let mut pipes = self.pipes.lock().unwrap();
        for topic in &session.topics {
            db.insert(&topic.filter, new_pipe, topic.qos);
            pipes.add_topic(new_pipe, &topic.filter, topic.qos);
        }
        log::debug!(
            "session restored for client: {client_id}, pipe {} -> {new_pipe}",
            session.pipe
        );
        true
    }

    /// Remove every subscription held by `pipe` from the live tree, then
    /// drop its index entry, handle and resend queue.
    pub fn teardown_pipe(&self, pipe: PipeId) {
        let mut db = self.db.write().unwrap();
        let mut pipes = self.pipes.lock().unwrap();
        for topic in pipes.get_topics(pipe) {
            db.delete(&topic.filter, pipe);
        }
        pipes.del(pipe);
        drop(pipes);
        drop(db);
        self.resend.lock().unwrap().drop_pipe(pipe);
    }
}
