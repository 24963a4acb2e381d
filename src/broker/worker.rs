// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! The per-worker request/response state machine.
//!
//! A fixed pool of work items shares one inbound channel. Each item runs
//! strictly one state transition per wake-up: INIT arms the receive, RECV
//! classifies the packet and runs the publish/session handlers, WAIT drives
//! the outbound sends, SEND releases per-packet state and re-arms. Items
//! serving the bridge park in BRIDGE instead of RECV and re-enter the local
//! RECV logic with whatever the upstream broker delivered.

use bytes::Bytes;
use codec::{EncodePacket, PingResponsePacket, PublishPacket, PublishReleasePacket, QoS};
use std::sync::Arc;

use super::event;
use super::pub_handler::{handle_pub, PipeFanout};
use super::sub_handler::sub_ctx_handle;
use super::unsub_handler::unsub_ctx_handle;
use super::Broker;
use crate::commands::{Packet, WorkMessage};
use crate::error::Error;
use crate::types::{PipeId, Proto};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Recv,
    Wait,
    Send,
    Bridge,
}

/// One unit of concurrency in the worker pool.
#[derive(Debug)]
pub struct Work {
    id: u32,
    state: State,
    proto: Proto,
    broker: Arc<Broker>,

    /// Inbound slot; also used by BRIDGE to inject upstream messages into
    /// RECV.
    msg: Option<WorkMessage>,

    /// Decoded form of the PUBLISH being fanned out.
    pub_packet: Option<PublishPacket>,

    /// Fan-out descriptor for the current PUBLISH.
    pipe_ct: PipeFanout,

    /// Retained replays collected while handling a SUBSCRIBE.
    msg_ret: Vec<PublishPacket>,
}

impl Work {
    #[must_use]
    pub fn new(id: u32, proto: Proto, broker: Arc<Broker>) -> Self {
        Self {
            id,
            state: State::Init,
            proto,
            broker,
            msg: None,
            pub_packet: None,
            pipe_ct: PipeFanout::new(),
            msg_ret: Vec::new(),
        }
    }

    /// Drive the state machine until the inbound channel closes or a fatal
    /// error aborts this worker.
    pub async fn run(mut self) {
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("worker {}: inbound channel closed", self.id);
                    break;
                }
                Err(err) => {
                    log::error!("worker {}: fatal: {err}", self.id);
                    break;
                }
            }
        }
    }

    /// Run exactly one state transition. `Ok(false)` means shutdown.
    async fn step(&mut self) -> Result<bool, Error> {
        match self.state {
            State::Init => {
                self.state = match self.proto {
                    Proto::Broker => State::Recv,
                    Proto::Bridge => State::Bridge,
                };
                Ok(true)
            }
            State::Recv => self.recv().await,
            State::Wait => self.wait().await,
            State::Send => {
                // Last-in-fanout allocations are already released; reset is
                // idempotent by design, the two PUBLISH paths can never
                // both free.
                self.release_pub_state();
                self.rearm();
                Ok(true)
            }
            State::Bridge => self.bridge_recv().await,
        }
    }

    fn rearm(&mut self) {
        self.state = match self.proto {
            Proto::Broker => State::Recv,
            Proto::Bridge => State::Bridge,
        };
    }

    fn release_pub_state(&mut self) {
        self.pub_packet = None;
        self.pipe_ct.reset();
    }

    async fn send_to_pipe(&self, pipe: PipeId, buf: Vec<u8>) {
        let Some(handle) = self.broker.pipe_handle(pipe) else {
            log::debug!("worker {}: send to dead pipe {pipe}", self.id);
            return;
        };
        if handle.sender().send(Bytes::from(buf)).await.is_err() {
            log::debug!("worker {}: pipe {pipe} writer gone", self.id);
        }
    }

    async fn recv(&mut self) -> Result<bool, Error> {
        let mut msg = match self.msg.take() {
            // Injected by the BRIDGE transition.
            Some(msg) => msg,
            None => match self.broker.recv_inbound().await {
                Some(msg) => msg,
                None => return Ok(false),
            },
        };
        log::trace!("RECV ^^^^ ctx{} ^^^^ {}", self.id, msg.packet.name());

        match &msg.packet {
            Packet::Disconnect { send_will } => {
                // Disconnect reserved for the will msg.
                let will = if *send_will {
                    event::compose_will(&msg.cparam)
                } else {
                    None
                };
                let Some(will) = will else {
                    // Clean shutdown, nothing to fan out; re-arm receive.
                    return Ok(true);
                };
                self.pipe_ct = handle_pub(&self.broker, &will);
                self.pub_packet = Some(will.clone());
                msg.packet = Packet::Publish(will);
            }
            Packet::Publish(packet) => {
                self.pipe_ct = handle_pub(&self.broker, packet);
                self.pub_packet = Some(packet.clone());
                self.forward_to_bridge(&msg, packet).await;
            }
            Packet::Connack(ack) => {
                // Restore the cached session before the CONNACK leaves, so
                // later publishes already see the subscriptions.
                let client_id = msg.cparam.client_id().to_string();
                if msg.cparam.clean_session() {
                    self.broker.evict_session(&client_id);
                } else {
                    self.broker.restore_session(&client_id, msg.pipe);
                }

                let mut buf = Vec::new();
                ack.encode_with(msg.cparam.protocol_level(), &mut buf)?;
                self.send_to_pipe(msg.pipe, buf).await;

                let notify = event::notify_connect(&msg.cparam);
                self.pipe_ct = handle_pub(&self.broker, &notify);
                self.pub_packet = Some(notify.clone());
                msg.packet = Packet::Publish(notify);
            }
            Packet::DisconnectEvent => {
                let notify = event::notify_disconnect(&msg.cparam);
                self.pipe_ct = handle_pub(&self.broker, &notify);
                self.pub_packet = Some(notify.clone());

                let client_id = msg.cparam.client_id().to_string();
                if !client_id.is_empty() && !msg.cparam.clean_session() {
                    self.broker
                        .cache_session(&client_id, msg.cparam.clone(), msg.pipe);
                }
                if self.broker.pipes.lock().unwrap().check_id(msg.pipe) {
                    self.broker.teardown_pipe(msg.pipe);
                } else {
                    log::error!("worker {}: disconnect event for unknown pipe {}", self.id, msg.pipe);
                }
                msg.packet = Packet::Publish(notify);
            }
            // Everything else is handled in WAIT.
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq => {}
        }

        self.msg = Some(msg);
        self.state = State::Wait;
        Ok(true)
    }

    /// Re-publish a locally received PUBLISH upstream when it matches one of
    /// the configured forward filters. Messages the bridge itself injected
    /// (pipe 0) stay local.
    async fn forward_to_bridge(&self, msg: &WorkMessage, packet: &PublishPacket) {
        let bridge = &self.broker.config.bridge;
        if !bridge.bridge_mode || msg.pipe == 0 {
            return;
        }
        let found = bridge
            .forwards
            .iter()
            .any(|filter| codec::topic_matches(filter, packet.topic()));
        if !found {
            return;
        }
        let Some(sender) = self.broker.bridge_egress() else {
            log::warn!("worker {}: bridge egress not connected", self.id);
            return;
        };
        // Payload, dup, qos and retain are preserved as published.
        if let Err(err) = sender.send(packet.clone()).await {
            log::error!("worker {}: bridge forward failed: {err}", self.id);
        }
    }

    async fn wait(&mut self) -> Result<bool, Error> {
        let Some(msg) = self.msg.take() else {
            log::debug!("worker {}: broker has nothing to do", self.id);
            self.rearm();
            return Ok(true);
        };
        log::trace!("WAIT ^^^^ ctx{} ^^^^ {}", self.id, msg.packet.name());

        match msg.packet {
            Packet::PingReq => {
                let mut buf = Vec::new();
                PingResponsePacket::new().encode(&mut buf)?;
                self.send_to_pipe(msg.pipe, buf).await;
                self.state = State::Send;
            }
            Packet::PubRec(rec) => {
                // Broker-as-sender side of QoS 2: answer with PUBREL.
                self.broker
                    .resend
                    .lock()
                    .unwrap()
                    .ack(msg.pipe, rec.packet_id());
                let mut buf = Vec::new();
                PublishReleasePacket::new(rec.packet_id()).encode(&mut buf)?;
                self.send_to_pipe(msg.pipe, buf).await;
                self.state = State::Send;
            }
            Packet::Subscribe(packet) => {
                let (suback, replays) = sub_ctx_handle(&self.broker, msg.pipe, &packet);
                self.msg_ret = replays;
                self.deliver_retained(msg.pipe).await?;

                if let Some(handle) = self.broker.pipe_handle(msg.pipe) {
                    let mut buf = Vec::new();
                    suback.encode_with(handle.protocol_level(), &mut buf)?;
                    self.send_to_pipe(msg.pipe, buf).await;
                }
                self.state = State::Send;
            }
            Packet::Unsubscribe(packet) => {
                let unsuback = unsub_ctx_handle(&self.broker, msg.pipe, &packet);
                if let Some(handle) = self.broker.pipe_handle(msg.pipe) {
                    let mut buf = Vec::new();
                    unsuback.encode_with(handle.protocol_level(), &mut buf)?;
                    self.send_to_pipe(msg.pipe, buf).await;
                }
                self.state = State::Send;
            }
            Packet::Publish(_) => {
                if self.pipe_ct.total() > 0 {
                    self.dispatch_fanout().await?;
                    self.state = State::Send;
                } else {
                    // Nothing to deliver; release the msg and re-arm. This
                    // path and the dispatch above are mutually exclusive.
                    self.release_pub_state();
                    self.rearm();
                }
            }
            Packet::PubAck(ack) => {
                self.broker
                    .resend
                    .lock()
                    .unwrap()
                    .ack(msg.pipe, ack.packet_id());
                self.rearm();
            }
            Packet::PubComp(comp) => {
                self.broker
                    .resend
                    .lock()
                    .unwrap()
                    .ack(msg.pipe, comp.packet_id());
                self.rearm();
            }
            Packet::PubRel(_) => {
                // The transport already answered PUBCOMP; just release.
                self.rearm();
            }
            Packet::Connack(_) | Packet::Disconnect { .. } | Packet::DisconnectEvent => {
                // Fully handled in RECV.
                log::debug!("worker {}: broker has nothing to do", self.id);
                self.rearm();
            }
        }
        Ok(true)
    }

    /// Send the collected retained replays, each encoded for the subscriber
    /// and tracked for resend when QoS>=1. They precede the SUBACK in wire
    /// order.
    async fn deliver_retained(&mut self, pipe: PipeId) -> Result<(), Error> {
        if self.msg_ret.is_empty() {
            return Ok(());
        }
        let Some(handle) = self.broker.pipe_handle(pipe) else {
            self.msg_ret.clear();
            return Ok(());
        };
        for mut replay in self.msg_ret.drain(..) {
            if replay.qos() != QoS::AtMostOnce {
                let packet_id = handle.next_packet_id();
                replay.set_packet_id(packet_id);
                self.broker.resend.lock().unwrap().record(
                    pipe,
                    packet_id,
                    replay.clone(),
                    handle.protocol_level(),
                );
            }
            let mut buf = Vec::new();
            replay.encode_with(handle.protocol_level(), &mut buf)?;
            if handle.sender().send(Bytes::from(buf)).await.is_err() {
                break;
            }
        }
        self.msg_ret.clear();
        Ok(())
    }

    /// Clone the message once per destination, encode with the negotiated
    /// QoS and the subscriber's protocol level, and hand each copy to its
    /// pipe writer. Frees the fan-out state when exhausted.
    async fn dispatch_fanout(&mut self) -> Result<(), Error> {
        let Some(packet) = self.pub_packet.take() else {
            self.pipe_ct.reset();
            return Ok(());
        };
        log::trace!(
            "worker {}: total pipes: {}",
            self.id,
            self.pipe_ct.total()
        );
        while !self.pipe_ct.is_done() {
            let info = self.pipe_ct.remaining()[0];
            if let Some(handle) = self.broker.pipe_handle(info.pipe) {
                let mut clone = packet.clone();
                clone.set_qos(info.qos);
                clone.set_dup(false);
                // Live deliveries carry retain=0; only replays for new
                // subscriptions keep it set [MQTT-3.3.1-9].
                clone.set_retain(false);
                if info.qos != QoS::AtMostOnce {
                    let packet_id = handle.next_packet_id();
                    clone.set_packet_id(packet_id);
                    self.broker.resend.lock().unwrap().record(
                        info.pipe,
                        packet_id,
                        clone.clone(),
                        handle.protocol_level(),
                    );
                }
                let mut buf = Vec::new();
                clone.encode_with(handle.protocol_level(), &mut buf)?;
                if handle.sender().send(Bytes::from(buf)).await.is_err() {
                    log::debug!("worker {}: pipe {} writer gone", self.id, info.pipe);
                }
            }
            self.pipe_ct.advance();
        }
        self.release_pub_state();
        Ok(())
    }

    async fn bridge_recv(&mut self) -> Result<bool, Error> {
        match self.broker.recv_bridge_ingress().await {
            Some(msg) => {
                // Tag along and re-enter the local RECV logic.
                self.msg = Some(msg);
                self.state = State::Recv;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conn_param::ConnParam;
    use crate::broker::pipes::PipeHandle;
    use codec::{
        ByteArray, ConnectPacket, DecodePacket, ProtocolLevel, SubscribeAckPacket,
        SubscribePacket, SubscribeTopic,
    };
    use tokio::sync::mpsc;

    fn message(pipe: PipeId, packet: Packet) -> WorkMessage {
        WorkMessage {
            pipe,
            cparam: Arc::new(ConnParam::new(&ConnectPacket::new("test"))),
            packet,
        }
    }

    fn register_pipe(broker: &Broker, pipe: PipeId) -> mpsc::Receiver<Bytes> {
        let (sender, receiver) = mpsc::channel(16);
        broker.register_pipe(pipe, PipeHandle::new(sender, ProtocolLevel::V311));
        receiver
    }

    async fn drive(broker: &Arc<Broker>, msg: WorkMessage) {
        let mut work = Work::new(0, Proto::Broker, broker.clone());
        work.msg = Some(msg);
        // INIT, then the injected message flows RECV -> WAIT -> SEND.
        for _ in 0..4 {
            let _ = work.step().await.unwrap();
            if work.state == State::Recv && work.msg.is_none() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscriber() {
        let broker = Broker::new(Config::default());
        let mut receiver = register_pipe(&broker, 2);
        broker.db.write().unwrap().insert("t/1", 2, QoS::AtMostOnce);
        broker.pipes.lock().unwrap().add_topic(2, "t/1", QoS::AtMostOnce);

        let publish =
            PublishPacket::new("t/1", QoS::AtMostOnce, Bytes::from_static(b"hi")).unwrap();
        drive(&broker, message(1, Packet::Publish(publish))).await;

        let frame = receiver.try_recv().expect("publish should be delivered");
        let mut ba = ByteArray::new(&frame);
        let delivered = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(delivered.topic(), "t/1");
        assert_eq!(delivered.message().as_ref(), b"hi");
        assert!(!delivered.retain());
    }

    #[tokio::test]
    async fn test_publish_with_no_match_just_rearms() {
        let broker = Broker::new(Config::default());
        let publish =
            PublishPacket::new("nobody/home", QoS::AtMostOnce, Bytes::from_static(b"x")).unwrap();
        let mut work = Work::new(0, Proto::Broker, broker.clone());
        work.msg = Some(message(1, Packet::Publish(publish)));

        let _ = work.step().await.unwrap(); // INIT
        let _ = work.step().await.unwrap(); // RECV
        assert_eq!(work.state, State::Wait);
        let _ = work.step().await.unwrap(); // WAIT, fanout.total == 0
        assert_eq!(work.state, State::Recv);
        assert!(work.pub_packet.is_none());
        assert_eq!(work.pipe_ct.total(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_sends_retained_then_suback() {
        let broker = Broker::new(Config::default());
        let mut receiver = register_pipe(&broker, 3);
        broker.db_ret.write().unwrap().retain(
            "state/door",
            Bytes::from_static(b"open"),
            QoS::AtMostOnce,
        );

        let subscribe = SubscribePacket::new(
            5,
            vec![SubscribeTopic::new("state/door", QoS::AtMostOnce).unwrap()],
        );
        drive(&broker, message(3, Packet::Subscribe(subscribe))).await;

        let first = receiver.try_recv().expect("retained replay first");
        let mut ba = ByteArray::new(&first);
        let replay = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(replay.message().as_ref(), b"open");
        assert!(replay.retain());

        let second = receiver.try_recv().expect("then the suback");
        let mut ba = ByteArray::new(&second);
        let suback = SubscribeAckPacket::decode(&mut ba).unwrap();
        assert_eq!(suback.packet_id(), 5);
    }

    #[tokio::test]
    async fn test_will_promoted_on_abnormal_disconnect() {
        let broker = Broker::new(Config::default());
        let mut receiver = register_pipe(&broker, 2);
        broker
            .db
            .write()
            .unwrap()
            .insert("lastwill/+", 2, QoS::AtLeastOnce);

        let mut connect = ConnectPacket::new("alice");
        connect
            .set_will(
                "lastwill/alice",
                Bytes::from_static(b"bye"),
                QoS::AtLeastOnce,
                false,
            )
            .unwrap();
        let msg = WorkMessage {
            pipe: 1,
            cparam: Arc::new(ConnParam::new(&connect)),
            packet: Packet::Disconnect { send_will: true },
        };
        drive(&broker, msg).await;

        let frame = receiver.try_recv().expect("will should be published");
        let mut ba = ByteArray::new(&frame);
        let will = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(will.topic(), "lastwill/alice");
        assert_eq!(will.message().as_ref(), b"bye");
        assert_eq!(will.qos(), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_clean_disconnect_suppresses_will() {
        let broker = Broker::new(Config::default());
        let mut receiver = register_pipe(&broker, 2);
        broker
            .db
            .write()
            .unwrap()
            .insert("lastwill/+", 2, QoS::AtLeastOnce);

        let mut connect = ConnectPacket::new("alice");
        connect
            .set_will(
                "lastwill/alice",
                Bytes::from_static(b"bye"),
                QoS::AtLeastOnce,
                false,
            )
            .unwrap();
        let msg = WorkMessage {
            pipe: 1,
            cparam: Arc::new(ConnParam::new(&connect)),
            packet: Packet::Disconnect { send_will: false },
        };
        drive(&broker, msg).await;

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_event_tears_down_and_caches() {
        let broker = Broker::new(Config::default());
        let _receiver = register_pipe(&broker, 6);
        broker.db.write().unwrap().insert("news/#", 6, QoS::AtLeastOnce);
        broker
            .pipes
            .lock()
            .unwrap()
            .add_topic(6, "news/#", QoS::AtLeastOnce);

        let msg = WorkMessage {
            pipe: 6,
            cparam: Arc::new(ConnParam::new(
                ConnectPacket::new("alice").set_clean_session(false),
            )),
            packet: Packet::DisconnectEvent,
        };
        drive(&broker, msg).await;

        assert!(broker.db.read().unwrap().match_topic("news/x").is_empty());
        assert!(!broker.pipes.lock().unwrap().check_id(6));
        assert!(broker.session_present("alice"));
    }
}
