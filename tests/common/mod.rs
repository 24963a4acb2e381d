// Copyright (c) 2022 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Test helpers: an in-process broker and a minimal blocking MQTT client
//! speaking through the codec.

#![allow(dead_code)]

use bytes::Bytes;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, DisconnectPacket,
    EncodePacket, PacketType, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, SubscribeAckPacket, SubscribePacket,
    SubscribeTopic, UnsubscribePacket,
};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use nanomq::config::Config;
use nanomq::pipe::extract_frame;
use nanomq::server;

pub const READ_TIMEOUT: Duration = Duration::from_millis(3000);
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(700);

/// Start a broker for the given config on a background thread and wait for
/// its listener to accept connections.
pub fn start_broker(config: Config) -> String {
    let address = config
        .url
        .strip_prefix("broker+tcp://")
        .expect("test config needs a tcp url")
        .to_string();
    std::thread::spawn(move || {
        if let Err(err) = server::broker(config) {
            eprintln!("test broker exited: {err}");
        }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(&address) {
            Ok(_probe) => return address,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("broker at {address} did not come up: {err}"),
        }
    }
}

pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.url = format!("broker+tcp://127.0.0.1:{port}");
    config.parallel = 4;
    config.log.console = false;
    config.log.file = format!("/tmp/nanomq-tests/nanomq-{port}.log").into();
    config
}

/// A blocking MQTT v3.1.1 client for driving the broker in tests.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
    inbox: VecDeque<PublishPacket>,
    next_packet_id: u16,
}

impl Client {
    /// Connect with clean-session=true and no will.
    pub fn connect(address: &str, client_id: &str) -> Self {
        Self::connect_with(address, ConnectPacket::new(client_id)).0
    }

    pub fn connect_with(address: &str, packet: ConnectPacket) -> (Self, ConnectAckPacket) {
        let stream = TcpStream::connect(address).expect("connect to test broker");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set read timeout");
        let mut client = Self {
            stream,
            buf: Vec::new(),
            inbox: VecDeque::new(),
            next_packet_id: 1,
        };
        client.send(&packet);
        let frame = client
            .read_frame(READ_TIMEOUT)
            .expect("CONNACK expected");
        let mut ba = ByteArray::new(&frame);
        let connack = ConnectAckPacket::decode(&mut ba).expect("decode CONNACK");
        assert_eq!(connack.return_code(), ConnectReturnCode::Accepted);
        (client, connack)
    }

    fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut out = Vec::new();
        packet.encode(&mut out).expect("encode packet");
        self.stream.write_all(&out).expect("write packet");
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    fn read_frame(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = extract_frame(&mut self.buf).expect("well-formed frame") {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            let mut chunk = [0_u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return None;
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
    }

    /// Handle one inbound frame; publishes land in the inbox, QoS
    /// handshakes are answered.
    fn absorb(&mut self, frame: &[u8]) -> Option<PublishPacket> {
        let packet_type = PacketType::try_from(frame[0]).expect("known packet type");
        match packet_type {
            PacketType::Publish { qos, .. } => {
                let mut ba = ByteArray::new(frame);
                let publish = PublishPacket::decode(&mut ba).expect("decode PUBLISH");
                match qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => {
                        self.send(&PublishAckPacket::new(publish.packet_id()));
                    }
                    QoS::ExactOnce => {
                        self.send(&PublishReceivedPacket::new(publish.packet_id()));
                    }
                }
                Some(publish)
            }
            PacketType::PublishRelease => {
                let mut ba = ByteArray::new(frame);
                let rel = PublishReleasePacket::decode(&mut ba).expect("decode PUBREL");
                self.send(&PublishCompletePacket::new(rel.packet_id()));
                None
            }
            _ => None,
        }
    }

    /// Subscribe and wait for the SUBACK. Retained replays delivered before
    /// it are queued in the inbox.
    pub fn subscribe(&mut self, filters: &[(&str, QoS)]) -> SubscribeAckPacket {
        let topics = filters
            .iter()
            .map(|(filter, qos)| SubscribeTopic::new(filter, *qos).expect("valid filter"))
            .collect();
        let packet_id = self.take_packet_id();
        self.send(&SubscribePacket::new(packet_id, topics));

        let deadline = Instant::now() + READ_TIMEOUT;
        while Instant::now() < deadline {
            let Some(frame) = self.read_frame(READ_TIMEOUT) else {
                break;
            };
            if PacketType::try_from(frame[0]) == Ok(PacketType::SubscribeAck) {
                let mut ba = ByteArray::new(&frame);
                let suback = SubscribeAckPacket::decode(&mut ba).expect("decode SUBACK");
                assert_eq!(suback.packet_id(), packet_id);
                return suback;
            }
            if let Some(publish) = self.absorb(&frame) {
                self.inbox.push_back(publish);
            }
        }
        panic!("no SUBACK arrived");
    }

    pub fn unsubscribe(&mut self, filters: &[&str]) {
        let topics = filters
            .iter()
            .map(|filter| codec::SubTopic::new(filter).expect("valid filter"))
            .collect();
        let packet_id = self.take_packet_id();
        self.send(&UnsubscribePacket::new(packet_id, topics));

        while let Some(frame) = self.read_frame(READ_TIMEOUT) {
            if PacketType::try_from(frame[0]) == Ok(PacketType::UnsubscribeAck) {
                return;
            }
            if let Some(publish) = self.absorb(&frame) {
                self.inbox.push_back(publish);
            }
        }
        panic!("no UNSUBACK arrived");
    }

    pub fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) {
        let mut packet =
            PublishPacket::new(topic, qos, Bytes::copy_from_slice(payload)).expect("valid topic");
        packet.set_retain(retain);
        if qos != QoS::AtMostOnce {
            let packet_id = self.take_packet_id();
            packet.set_packet_id(packet_id);
        }
        self.send(&packet);
        // Wait for the broker-side acknowledgement so ordering is stable.
        if qos != QoS::AtMostOnce {
            while let Some(frame) = self.read_frame(READ_TIMEOUT) {
                match PacketType::try_from(frame[0]) {
                    Ok(PacketType::PublishAck | PacketType::PublishReceived) => break,
                    _ => {
                        if let Some(publish) = self.absorb(&frame) {
                            self.inbox.push_back(publish);
                        }
                    }
                }
            }
        }
    }

    /// Next PUBLISH delivered to this client, waiting up to `timeout`.
    pub fn recv_publish(&mut self, timeout: Duration) -> Option<PublishPacket> {
        if let Some(publish) = self.inbox.pop_front() {
            return Some(publish);
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some(frame) = self.read_frame(timeout) else {
                return None;
            };
            if let Some(publish) = self.absorb(&frame) {
                return Some(publish);
            }
        }
        None
    }

    /// Assert nothing is delivered within the quiet window.
    pub fn expect_silence(&mut self) {
        if let Some(publish) = self.recv_publish(QUIET_TIMEOUT) {
            panic!(
                "unexpected publish on {} with {:?}",
                publish.topic(),
                publish.message()
            );
        }
    }

    /// Clean shutdown; the will is discarded.
    pub fn disconnect(mut self) {
        self.send(&DisconnectPacket::new());
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Abnormal shutdown; the broker sees a socket loss and the will fires.
    pub fn drop_abnormally(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
