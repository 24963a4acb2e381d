// Copyright (c) 2022 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Bridge client: one session to an upstream broker.
//!
//! Locally published messages matching a configured forward filter are
//! re-published upstream; messages the upstream delivers for the configured
//! subscription list are injected into the bridge ingress channel, where
//! BRIDGE workers re-enter the standard RECV path with them.

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
    PacketType, ProtocolLevel, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, SubscribePacket, SubscribeTopic,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::broker::Broker;
use crate::commands::{Packet, WorkMessage};
use crate::config::Bridge;
use crate::conn_param::ConnParam;
use crate::error::{Error, ErrorKind};
use crate::pipe::extract_frame;
use crate::stream::Stream;

const EGRESS_CAPACITY: usize = 64;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect the upstream session, issue the configured subscriptions and
/// spawn its serve task. Called once at broker start when bridge mode is on.
///
/// # Errors
///
/// Returns error if the upstream broker is unreachable or refuses the
/// session.
pub async fn start(broker: Arc<Broker>) -> Result<(), Error> {
    let session = BridgeSession::connect(&broker.config.bridge).await?;
    let (egress_tx, egress_rx) = mpsc::channel(EGRESS_CAPACITY);
    broker.set_bridge_egress(egress_tx);
    tokio::spawn(session.run_loop(broker, egress_rx));
    Ok(())
}

struct BridgeSession {
    stream: Stream,
    level: ProtocolLevel,
    keepalive: Duration,
    cparam: Arc<ConnParam>,
    next_packet_id: u16,
}

impl BridgeSession {
    async fn connect(config: &Bridge) -> Result<Self, Error> {
        let level = match config.proto_ver {
            3 => ProtocolLevel::V31,
            5 => ProtocolLevel::V5,
            _ => ProtocolLevel::V311,
        };
        let client_id = if config.clientid.is_empty() {
            codec::utils::random_client_id("nanomq-bridge-")
        } else {
            config.clientid.clone()
        };

        let mut connect = ConnectPacket::new(&client_id);
        connect
            .set_protocol_level(level)
            .set_clean_session(config.clean_start)
            .set_keep_alive(config.keepalive);
        if !config.username.is_empty() {
            connect.set_credentials(&config.username, config.password.as_bytes());
        }

        log::info!("bridge: connecting to {}", config.address);
        let tcp_stream = TcpStream::connect(config.host_port()).await?;
        let mut stream = Stream::Mqtt(tcp_stream);

        let mut buf = Vec::new();
        connect.encode(&mut buf)?;
        stream.write(&buf).await?;

        // Wait for the CONNACK before anything else goes out.
        let mut inbuf = Vec::with_capacity(512);
        let frame = tokio::time::timeout(CONNACK_TIMEOUT, async {
            loop {
                if let Some(frame) = extract_frame(&mut inbuf)? {
                    return Ok::<Vec<u8>, Error>(frame);
                }
                if stream.read_buf(&mut inbuf).await? == 0 {
                    return Err(Error::new(
                        ErrorKind::SocketError,
                        "bridge: upstream closed before CONNACK",
                    ));
                }
            }
        })
        .await
        .map_err(|_| Error::new(ErrorKind::SocketError, "bridge: CONNACK timed out"))??;

        let mut ba = ByteArray::new(&frame);
        let connack = ConnectAckPacket::decode(&mut ba)?;
        if connack.return_code() != ConnectReturnCode::Accepted {
            return Err(Error::from_string(
                ErrorKind::SocketError,
                format!("bridge: CONNECT refused: {:?}", connack.return_code()),
            ));
        }

        let mut session = Self {
            stream,
            level,
            keepalive: Duration::from_secs(u64::from(config.keepalive)),
            cparam: Arc::new(ConnParam::new(&connect)),
            next_packet_id: 1,
        };

        // Subscription list goes out at connection time.
        if !config.sub_list.is_empty() {
            let topics = config
                .sub_list
                .iter()
                .filter_map(|sub| SubscribeTopic::new(&sub.topic, sub.qos).ok())
                .collect::<Vec<_>>();
            let packet_id = session.take_packet_id();
            let subscribe = SubscribePacket::new(packet_id, topics);
            let mut out = Vec::new();
            subscribe.encode_with(level, &mut out)?;
            session.stream.write(&out).await?;
        }
        log::info!("bridge: connected as {client_id}");
        Ok(session)
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    async fn run_loop(mut self, broker: Arc<Broker>, mut egress_rx: mpsc::Receiver<PublishPacket>) {
        let ingress = broker.bridge_ingress_sender();
        let mut buf: Vec<u8> = Vec::with_capacity(512);
        let mut ticker = interval(if self.keepalive.is_zero() {
            Duration::from_secs(30)
        } else {
            self.keepalive / 2
        });

        loop {
            tokio::select! {
                read = self.stream.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            log::error!("bridge: upstream connection lost");
                            break;
                        }
                        Ok(_) => {
                            if let Err(err) = self.drain_upstream(&mut buf, &ingress).await {
                                log::error!("bridge: {err}");
                                break;
                            }
                        }
                        Err(err) => {
                            log::error!("bridge: read error: {err}");
                            break;
                        }
                    }
                }
                forwarded = egress_rx.recv() => {
                    match forwarded {
                        Some(packet) => {
                            if let Err(err) = self.publish_upstream(packet).await {
                                log::error!("bridge: forward failed: {err}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let mut out = Vec::new();
                    if codec::PingRequestPacket::new().encode(&mut out).is_ok() {
                        if let Err(err) = self.stream.write(&out).await {
                            log::error!("bridge: ping failed: {err}");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Re-publish a locally matched message upstream, payload, dup, qos and
    /// retain preserved.
    async fn publish_upstream(&mut self, mut packet: PublishPacket) -> Result<(), Error> {
        if packet.qos() != QoS::AtMostOnce {
            let packet_id = self.take_packet_id();
            packet.set_packet_id(packet_id);
        }
        let mut out = Vec::new();
        packet.encode_with(self.level, &mut out)?;
        self.stream.write(&out).await?;
        Ok(())
    }

    async fn drain_upstream(
        &mut self,
        buf: &mut Vec<u8>,
        ingress: &mpsc::Sender<WorkMessage>,
    ) -> Result<(), Error> {
        while let Some(frame) = extract_frame(buf)? {
            let Ok(packet_type) = PacketType::try_from(frame[0]) else {
                continue;
            };
            match packet_type {
                PacketType::Publish { qos, .. } => {
                    let mut ba = ByteArray::new(&frame);
                    let Ok(publish) = PublishPacket::decode_with(&mut ba, self.level) else {
                        log::warn!("bridge: bad upstream PUBLISH dropped");
                        continue;
                    };
                    let mut out = Vec::new();
                    match qos {
                        QoS::AtMostOnce => {}
                        QoS::AtLeastOnce => {
                            PublishAckPacket::new(publish.packet_id()).encode(&mut out)?;
                        }
                        QoS::ExactOnce => {
                            PublishReceivedPacket::new(publish.packet_id()).encode(&mut out)?;
                        }
                    }
                    if !out.is_empty() {
                        self.stream.write(&out).await?;
                    }
                    // Tag with its MQTT type and let a BRIDGE worker re-run
                    // the local RECV logic.
                    ingress
                        .send(WorkMessage {
                            pipe: 0,
                            cparam: self.cparam.clone(),
                            packet: Packet::Publish(publish),
                        })
                        .await?;
                }
                PacketType::PublishRelease => {
                    let mut ba = ByteArray::new(&frame);
                    if let Ok(rel) = PublishReleasePacket::decode(&mut ba) {
                        let mut out = Vec::new();
                        PublishCompletePacket::new(rel.packet_id()).encode(&mut out)?;
                        self.stream.write(&out).await?;
                    }
                }
                PacketType::PublishReceived => {
                    let mut ba = ByteArray::new(&frame);
                    if let Ok(rec) = PublishReceivedPacket::decode(&mut ba) {
                        let mut out = Vec::new();
                        PublishReleasePacket::new(rec.packet_id()).encode(&mut out)?;
                        self.stream.write(&out).await?;
                    }
                }
                PacketType::ConnectAck
                | PacketType::PublishAck
                | PacketType::PublishComplete
                | PacketType::SubscribeAck
                | PacketType::UnsubscribeAck
                | PacketType::PingResponse => {}
                other => {
                    log::warn!("bridge: unexpected upstream packet {other:?}");
                }
            }
        }
        Ok(())
    }
}
