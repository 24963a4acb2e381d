// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Per-connection pipe task: packet framing, the CONNECT handshake,
//! protocol-layer acknowledgements, and the ordered outbound write path.
//!
//! One task per connection owns the socket and selects between inbound
//! bytes and the outbound channel the workers write into, so outbound
//! packets reach any single subscriber in the order the workers finished
//! them.

use bytes::Bytes;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
    PacketType, ProtocolLevel, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, RemainingLength, SubscribePacket,
    UnsubscribePacket,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

use crate::broker::pipes::PipeHandle;
use crate::broker::Broker;
use crate::commands::{Packet, WorkMessage};
use crate::conn_param::ConnParam;
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::types::PipeId;

const OUTBOUND_CAPACITY: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the read loop ended.
enum Close {
    /// Client sent DISCONNECT first; the will is discarded.
    Clean,

    /// Socket loss, keepalive expiry or protocol error.
    Abnormal,
}

/// Serve one accepted connection until it closes, then emit the
/// DISCONNECT/DISCONNECT_EV pair for the workers.
pub async fn run_pipe(broker: Arc<Broker>, stream: Stream, pipe: PipeId) {
    match serve(broker, stream, pipe).await {
        Ok(()) => log::debug!("pipe {pipe}: closed"),
        Err(err) => log::warn!("pipe {pipe}: {err}"),
    }
}

async fn serve(broker: Arc<Broker>, mut stream: Stream, pipe: PipeId) -> Result<(), Error> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);

    // The first packet must be a CONNECT, within a grace period.
    let frame = match tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut stream, &mut buf))
        .await
    {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(Error::new(
                ErrorKind::SocketError,
                "timed out waiting for CONNECT",
            ))
        }
    };
    let mut ba = ByteArray::new(&frame);
    let connect = match ConnectPacket::decode(&mut ba) {
        Ok(connect) => connect,
        Err(err) => {
            // Decode failure on CONNECT closes the pipe.
            return Err(Error::from_string(
                ErrorKind::DecodeError,
                format!("bad CONNECT: {err:?}"),
            ));
        }
    };
    if connect.protocol_level() == ProtocolLevel::V5 {
        check_connect_properties(&frame, broker.config.property_size)?;
    }

    // A zero-byte client id needs clean-session=1 [MQTT-3.1.3-8].
    if connect.client_id().is_empty() && !connect.connect_flags().clean_session {
        let mut out = Vec::new();
        ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected)
            .encode_with(connect.protocol_level(), &mut out)?;
        let _ = stream.write(&out).await;
        return Ok(());
    }

    if !broker.auth.check(connect.username(), connect.password()) {
        let code = if connect.username().is_empty() {
            ConnectReturnCode::NotAuthorized
        } else {
            ConnectReturnCode::BadUserNameOrPassword
        };
        let mut out = Vec::new();
        ConnectAckPacket::new(false, code).encode_with(connect.protocol_level(), &mut out)?;
        let _ = stream.write(&out).await;
        log::warn!("pipe {pipe}: CONNECT refused for {:?}", connect.client_id());
        return Ok(());
    }

    let cparam = Arc::new(ConnParam::new(&connect));
    let session_present =
        !cparam.clean_session() && broker.session_present(cparam.client_id());
    let level = cparam.protocol_level();

    // Register the outbound handle, then let a worker deliver the CONNACK
    // and the connect event.
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    broker.register_pipe(pipe, PipeHandle::new(out_tx, level));
    let inbound = broker.inbound_sender();
    let connack = ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted);
    inbound
        .send(WorkMessage {
            pipe,
            cparam: cparam.clone(),
            packet: Packet::Connack(connack),
        })
        .await?;

    let keepalive = Duration::from_secs(u64::from(cparam.keep_alive()));
    let mut last_read = Instant::now();
    let mut ticker = interval(if keepalive.is_zero() {
        Duration::from_secs(30)
    } else {
        keepalive / 2
    });

    // The client may have pipelined more packets behind the CONNECT.
    let early_close =
        drain_frames(&broker, &mut stream, &mut buf, pipe, &cparam, &inbound).await?;

    let close = if let Some(close) = early_close {
        close
    } else {
        loop {
            tokio::select! {
                read = stream.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break Close::Abnormal,
                        Ok(_) => {
                            last_read = Instant::now();
                            match drain_frames(&broker, &mut stream, &mut buf, pipe, &cparam, &inbound).await {
                                Ok(None) => {}
                                Ok(Some(close)) => break close,
                                Err(err) => {
                                    log::warn!("pipe {pipe}: {err}");
                                    break Close::Abnormal;
                                }
                            }
                        }
                        Err(err) => {
                            log::warn!("pipe {pipe}: read error: {err}");
                            break Close::Abnormal;
                        }
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(bytes) => {
                            if let Err(err) = stream.write(&bytes).await {
                                log::warn!("pipe {pipe}: write error: {err}");
                                break Close::Abnormal;
                            }
                        }
                        None => break Close::Abnormal,
                    }
                }
                _ = ticker.tick() => {
                    // A client must talk within 1.5x its keepalive [MQTT-3.1.2-24].
                    if !keepalive.is_zero() && last_read.elapsed() > keepalive * 3 / 2 {
                        log::info!("pipe {pipe}: keepalive expired");
                        break Close::Abnormal;
                    }
                }
            }
        }
    };

    let send_will = matches!(close, Close::Abnormal) && cparam.will();
    inbound
        .send(WorkMessage {
            pipe,
            cparam: cparam.clone(),
            packet: Packet::Disconnect { send_will },
        })
        .await?;
    inbound
        .send(WorkMessage {
            pipe,
            cparam,
            packet: Packet::DisconnectEvent,
        })
        .await?;
    Ok(())
}

/// Handle every complete frame sitting in `buf`. Returns the close reason
/// once the connection should end.
async fn drain_frames(
    broker: &Broker,
    stream: &mut Stream,
    buf: &mut Vec<u8>,
    pipe: PipeId,
    cparam: &Arc<ConnParam>,
    inbound: &mpsc::Sender<WorkMessage>,
) -> Result<Option<Close>, Error> {
    while let Some(frame) = extract_frame(buf)? {
        let level = cparam.protocol_level();
        let packet_type = match PacketType::try_from(frame[0]) {
            Ok(packet_type) => packet_type,
            Err(err) => {
                log::warn!("pipe {pipe}: unknown packet type: {err:?}");
                continue;
            }
        };

        let packet = match packet_type {
            PacketType::Connect => {
                // A second CONNECT is a protocol violation [MQTT-3.1.0-2].
                return Ok(Some(Close::Abnormal));
            }
            PacketType::Disconnect => return Ok(Some(Close::Clean)),
            PacketType::Publish { qos, .. } => {
                let mut ba = ByteArray::new(&frame);
                match PublishPacket::decode_with(&mut ba, level) {
                    Ok(publish) => {
                        // Protocol-layer acknowledgement of the inbound
                        // publish; the fan-out happens in the workers.
                        let mut out = Vec::new();
                        match qos {
                            QoS::AtMostOnce => {}
                            QoS::AtLeastOnce => {
                                PublishAckPacket::new(publish.packet_id()).encode(&mut out)?;
                            }
                            QoS::ExactOnce => {
                                PublishReceivedPacket::new(publish.packet_id())
                                    .encode(&mut out)?;
                            }
                        }
                        if !out.is_empty() {
                            stream.write(&out).await?;
                        }
                        Packet::Publish(publish)
                    }
                    Err(err) => {
                        // Includes wildcarded topics: dropped silently.
                        log::debug!("pipe {pipe}: bad PUBLISH dropped: {err:?}");
                        continue;
                    }
                }
            }
            PacketType::PublishRelease => {
                let mut ba = ByteArray::new(&frame);
                match PublishReleasePacket::decode(&mut ba) {
                    Ok(rel) => {
                        let mut out = Vec::new();
                        PublishCompletePacket::new(rel.packet_id()).encode(&mut out)?;
                        stream.write(&out).await?;
                        Packet::PubRel(rel)
                    }
                    Err(err) => {
                        log::debug!("pipe {pipe}: bad PUBREL dropped: {err:?}");
                        continue;
                    }
                }
            }
            PacketType::PublishAck => {
                let mut ba = ByteArray::new(&frame);
                match PublishAckPacket::decode(&mut ba) {
                    Ok(ack) => Packet::PubAck(ack),
                    Err(_) => continue,
                }
            }
            PacketType::PublishReceived => {
                let mut ba = ByteArray::new(&frame);
                match PublishReceivedPacket::decode(&mut ba) {
                    Ok(rec) => Packet::PubRec(rec),
                    Err(_) => continue,
                }
            }
            PacketType::PublishComplete => {
                let mut ba = ByteArray::new(&frame);
                match PublishCompletePacket::decode(&mut ba) {
                    Ok(comp) => Packet::PubComp(comp),
                    Err(_) => continue,
                }
            }
            PacketType::Subscribe => {
                let mut ba = ByteArray::new(&frame);
                match SubscribePacket::decode_with(&mut ba, level) {
                    Ok(subscribe) => Packet::Subscribe(subscribe),
                    Err(err) => {
                        // Malformed subscription tears the pipe down.
                        log::warn!("pipe {pipe}: bad SUBSCRIBE: {err:?}");
                        return Ok(Some(Close::Abnormal));
                    }
                }
            }
            PacketType::Unsubscribe => {
                let mut ba = ByteArray::new(&frame);
                match UnsubscribePacket::decode_with(&mut ba, level) {
                    Ok(unsubscribe) => Packet::Unsubscribe(unsubscribe),
                    Err(err) => {
                        log::warn!("pipe {pipe}: bad UNSUBSCRIBE: {err:?}");
                        return Ok(Some(Close::Abnormal));
                    }
                }
            }
            PacketType::PingRequest => Packet::PingReq,
            PacketType::ConnectAck
            | PacketType::SubscribeAck
            | PacketType::UnsubscribeAck
            | PacketType::PingResponse => {
                log::warn!("pipe {pipe}: server-side packet from client dropped");
                continue;
            }
        };

        inbound
            .send(WorkMessage {
                pipe,
                cparam: cparam.clone(),
                packet,
            })
            .await?;
    }
    Ok(None)
}

/// Read until one complete frame is buffered. `None` means the peer closed.
async fn read_frame(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
    loop {
        if let Some(frame) = extract_frame(buf)? {
            return Ok(Some(frame));
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// Pop one complete MQTT frame off the front of `buf`, if present.
///
/// # Errors
///
/// Returns error if the remaining-length prefix is malformed.
pub fn extract_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
    let Some(total) = frame_length(buf)? else {
        return Ok(None);
    };
    if buf.len() < total {
        return Ok(None);
    }
    let frame = buf.drain(..total).collect();
    Ok(Some(frame))
}

fn frame_length(buf: &[u8]) -> Result<Option<usize>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let mut ba = ByteArray::new(&buf[1..]);
    match RemainingLength::decode(&mut ba) {
        Ok(remaining) => Ok(Some(1 + ba.offset() + remaining.value() as usize)),
        // Up to 4 length bytes may simply not have arrived yet.
        Err(codec::DecodeError::OutOfRange) if buf.len() < 5 => Ok(None),
        Err(err) => Err(Error::from_string(
            ErrorKind::DecodeError,
            format!("bad remaining length: {err:?}"),
        )),
    }
}

/// Bound the v5 property block of a CONNECT frame by `property_size`.
fn check_connect_properties(frame: &[u8], property_size: usize) -> Result<(), Error> {
    let mut ba = ByteArray::new(frame);
    let err = |detail: &str| {
        Error::from_string(
            ErrorKind::DecodeError,
            format!("bad CONNECT properties: {detail}"),
        )
    };
    ba.read_byte().map_err(|_| err("header"))?;
    RemainingLength::decode(&mut ba).map_err(|_| err("length"))?;
    // Protocol name, level, flags, keepalive.
    ba.read_string().map_err(|_| err("name"))?;
    ba.read_bytes(4).map_err(|_| err("flags"))?;
    let props = RemainingLength::decode(&mut ba).map_err(|_| err("properties"))?;
    if props.value() as usize > property_size {
        return Err(Error::from_string(
            ErrorKind::DecodeError,
            format!(
                "CONNECT properties of {} bytes exceed limit {property_size}",
                props.value()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_frame_partial() {
        // PINGREQ arriving byte by byte.
        let mut buf = vec![0xc0];
        assert!(extract_frame(&mut buf).unwrap().is_none());
        buf.push(0x00);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), vec![0xc0, 0x00]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_two_frames() {
        let mut buf = vec![0xc0, 0x00, 0xe0, 0x00, 0x30];
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), vec![0xc0, 0x00]);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), vec![0xe0, 0x00]);
        // Trailing partial frame stays buffered.
        assert!(extract_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf, vec![0x30]);
    }

    #[test]
    fn test_extract_frame_waits_for_body() {
        let mut buf = vec![0x30, 0x04, 0x00];
        assert!(extract_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0x01, b'a', b'x']);
        let frame = extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 6);
    }

    #[test]
    fn test_frame_length_malformed() {
        // A fifth continuation byte is invalid.
        let mut buf = vec![0x30, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(extract_frame(&mut buf).is_err());
    }

    #[test]
    fn test_check_connect_properties() {
        let mut frame = Vec::new();
        let mut connect = ConnectPacket::new("v5-client");
        connect.set_protocol_level(ProtocolLevel::V5);
        connect.encode(&mut frame).unwrap();
        assert!(check_connect_properties(&frame, 32).is_ok());
        // An empty property block still has a length byte.
        assert!(check_connect_properties(&frame, 0).is_ok());
    }
}
