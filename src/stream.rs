// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::error::Error;

/// Each Stream represents a duplex socket connection to a client.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Ws(Box<WebSocketStream<TcpStream>>),
}

impl Stream {
    /// Read whatever is available into `buf`. Returns 0 on a closed peer.
    ///
    /// # Errors
    ///
    /// Returns error if the socket gets an error.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => match ws_stream.next().await {
                Some(msg) => {
                    let data = msg?.into_data();
                    let data_len = data.len();
                    buf.extend(data);
                    Ok(data_len)
                }
                None => Ok(0),
            },
        }
    }

    /// Write the whole buffer to the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the socket gets an error.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => {
                tcp_stream.write_all(buf).await?;
                Ok(buf.len())
            }
            Self::Ws(ws_stream) => {
                let msg = Message::binary(buf.to_vec());
                ws_stream.send(msg).await?;
                Ok(buf.len())
            }
        }
    }
}
