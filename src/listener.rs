// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Listener sockets: `broker+tcp://` and `nmq+ws://` urls, accept loops and
//! pipe allocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::broker::Broker;
use crate::config::{TCP_URL_PREFIX, WS_URL_PREFIX};
use crate::error::{Error, ErrorKind};
use crate::pipe;
use crate::stream::Stream;

/// Each Listener binds one server socket.
#[derive(Debug)]
pub struct Listener {
    protocol: Protocol,
    broker: Arc<Broker>,

    /// Shared pipe-id allocator; ids are unique across listeners.
    next_pipe: Arc<AtomicU32>,
}

#[derive(Debug)]
enum Protocol {
    Mqtt(TcpListener),
    Ws(TcpListener, String),
}

/// Split `broker+tcp://host:port` into its bind address.
///
/// # Errors
///
/// Returns error if the url scheme is not recognized.
pub fn parse_tcp_url(url: &str) -> Result<&str, Error> {
    url.strip_prefix(TCP_URL_PREFIX).ok_or_else(|| {
        Error::from_string(
            ErrorKind::ConfigError,
            format!("expected {TCP_URL_PREFIX}host:port, got {url}"),
        )
    })
}

/// Split `nmq+ws://host:port/path` into bind address and path.
///
/// # Errors
///
/// Returns error if the url scheme is not recognized.
pub fn parse_ws_url(url: &str) -> Result<(&str, &str), Error> {
    let rest = url.strip_prefix(WS_URL_PREFIX).ok_or_else(|| {
        Error::from_string(
            ErrorKind::ConfigError,
            format!("expected {WS_URL_PREFIX}host:port/path, got {url}"),
        )
    })?;
    Ok(match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    })
}

impl Listener {
    /// Bind a tcp listener socket.
    ///
    /// # Errors
    ///
    /// Returns error if the url is invalid or the address cannot be bound.
    pub async fn bind_tcp(
        broker: Arc<Broker>,
        url: &str,
        next_pipe: Arc<AtomicU32>,
    ) -> Result<Self, Error> {
        let address = parse_tcp_url(url)?;
        log::info!("bind {url}");
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            protocol: Protocol::Mqtt(listener),
            broker,
            next_pipe,
        })
    }

    /// Bind a websocket listener socket.
    ///
    /// # Errors
    ///
    /// Returns error if the url is invalid or the address cannot be bound.
    pub async fn bind_ws(
        broker: Arc<Broker>,
        url: &str,
        next_pipe: Arc<AtomicU32>,
    ) -> Result<Self, Error> {
        let (address, path) = parse_ws_url(url)?;
        log::info!("bind {url}");
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            protocol: Protocol::Ws(listener, path.to_string()),
            broker,
            next_pipe,
        })
    }

    pub async fn run_loop(self) {
        match self.protocol {
            Protocol::Mqtt(listener) => loop {
                match listener.accept().await {
                    Ok((tcp_stream, address)) => {
                        let pipe = self.next_pipe.fetch_add(1, Ordering::Relaxed);
                        log::debug!("accepted {address} as pipe {pipe}");
                        tokio::spawn(pipe::run_pipe(
                            self.broker.clone(),
                            Stream::Mqtt(tcp_stream),
                            pipe,
                        ));
                    }
                    Err(err) => log::error!("accept failed: {err}"),
                }
            },
            Protocol::Ws(listener, path) => loop {
                match listener.accept().await {
                    Ok((tcp_stream, address)) => {
                        let pipe = self.next_pipe.fetch_add(1, Ordering::Relaxed);
                        log::debug!("accepted ws {address} as pipe {pipe}");
                        let broker = self.broker.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            match accept_ws(tcp_stream, &path).await {
                                Ok(ws_stream) => {
                                    pipe::run_pipe(broker, ws_stream, pipe).await;
                                }
                                Err(err) => log::warn!("ws handshake failed: {err}"),
                            }
                        });
                    }
                    Err(err) => log::error!("accept failed: {err}"),
                }
            },
        }
    }
}

async fn accept_ws(tcp_stream: TcpStream, path: &str) -> Result<Stream, Error> {
    let expected = path.to_string();
    let callback = move |request: &Request, response: Response| {
        if request.uri().path() == expected {
            Ok(response)
        } else {
            Err(ErrorResponse::new(Some("bad path".to_string())))
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(tcp_stream, callback).await?;
    Ok(Stream::Ws(Box::new(ws_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_url() {
        assert_eq!(
            parse_tcp_url("broker+tcp://0.0.0.0:1883").unwrap(),
            "0.0.0.0:1883"
        );
        assert!(parse_tcp_url("tcp://0.0.0.0:1883").is_err());
    }

    #[test]
    fn test_parse_ws_url() {
        assert_eq!(
            parse_ws_url("nmq+ws://0.0.0.0:8083/mqtt").unwrap(),
            ("0.0.0.0:8083", "/mqtt")
        );
        assert_eq!(parse_ws_url("nmq+ws://0.0.0.0:8083").unwrap(), ("0.0.0.0:8083", "/"));
        assert!(parse_ws_url("ws://0.0.0.0:8083/mqtt").is_err());
    }
}
