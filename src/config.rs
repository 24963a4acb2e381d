// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

pub const PID_PATH_NAME: &str = "/tmp/nanomq/nanomq.pid";
pub const CONF_PATH_NAME: &str = "/etc/nanomq.conf";
pub const CONF_AUTH_PATH_NAME: &str = "/etc/nanomq_auth_username.conf";
pub const CONF_BRIDGE_PATH_NAME: &str = "/etc/nanomq_bridge.conf";

pub const CONF_TCP_URL_DEFAULT: &str = "broker+tcp://0.0.0.0:1883";
pub const CONF_WS_URL_DEFAULT: &str = "nmq+ws://0.0.0.0:8083/mqtt";

pub const TCP_URL_PREFIX: &str = "broker+tcp://";
pub const WS_URL_PREFIX: &str = "nmq+ws://";

/// Server main config.
///
/// Parsed from the main config file, then overridden by command line
/// options; handed to `broker()` as an immutable value.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener url, `broker+tcp://host:port`.
    #[serde(default = "Config::default_url")]
    pub url: String,

    /// Number of task-queue threads used by the runtime. 0 picks a value
    /// based on the host.
    #[serde(default)]
    pub num_taskq_thread: u16,

    /// Upper bound of blocking task-queue threads.
    #[serde(default)]
    pub max_taskq_thread: u16,

    /// The maximum number of outstanding requests we can handle. This is
    /// *NOT* the number of threads in use, but instead represents
    /// outstanding work items.
    #[serde(default = "Config::default_parallel")]
    pub parallel: u32,

    /// Max size in bytes for a MQTT v5 user property block.
    #[serde(default = "Config::default_property_size")]
    pub property_size: usize,

    /// Queue length for resending unacknowledged QoS messages.
    #[serde(default = "Config::default_msq_len")]
    pub msq_len: usize,

    /// Interval of the QoS resend timer in seconds.
    #[serde(default = "Config::default_qos_duration")]
    pub qos_duration: u64,

    /// Upper bound of cached sessions kept for clean-session=false clients.
    #[serde(default = "Config::default_cache_cap")]
    pub cache_cap: usize,

    /// Accept CONNECT packets carrying no credentials.
    #[serde(default = "Config::default_allow_anonymous")]
    pub allow_anonymous: bool,

    /// Run as a daemon process.
    #[serde(default)]
    pub daemon: bool,

    #[serde(default)]
    pub websocket: Websocket,

    #[serde(default)]
    pub http_server: HttpServer,

    #[serde(default)]
    pub log: Log,

    /// Filled from the bridge config file, not the main one.
    #[serde(skip)]
    pub bridge: Bridge,

    /// Filled from the auth config file, not the main one.
    #[serde(skip)]
    pub auths: Vec<AuthEntry>,
}

impl Config {
    fn default_url() -> String {
        CONF_TCP_URL_DEFAULT.to_string()
    }

    const fn default_parallel() -> u32 {
        32
    }

    const fn default_property_size() -> usize {
        32
    }

    const fn default_msq_len() -> usize {
        64
    }

    const fn default_qos_duration() -> u64 {
        10
    }

    const fn default_cache_cap() -> usize {
        1024
    }

    const fn default_allow_anonymous() -> bool {
        true
    }

    /// Read the main config file.
    ///
    /// # Errors
    ///
    /// Returns error if `path` is unreadable or not valid toml.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read the bridge config file into `self.bridge`.
    ///
    /// # Errors
    ///
    /// Returns error if `path` is unreadable or not valid toml.
    pub fn load_bridge<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        #[derive(Deserialize)]
        struct BridgeFile {
            bridge: Bridge,
        }
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: BridgeFile = toml::from_str(&content)?;
        self.bridge = file.bridge;
        Ok(())
    }

    /// Read the auth config file into `self.auths`.
    ///
    /// # Errors
    ///
    /// Returns error if `path` is unreadable or not valid toml.
    pub fn load_auth<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        #[derive(Deserialize)]
        struct AuthFile {
            auth: Vec<AuthEntry>,
        }
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: AuthFile = toml::from_str(&content)?;
        self.auths = file.auth;
        Ok(())
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.url.starts_with(TCP_URL_PREFIX) {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("url must start with {TCP_URL_PREFIX}, got {}", self.url),
            ));
        }
        if self.parallel == 0 {
            return Err(Error::new(ErrorKind::ConfigError, "parallel must be > 0"));
        }
        if self.num_taskq_thread > 255 || self.max_taskq_thread > 255 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "taskq thread count must be in 1..=255",
            ));
        }
        if self.websocket.enable && !self.websocket.url.starts_with(WS_URL_PREFIX) {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "websocket url must start with {WS_URL_PREFIX}, got {}",
                    self.websocket.url
                ),
            ));
        }
        self.bridge.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            num_taskq_thread: 0,
            max_taskq_thread: 0,
            parallel: Self::default_parallel(),
            property_size: Self::default_property_size(),
            msq_len: Self::default_msq_len(),
            qos_duration: Self::default_qos_duration(),
            cache_cap: Self::default_cache_cap(),
            allow_anonymous: Self::default_allow_anonymous(),
            daemon: false,
            websocket: Websocket::default(),
            http_server: HttpServer::default(),
            log: Log::default(),
            bridge: Bridge::default(),
            auths: Vec::new(),
        }
    }
}

/// WebSocket listener section.
#[derive(Debug, Clone, Deserialize)]
pub struct Websocket {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "Websocket::default_url")]
    pub url: String,
}

impl Websocket {
    fn default_url() -> String {
        CONF_WS_URL_DEFAULT.to_string()
    }
}

impl Default for Websocket {
    fn default() -> Self {
        Self {
            enable: false,
            url: Self::default_url(),
        }
    }
}

/// Admin HTTP server section. Parsed and carried for the outer binary; the
/// core itself never starts it.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServer {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "HttpServer::default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl HttpServer {
    const fn default_port() -> u16 {
        8081
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self {
            enable: false,
            port: Self::default_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Log section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Also log to stderr.
    #[serde(default = "Log::default_console")]
    pub console: bool,

    #[serde(default)]
    pub level: LogLevel,

    /// Rolling log file path.
    #[serde(default = "Log::default_file")]
    pub file: PathBuf,
}

impl Log {
    const fn default_console() -> bool {
        true
    }

    fn default_file() -> PathBuf {
        PathBuf::from("/tmp/nanomq/nanomq.log")
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console: Self::default_console(),
            level: LogLevel::default(),
            file: Self::default_file(),
        }
    }
}

/// One topic/qos pair the bridge subscribes upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSub {
    pub topic: String,

    #[serde(default)]
    pub qos: QoS,
}

/// Bridge section, from the bridge config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    #[serde(default)]
    pub bridge_mode: bool,

    /// Upstream address, `mqtt-tcp://host:port`.
    #[serde(default)]
    pub address: String,

    /// MQTT version spoken upstream, 4 or 5.
    #[serde(default = "Bridge::default_proto_ver")]
    pub proto_ver: u8,

    /// Client id presented upstream. A random one is generated if empty.
    #[serde(default)]
    pub clientid: String,

    #[serde(default = "Bridge::default_clean_start")]
    pub clean_start: bool,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "Bridge::default_keepalive")]
    pub keepalive: u16,

    /// Local topic filters forwarded upstream.
    #[serde(default)]
    pub forwards: Vec<String>,

    /// Upstream subscriptions injected back into the local broker.
    #[serde(default)]
    pub sub_list: Vec<BridgeSub>,

    /// Number of bridge work items.
    #[serde(default = "Bridge::default_parallel")]
    pub parallel: u32,
}

impl Bridge {
    const fn default_proto_ver() -> u8 {
        4
    }

    const fn default_clean_start() -> bool {
        true
    }

    const fn default_keepalive() -> u16 {
        60
    }

    const fn default_parallel() -> u32 {
        2
    }

    /// # Errors
    ///
    /// Returns error if bridge mode is on with an unusable address or
    /// filters.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.bridge_mode {
            return Ok(());
        }
        if self.parallel == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "bridge parallel must be > 0",
            ));
        }
        if !self.address.starts_with("mqtt-tcp://") && !self.address.starts_with("tcp://") {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("bridge address must be mqtt-tcp://host:port, got {}", self.address),
            ));
        }
        for filter in &self.forwards {
            codec::topic::validate_sub_topic(filter).map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("bad bridge forward filter {filter}: {err:?}"),
                )
            })?;
        }
        for sub in &self.sub_list {
            codec::topic::validate_sub_topic(&sub.topic).map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("bad bridge subscription {}: {err:?}", sub.topic),
                )
            })?;
        }
        Ok(())
    }

    /// Host:port part of the upstream address.
    #[must_use]
    pub fn host_port(&self) -> &str {
        self.address
            .trim_start_matches("mqtt-tcp://")
            .trim_start_matches("tcp://")
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self {
            bridge_mode: false,
            address: String::new(),
            proto_ver: Self::default_proto_ver(),
            clientid: String::new(),
            clean_start: Self::default_clean_start(),
            username: String::new(),
            password: String::new(),
            keepalive: Self::default_keepalive(),
            forwards: Vec::new(),
            sub_list: Vec::new(),
            parallel: Self::default_parallel(),
        }
    }
}

/// One username/password pair from the auth config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthEntry {
    pub username: String,
    pub password: String,
}
