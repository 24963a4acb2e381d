// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! Broker entry point and the start/stop/restart command line surface.

use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::bridge;
use crate::broker::worker::Work;
use crate::broker::Broker;
use crate::config::{self, Config};
use crate::error::{Error, ErrorKind};
use crate::listener::Listener;
use crate::log::init_log;
use crate::process;
use crate::types::Proto;

/// Run the broker core with an immutable config. Builds the runtime
/// according to the task-queue settings and blocks until shutdown.
///
/// # Errors
///
/// Returns error on bind or fatal I/O failures.
pub fn broker(config: Config) -> Result<(), Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.num_taskq_thread > 0 {
        builder.worker_threads(usize::from(config.num_taskq_thread));
    }
    if config.max_taskq_thread > 0 {
        builder.max_blocking_threads(usize::from(config.max_taskq_thread));
    }
    let runtime = builder.build()?;
    runtime.block_on(run_broker(config))
}

async fn run_broker(config: Config) -> Result<(), Error> {
    let broker = Broker::new(config);

    if broker.config.bridge.bridge_mode {
        bridge::start(broker.clone()).await?;
    }

    // The worker pool: `parallel` broker work items, plus the bridge ones.
    let parallel = broker.config.parallel;
    for id in 0..parallel {
        tokio::spawn(Work::new(id, Proto::Broker, broker.clone()).run());
    }
    if broker.config.bridge.bridge_mode {
        for id in parallel..parallel + broker.config.bridge.parallel {
            tokio::spawn(Work::new(id, Proto::Bridge, broker.clone()).run());
        }
    }

    tokio::spawn(resend_timer(broker.clone()));

    let next_pipe = Arc::new(AtomicU32::new(1));
    let tcp_listener =
        Listener::bind_tcp(broker.clone(), &broker.config.url, next_pipe.clone()).await?;
    let mut handles = vec![tokio::spawn(tcp_listener.run_loop())];
    if broker.config.websocket.enable {
        let ws_listener =
            Listener::bind_ws(broker.clone(), &broker.config.websocket.url, next_pipe).await?;
        handles.push(tokio::spawn(ws_listener.run_loop()));
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Rescan outstanding QoS>=1 messages every `qos_duration` seconds and
/// retransmit through the per-pipe writer channels.
async fn resend_timer(broker: Arc<Broker>) {
    let mut ticker = interval(Duration::from_secs(broker.config.qos_duration.max(1)));
    loop {
        ticker.tick().await;
        let pending = broker.resend.lock().unwrap().pending();
        for (pipe, buf) in pending {
            if let Some(handle) = broker.pipe_handle(pipe) {
                let _ = handle.sender().send(Bytes::from(buf)).await;
            }
        }
    }
}

fn start_args() -> Vec<Arg> {
    vec![
        Arg::new("url")
            .long("url")
            .value_name("URL")
            .help("The format of 'broker+tcp://ip_addr:port' for TCP and 'nmq+ws://ip_addr:port' for WebSocket"),
        Arg::new("conf")
            .long("conf")
            .value_name("PATH")
            .help("The path of a specified nanomq configuration file"),
        Arg::new("bridge")
            .long("bridge")
            .value_name("PATH")
            .help("The path of a specified bridge configuration file"),
        Arg::new("auth")
            .long("auth")
            .value_name("PATH")
            .help("The path of a specified authorize configuration file"),
        Arg::new("daemon")
            .short('d')
            .long("daemon")
            .action(ArgAction::SetTrue)
            .help("Run nanomq as daemon (default: false)"),
        Arg::new("tq_thread")
            .short('t')
            .long("tq_thread")
            .value_name("NUM")
            .value_parser(value_parser!(u16).range(1..=255))
            .help("The number of taskq threads used, `num` greater than 0 and less than 256"),
        Arg::new("max_tq_thread")
            .short('T')
            .long("max_tq_thread")
            .value_name("NUM")
            .value_parser(value_parser!(u16).range(1..=255))
            .help("The maximum number of taskq threads used, `num` greater than 0 and less than 256"),
        Arg::new("parallel")
            .short('n')
            .long("parallel")
            .value_name("NUM")
            .value_parser(value_parser!(u32))
            .help("The maximum number of outstanding requests we can handle"),
        Arg::new("property_size")
            .short('s')
            .long("property_size")
            .value_name("NUM")
            .value_parser(value_parser!(u64))
            .help("The max size for a MQTT user property"),
        Arg::new("msq_len")
            .short('S')
            .long("msq_len")
            .value_name("NUM")
            .value_parser(value_parser!(u64))
            .help("The queue length for resending messages"),
        Arg::new("qos_duration")
            .short('D')
            .long("qos_duration")
            .value_name("NUM")
            .value_parser(value_parser!(u64))
            .help("The interval of the qos timer"),
        Arg::new("http")
            .long("http")
            .action(ArgAction::SetTrue)
            .help("Enable http server (default: disable)"),
        Arg::new("port")
            .short('p')
            .long("port")
            .value_name("NUM")
            .value_parser(value_parser!(u16))
            .help("The port of http server (default: 8081)"),
    ]
}

/// Entry point of the `nanomq` binary.
///
/// # Errors
///
/// Returns error when the requested command fails; the process exit code is
/// non-zero in that case.
pub fn run_server() -> Result<(), Error> {
    let matches = Command::new("nanomq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("An ultra-lightweight and blazing-fast MQTT broker for IoT edge")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("start").about("Start the broker").args(start_args()))
        .subcommand(
            Command::new("restart")
                .about("Stop a running broker, then start again")
                .args(start_args()),
        )
        .subcommand(Command::new("stop").about("Stop a running broker"))
        .get_matches();

    match matches.subcommand() {
        Some(("start", sub_matches)) => broker_start(sub_matches),
        Some(("restart", sub_matches)) => broker_restart(sub_matches),
        Some(("stop", _)) => broker_stop(),
        _ => unreachable!("subcommand is required"),
    }
}

fn build_config(matches: &ArgMatches) -> Result<Config, Error> {
    let mut config = match matches.get_one::<String>("conf") {
        Some(path) => Config::load(path)?,
        None => {
            if Path::new(config::CONF_PATH_NAME).exists() {
                Config::load(config::CONF_PATH_NAME)?
            } else {
                Config::default()
            }
        }
    };
    match matches.get_one::<String>("bridge") {
        Some(path) => config.load_bridge(path)?,
        None => {
            if Path::new(config::CONF_BRIDGE_PATH_NAME).exists() {
                config.load_bridge(config::CONF_BRIDGE_PATH_NAME)?;
            }
        }
    }
    match matches.get_one::<String>("auth") {
        Some(path) => config.load_auth(path)?,
        None => {
            if Path::new(config::CONF_AUTH_PATH_NAME).exists() {
                config.load_auth(config::CONF_AUTH_PATH_NAME)?;
            }
        }
    }

    // Command line options override file values.
    if let Some(url) = matches.get_one::<String>("url") {
        config.url = url.clone();
    }
    if matches.get_flag("daemon") {
        config.daemon = true;
    }
    if let Some(num) = matches.get_one::<u16>("tq_thread") {
        config.num_taskq_thread = *num;
    }
    if let Some(num) = matches.get_one::<u16>("max_tq_thread") {
        config.max_taskq_thread = *num;
    }
    if let Some(num) = matches.get_one::<u32>("parallel") {
        config.parallel = *num;
    }
    if let Some(num) = matches.get_one::<u64>("property_size") {
        config.property_size = *num as usize;
    }
    if let Some(num) = matches.get_one::<u64>("msq_len") {
        config.msq_len = *num as usize;
    }
    if let Some(num) = matches.get_one::<u64>("qos_duration") {
        config.qos_duration = *num;
    }
    if matches.get_flag("http") {
        config.http_server.enable = true;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.http_server.port = *port;
    }

    config.validate()?;
    Ok(config)
}

fn print_conf(config: &Config) {
    log::info!("This NanoMQ instance is configured with:");
    log::info!("url: {}", config.url);
    log::info!("daemon: {}", config.daemon);
    log::info!(
        "parallel: {}, taskq threads: {}..{}",
        config.parallel,
        config.num_taskq_thread,
        config.max_taskq_thread
    );
    log::info!(
        "property_size: {}, msq_len: {}, qos_duration: {}s",
        config.property_size,
        config.msq_len,
        config.qos_duration
    );
    log::info!("allow_anonymous: {}", config.allow_anonymous);
    if config.websocket.enable {
        log::info!("websocket url: {}", config.websocket.url);
    }
    if config.http_server.enable {
        log::info!("http server port: {}", config.http_server.port);
    }
    if config.bridge.bridge_mode {
        log::info!(
            "bridge to {}, forwards: {:?}, subscriptions: {}",
            config.bridge.address,
            config.bridge.forwards,
            config.bridge.sub_list.len()
        );
    }
}

fn broker_start(matches: &ArgMatches) -> Result<(), Error> {
    if let Some(pid) = process::status_check()? {
        return Err(Error::from_string(
            ErrorKind::PidError,
            format!(
                "One NanoMQ instance is still running as pid {pid}, a new instance \
                 won't be started until the other one is stopped."
            ),
        ));
    }

    let config = build_config(matches)?;
    init_log(&config.log)?;
    print_conf(&config);

    if config.daemon {
        process::daemonize()?;
    }
    process::store_pid()?;

    let result = broker(config);
    process::remove_pid();
    result
}

fn broker_stop() -> Result<(), Error> {
    let Some(pid) = process::status_check()? else {
        return Err(Error::new(
            ErrorKind::PidError,
            "There is no running NanoMQ instance.",
        ));
    };
    process::kill(pid, nc::SIGTERM)?;
    process::remove_pid();
    eprintln!("NanoMQ stopped.");
    Ok(())
}

fn broker_restart(matches: &ArgMatches) -> Result<(), Error> {
    if let Some(pid) = process::status_check()? {
        process::kill(pid, nc::SIGTERM)?;
        let mut tries = 0;
        while process::is_alive(pid) {
            std::thread::sleep(Duration::from_millis(100));
            tries += 1;
            if tries > 20 {
                let _ = process::kill(pid, nc::SIGKILL);
            }
        }
        process::remove_pid();
        eprintln!("Previous NanoMQ instance stopped.");
    } else {
        eprintln!("There is no running NanoMQ instance.");
    }
    broker_start(matches)
}
