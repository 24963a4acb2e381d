// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

//! PID-file bookkeeping and daemon control.

use std::fs;
use std::path::Path;

use crate::config::PID_PATH_NAME;
use crate::error::{Error, ErrorKind};

/// Check for a running instance through the pid file.
///
/// Returns the pid of the live instance, or `None` when there is none;
/// stale pid files (no live process) are removed along the way.
///
/// # Errors
///
/// Returns error if the pid file exists but cannot be read or parsed.
pub fn status_check() -> Result<Option<i32>, Error> {
    let path = Path::new(PID_PATH_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let Ok(pid) = data.trim().parse::<i32>() else {
        // Corrupt pid files count as stale.
        log::warn!("invalid pid file {PID_PATH_NAME} removed");
        let _ = fs::remove_file(path);
        return Ok(None);
    };

    // Signal 0 probes for liveness only.
    if unsafe { nc::kill(pid, 0) }.is_ok() {
        log::debug!("running instance found, pid [{pid}]");
        return Ok(Some(pid));
    }
    log::debug!("stale pid file removed");
    let _ = fs::remove_file(path);
    Ok(None)
}

/// Write our pid to the pid file.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn store_pid() -> Result<(), Error> {
    let path = Path::new(PID_PATH_NAME);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}", std::process::id()))?;
    Ok(())
}

pub fn remove_pid() {
    let _ = fs::remove_file(PID_PATH_NAME);
}

/// Send `signal` to `pid`.
///
/// # Errors
///
/// Returns error if the signal cannot be delivered.
pub fn kill(pid: i32, signal: i32) -> Result<(), Error> {
    unsafe { nc::kill(pid, signal) }.map_err(|errno| {
        Error::from_string(
            ErrorKind::PidError,
            format!("failed to signal process {pid}, errno {errno}"),
        )
    })
}

#[must_use]
pub fn is_alive(pid: i32) -> bool {
    unsafe { nc::kill(pid, 0) }.is_ok()
}

/// Detach from the controlling terminal with the usual double fork. Must
/// run before the async runtime starts.
///
/// # Errors
///
/// Returns error if a fork or setsid fails.
pub fn daemonize() -> Result<(), Error> {
    let fork_err = |errno: i32| {
        Error::from_string(ErrorKind::IoError, format!("fork failed, errno {errno}"))
    };
    match unsafe { nc::fork() } {
        Ok(0) => {}
        Ok(_child) => std::process::exit(0),
        Err(errno) => return Err(fork_err(errno)),
    }
    unsafe { nc::setsid() }.map_err(|errno| {
        Error::from_string(ErrorKind::IoError, format!("setsid failed, errno {errno}"))
    })?;
    match unsafe { nc::fork() } {
        Ok(0) => {}
        Ok(_child) => std::process::exit(0),
        Err(errno) => return Err(fork_err(errno)),
    }
    let _ = unsafe { nc::chdir("/") };
    Ok(())
}
