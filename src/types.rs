// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

/// The transport's identifier for an individual client connection.
///
/// Never zero for a live pipe; the accept loop hands them out sequentially.
pub type PipeId = u32;

/// Protocol a work item speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Proto {
    /// Serves local clients on the shared listener socket.
    #[default]
    Broker,

    /// Drains messages delivered by the upstream bridge connection.
    Bridge,
}
