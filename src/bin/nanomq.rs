// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use nanomq::{server, Error};

fn main() -> Result<(), Error> {
    server::run_server()
}
