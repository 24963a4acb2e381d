// Copyright (c) 2021 NanoMQ Team, Inc. All rights reserved.
// Use of this source is governed by MIT License that can be found
// in the LICENSE file.

use std::collections::HashMap;

use crate::config::AuthEntry;

/// Flat username/password table consulted at CONNECT time.
#[derive(Debug, Default, Clone)]
pub struct AuthTable {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl AuthTable {
    #[must_use]
    pub fn new(entries: &[AuthEntry], allow_anonymous: bool) -> Self {
        let users = entries
            .iter()
            .map(|entry| (entry.username.clone(), entry.password.clone()))
            .collect();
        Self {
            users,
            allow_anonymous,
        }
    }

    /// Whether a CONNECT with these credentials is accepted.
    ///
    /// An empty username counts as anonymous.
    #[must_use]
    pub fn check(&self, username: &str, password: &[u8]) -> bool {
        if username.is_empty() {
            return self.allow_anonymous;
        }
        match self.users.get(username) {
            Some(expected) => expected.as_bytes() == password,
            None => self.allow_anonymous,
        }
    }
}
