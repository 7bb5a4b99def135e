// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XOAUTH2 SASL mechanism for `AUTHENTICATE XOAUTH2`.
//!
//! Initial response: `user=<username>\x01auth=Bearer <access_token>\x01\x01`.
//! async-imap base64-encodes whatever `process()` returns.

use async_imap::Authenticator;

pub const MECHANISM: &str = "XOAUTH2";

/// Builds the XOAUTH2 initial client response.
pub fn initial_response(username: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", username, access_token)
}

#[derive(Debug, Clone)]
pub struct XOAuth2Authenticator {
    token: String,
    sent: bool,
}

impl XOAuth2Authenticator {
    pub fn new(username: &str, access_token: &str) -> Self {
        Self {
            token: initial_response(username, access_token),
            sent: false,
        }
    }
}

impl Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // A second challenge carries the server's JSON error; answer empty so it sends NO.
        if self.sent {
            return String::new();
        }
        self.sent = true;
        self.token.clone()
    }
}
