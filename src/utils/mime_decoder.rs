// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 2047 encoded-word decoding for envelope subjects.
//!
//! Handles `B` and `Q` encodings in UTF-8, US-ASCII and ISO-8859-1. Words in
//! any other charset are left as-is, so substring matching still sees the raw
//! header text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;

lazy_static::lazy_static! {
    static ref ENCODED_WORD: Option<Regex> =
        Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").ok();
}

/// Decodes every encoded word in `input`.
///
/// Whitespace separating two adjacent encoded words is dropped, as RFC 2047
/// requires; all other text is copied through unchanged.
pub fn decode_mime_header(input: &str) -> String {
    let Some(re) = ENCODED_WORD.as_ref() else {
        return input.to_string();
    };

    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    let mut prev_was_word = false;

    for cap in re.captures_iter(input) {
        let Some(whole) = cap.get(0) else { continue };
        let gap = &input[last_end..whole.start()];
        if !(prev_was_word && gap.trim().is_empty()) {
            out.push_str(gap);
        }

        let charset = &cap[1];
        let text = &cap[3];
        let bytes = match &cap[2] {
            "B" | "b" => BASE64.decode(text).ok(),
            _ => Some(decode_q(text)),
        };

        match bytes.and_then(|b| to_string(charset, b)) {
            Some(decoded) => out.push_str(&decoded),
            None => out.push_str(whole.as_str()),
        }

        last_end = whole.end();
        prev_was_word = true;
    }

    out.push_str(&input[last_end..]);
    out
}

fn to_string(charset: &str, bytes: Vec<u8>) -> Option<String> {
    // RFC 2231 language suffix, e.g. `UTF-8*en`
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "us-ascii" => String::from_utf8(bytes).ok(),
        "iso-8859-1" | "latin1" => Some(bytes.into_iter().map(char::from).collect()),
        _ => None,
    }
}

fn decode_q(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
