// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SEARCH predicate construction and client-side envelope matching.
//!
//! Everything here is pure: no I/O, no clocks.

use std::fmt;

use chrono::{Days, NaiveDate};

use crate::imap::types::EnvelopeSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    Since(NaiveDate),
    Before(NaiveDate),
    Larger(u64),
    Smaller(u64),
    Seen,
    Unseen,
    From(String),
    Subject(String),
    Or(Box<SearchCriteria>, Box<SearchCriteria>),
    And(Vec<SearchCriteria>),
}

impl SearchCriteria {
    pub fn or(left: SearchCriteria, right: SearchCriteria) -> Self {
        SearchCriteria::Or(Box::new(left), Box::new(right))
    }

    /// Full `UID SEARCH` argument, prefixed with `CHARSET UTF-8` when needed.
    pub fn to_query(&self) -> String {
        let body = self.to_string();
        if self.needs_utf8() {
            format!("CHARSET UTF-8 {}", body)
        } else {
            body
        }
    }

    fn needs_utf8(&self) -> bool {
        match self {
            SearchCriteria::From(s) | SearchCriteria::Subject(s) => !s.is_ascii(),
            SearchCriteria::Or(a, b) => a.needs_utf8() || b.needs_utf8(),
            SearchCriteria::And(items) => items.iter().any(|c| c.needs_utf8()),
            _ => false,
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        match self {
            SearchCriteria::All => write!(f, "ALL"),
            SearchCriteria::Since(d) => write!(f, "SINCE {}", imap_date(d)),
            SearchCriteria::Before(d) => write!(f, "BEFORE {}", imap_date(d)),
            SearchCriteria::Larger(n) => write!(f, "LARGER {}", n),
            SearchCriteria::Smaller(n) => write!(f, "SMALLER {}", n),
            SearchCriteria::Seen => write!(f, "SEEN"),
            SearchCriteria::Unseen => write!(f, "UNSEEN"),
            SearchCriteria::From(s) => write!(f, "FROM {}", quote(s)),
            SearchCriteria::Subject(s) => write!(f, "SUBJECT {}", quote(s)),
            SearchCriteria::Or(a, b) => {
                write!(f, "OR ")?;
                a.render(f, true)?;
                write!(f, " ")?;
                b.render(f, true)
            }
            SearchCriteria::And(items) => match items.as_slice() {
                [] => write!(f, "ALL"),
                [only] => only.render(f, nested),
                _ => {
                    if nested {
                        write!(f, "(")?;
                    }
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        item.render(f, true)?;
                    }
                    if nested {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            },
        }
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, false)
    }
}

/// `D-Mon-YYYY`, as SEARCH date arguments require.
fn imap_date(date: &NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOp {
    Larger,
    Smaller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeFilter {
    pub op: SizeOp,
    pub bytes: u64,
}

/// Parses `>1M`, `<100K`, `>512`. Anything without a leading `>`/`<` or with
/// a bad magnitude is `None`.
pub fn parse_size(input: &str) -> Option<SizeFilter> {
    let input = input.trim();
    let mut chars = input.chars();
    let op = match chars.next()? {
        '>' => SizeOp::Larger,
        '<' => SizeOp::Smaller,
        _ => return None,
    };
    let rest = chars.as_str().trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = rest.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = rest.strip_suffix('M') {
        (n, 1024 * 1024)
    } else {
        (rest.as_str(), 1)
    };
    let value: u64 = digits.trim().parse().ok()?;
    Some(SizeFilter {
        op,
        bytes: value.checked_mul(multiplier)?,
    })
}

/// Splits a comma-separated sender list, trimming and dropping empties.
pub fn parse_senders(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Right-nested OR over `FROM` predicates: `[a, b, c]` → `OR a (OR b c)`.
pub fn build_or_chain(senders: &[String]) -> Option<SearchCriteria> {
    let (last, rest) = senders.split_last()?;
    let mut chain = SearchCriteria::From(last.clone());
    for sender in rest.iter().rev() {
        chain = SearchCriteria::or(SearchCriteria::From(sender.clone()), chain);
    }
    Some(chain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Seen,
    Unseen,
}

impl ReadState {
    /// `seen` / `unseen`; anything else means no read-state filter.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "seen" => Some(ReadState::Seen),
            "unseen" => Some(ReadState::Unseen),
            _ => None,
        }
    }
}

/// Normalized filter fields of a clean request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub start_date: Option<NaiveDate>,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub size: Option<SizeFilter>,
    pub read: Option<ReadState>,
    pub senders: Vec<String>,
    pub subject: Option<String>,
}

impl FilterSpec {
    pub fn has_text_filters(&self) -> bool {
        !self.senders.is_empty() || self.subject.is_some()
    }

    /// Date, size and read-state only.
    pub fn base_criteria(&self) -> SearchCriteria {
        SearchCriteria::And(self.base_parts())
    }

    fn base_parts(&self) -> Vec<SearchCriteria> {
        let mut parts = Vec::new();
        if let Some(start) = self.start_date {
            parts.push(SearchCriteria::Since(start));
        }
        // BEFORE is strictly-less-than; the end date itself must be included.
        let before = self
            .end_date
            .checked_add_days(Days::new(1))
            .unwrap_or(self.end_date);
        parts.push(SearchCriteria::Before(before));

        match self.size {
            Some(SizeFilter { bytes: 0, .. }) | None => {}
            Some(SizeFilter { op: SizeOp::Larger, bytes }) => parts.push(SearchCriteria::Larger(bytes)),
            Some(SizeFilter { op: SizeOp::Smaller, bytes }) => parts.push(SearchCriteria::Smaller(bytes)),
        }
        match self.read {
            Some(ReadState::Seen) => parts.push(SearchCriteria::Seen),
            Some(ReadState::Unseen) => parts.push(SearchCriteria::Unseen),
            None => {}
        }
        parts
    }

    /// Base predicate plus subject and sender terms.
    pub fn full_criteria(&self) -> SearchCriteria {
        let mut parts = self.base_parts();
        if let Some(subject) = &self.subject {
            parts.push(SearchCriteria::Subject(subject.clone()));
        }
        if let Some(senders) = build_or_chain(&self.senders) {
            parts.push(senders);
        }
        SearchCriteria::And(parts)
    }

    /// Case-insensitive substring match: any sender against any From
    /// address, and the subject against the decoded subject.
    pub fn matches_envelope(&self, envelope: &EnvelopeSummary) -> bool {
        if !self.senders.is_empty() {
            let from: Vec<String> = envelope.from.iter().map(|a| a.to_lowercase()).collect();
            let hit = self.senders.iter().any(|sender| {
                let needle = sender.to_lowercase();
                from.iter().any(|addr| addr.contains(&needle))
            });
            if !hit {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            let Some(actual) = &envelope.subject else {
                return false;
            };
            if !actual.to_lowercase().contains(&subject.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
