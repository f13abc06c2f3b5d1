// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte ranges: the `Range` request header and the `Content-Range` response header

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write;

/// One `bytes` range spec.
///
/// A range is either `first-[last]` or the suffix form `-length`. Unset positions are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    first: Option<u64>,
    last: Option<u64>,
    suffix: Option<u64>,
    computed: bool,
}

impl ByteRange {
    /// `first-last`, or `first-` when `last` is `None`
    pub fn bounded(first: u64, last: Option<u64>) -> Self {
        ByteRange {
            first: Some(first),
            last,
            ..Default::default()
        }
    }

    /// The last `length` bytes
    pub fn suffix(length: u64) -> Self {
        ByteRange {
            suffix: Some(length),
            ..Default::default()
        }
    }

    pub fn first(&self) -> Option<u64> {
        self.first
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn suffix_length(&self) -> Option<u64> {
        self.suffix
    }

    pub fn is_suffix(&self) -> bool {
        self.suffix.is_some()
    }

    pub(crate) fn set_first(&mut self, first: u64) {
        self.first = Some(first);
    }

    pub(crate) fn set_last(&mut self, last: u64) {
        self.last = Some(last);
    }

    pub fn is_valid(&self) -> bool {
        if let Some(suffix) = self.suffix {
            return suffix > 0;
        }
        match (self.first, self.last) {
            (Some(_), None) => true,
            (Some(first), Some(last)) => last >= first,
            _ => false,
        }
    }

    /// Resolve the range against a resource of `size` bytes into absolute `first` and `last`.
    ///
    /// Can only be done once. Returns false when the range can't be satisfied.
    pub fn compute_bounds(&mut self, size: u64) -> bool {
        if self.computed {
            return false;
        }
        self.computed = true;

        // an empty range means the whole resource
        if self.first.is_none() && self.last.is_none() && self.suffix.is_none() {
            self.first = Some(0);
            self.last = size.checked_sub(1);
            return true;
        }
        if !self.is_valid() {
            return false;
        }
        if let Some(suffix) = self.suffix.take() {
            self.first = Some(size - suffix.min(size));
            self.last = size.checked_sub(1);
            return true;
        }
        let Some(first) = self.first else {
            return false;
        };
        if first >= size {
            return false;
        }
        self.last = Some(self.last.map_or(size - 1, |last| last.min(size - 1)));
        true
    }

    /// The `Range` header value for this range
    pub fn header_value(&self) -> String {
        let mut value = String::from("bytes=");
        // writing to a String never fails
        let _ = match (self.suffix, self.first, self.last) {
            (Some(suffix), _, _) => write!(value, "-{suffix}"),
            (None, Some(first), Some(last)) => write!(value, "{first}-{last}"),
            (None, Some(first), None) => write!(value, "{first}-"),
            (None, None, Some(last)) => write!(value, "-{last}"),
            (None, None, None) => write!(value, "0-"),
        };
        value
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// one range spec, e.g. "0-100", "-5" or "1-"
static RE_RANGE_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<first>\d*)\s*-\s*(?P<last>\d*)\s*$").unwrap());

/// Parse a `Range` header value.
///
/// Only the `bytes` unit is understood. Every spec must be well formed and valid.
pub fn parse_range_header(value: &str) -> Option<Vec<ByteRange>> {
    let (unit, specs) = value.split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    let mut ranges = Vec::new();
    for spec in specs.split(',') {
        let captured = RE_RANGE_SPEC.captures(spec)?;
        let position = |name: &str| {
            captured
                .name(name)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
        };
        let range = match (position("first"), position("last")) {
            (None, Some(last)) => ByteRange::suffix(last.parse().ok()?),
            (Some(first), None) => ByteRange::bounded(first.parse().ok()?, None),
            (Some(first), Some(last)) => {
                ByteRange::bounded(first.parse().ok()?, Some(last.parse().ok()?))
            }
            (None, None) => return None,
        };
        if !range.is_valid() {
            return None;
        }
        ranges.push(range);
    }
    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}

/// A parsed `Content-Range: bytes first-last/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first: u64,
    pub last: u64,
    pub total: u64,
}

impl ContentRange {
    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.last.saturating_sub(self.first).saturating_add(1)
    }

    pub fn header_value(&self) -> String {
        format!("bytes {}-{}/{}", self.first, self.last, self.total)
    }
}

/// Parse the `Content-Range` of a 206 response. An unknown (`*`) total is rejected.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim();
    let (unit, rest) = value.split_once(|c: char| c.is_ascii_whitespace())?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (range, total) = rest.trim().split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let range = ContentRange {
        first: parse_u64(first)?,
        last: parse_u64(last)?,
        total: parse_u64(total)?,
    };
    if range.last < range.first || range.total <= range.last {
        return None;
    }
    Some(range)
}
