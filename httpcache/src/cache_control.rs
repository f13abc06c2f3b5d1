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

//! The response `Cache-Control` directives the cache acts on
//!
//! Only the directives that matter to a private cache are kept: `no-store`, `no-cache`,
//! `must-revalidate`, `max-age` and `stale-while-revalidate`. Everything else is dropped at
//! parse time.

use super::*;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::num::IntErrorKind;
use std::str;

/// What an out of range delta-seconds value turns into (RFC 9111 section 1.2.2)
pub const DELTA_SECONDS_CAP: u32 = 1 << 31;

// directive = token [ "=" ( token / quoted-string ) ], separated by "," (or ";", which is
// accepted as well)
static RE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?-u)(?:^|\s*[,;]\s*)(?P<name>[^\x00-\x20()<>@,;:\\"/\[\]?={}\x7F]+)(?:=(?P<value>[^\x00-\x20()<>@,;:\\"/\[\]?={}\x7F]+|"(?:[^"\\]|\\.)*"))?"#,
    )
    .unwrap()
});

/// A delta-seconds directive value: missing, usable or garbage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Seconds {
    #[default]
    Absent,
    Valid(u32),
    Invalid,
}

impl Seconds {
    fn parse(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw else {
            // a bare `max-age` carries nothing usable
            return Seconds::Invalid;
        };
        let unquoted = raw
            .strip_prefix(b"\"")
            .and_then(|r| r.strip_suffix(b"\""))
            .unwrap_or(raw);
        let Ok(text) = str::from_utf8(unquoted) else {
            return Seconds::Invalid;
        };
        match text.parse::<u32>() {
            Ok(secs) => Seconds::Valid(secs),
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => Seconds::Valid(DELTA_SECONDS_CAP),
            Err(_) => Seconds::Invalid,
        }
    }

    pub fn get(self) -> Option<u32> {
        match self {
            Seconds::Valid(secs) => Some(secs),
            _ => None,
        }
    }
}

/// Parsed `Cache-Control` of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    /// `no-cache` with or without field names; a private cache treats both the same
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub max_age: Seconds,
    pub stale_while_revalidate: Seconds,
}

impl CacheDirectives {
    /// Parse every `Cache-Control` line of `resp`. `None` when there is no such header.
    pub fn from_response(resp: &ResponseHeader) -> Option<Self> {
        let mut lines = resp.headers.get_all(http::header::CACHE_CONTROL).iter().peekable();
        lines.peek()?;

        let mut directives = CacheDirectives::default();
        for line in lines {
            for caps in RE_DIRECTIVE.captures_iter(line.as_bytes()) {
                let Some(name) = caps.name("name") else {
                    continue;
                };
                let value = caps.name("value").map(|v| v.as_bytes());
                // later lines win, like later directives on the same line
                match name.as_bytes().to_ascii_lowercase().as_slice() {
                    b"no-store" => directives.no_store = true,
                    b"no-cache" => directives.no_cache = true,
                    b"must-revalidate" => directives.must_revalidate = true,
                    b"max-age" => directives.max_age = Seconds::parse(value),
                    b"stale-while-revalidate" => {
                        directives.stale_while_revalidate = Seconds::parse(value)
                    }
                    _ => {}
                }
            }
        }
        Some(directives)
    }

    /// Whether a stored response can never be used without validation
    pub fn forbids_reuse(&self) -> bool {
        self.no_cache || self.no_store
    }

    /// The freshness lifetime from `max-age`. `Some(0)` when reuse is forbidden.
    pub fn fresh_sec(&self) -> Option<u32> {
        if self.forbids_reuse() {
            return Some(0);
        }
        self.max_age.get()
    }

    /// How long past freshness the response may be served while it is revalidated.
    /// `must-revalidate` turns this off.
    pub fn stale_sec(&self) -> Option<u32> {
        if self.must_revalidate {
            return None;
        }
        self.stale_while_revalidate.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::header::CACHE_CONTROL;

    fn directives(lines: &[&str]) -> CacheDirectives {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        for line in lines {
            resp.append_header(CACHE_CONTROL, *line).unwrap();
        }
        CacheDirectives::from_response(&resp).unwrap()
    }

    #[test]
    fn test_no_header() {
        let resp = ResponseHeader::build(200, None).unwrap();
        assert!(CacheDirectives::from_response(&resp).is_none());
    }

    #[test]
    fn test_max_age() {
        let cc = directives(&["public, max-age=3600"]);
        assert_eq!(cc.fresh_sec(), Some(3600));
        assert!(!cc.forbids_reuse());

        // quoted, mixed case, s-maxage ignored
        let cc = directives(&["Max-Age=\"60\", s-maxage=5"]);
        assert_eq!(cc.fresh_sec(), Some(60));
    }

    #[test]
    fn test_split_lines_and_semicolons() {
        let cc = directives(&["private;", "max-age=10; must-revalidate"]);
        assert_eq!(cc.max_age, Seconds::Valid(10));
        assert!(cc.must_revalidate);
    }

    #[test]
    fn test_bad_and_huge_values() {
        let cc = directives(&["max-age=-5, stale-while-revalidate=99999999999999999999"]);
        assert_eq!(cc.max_age, Seconds::Invalid);
        assert_eq!(cc.fresh_sec(), None);
        assert_eq!(cc.stale_sec(), Some(DELTA_SECONDS_CAP));

        let cc = directives(&["max-age"]);
        assert_eq!(cc.max_age, Seconds::Invalid);
    }

    #[test]
    fn test_no_cache_and_no_store() {
        let cc = directives(&["max-age=600, no-cache=\"set-cookie\""]);
        assert!(cc.forbids_reuse());
        assert_eq!(cc.fresh_sec(), Some(0));

        let cc = directives(&["no-store"]);
        assert!(cc.no_store);
        assert_eq!(cc.fresh_sec(), Some(0));
    }

    #[test]
    fn test_stale_while_revalidate() {
        let cc = directives(&["max-age=10, stale-while-revalidate=60"]);
        assert_eq!(cc.stale_sec(), Some(60));

        let cc = directives(&["max-age=10, stale-while-revalidate=60, must-revalidate"]);
        assert_eq!(cc.stale_sec(), None);
    }
}
