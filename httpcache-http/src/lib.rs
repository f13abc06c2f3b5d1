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

//! HTTP header objects for the cache
//!
//! [RequestHeader] and [ResponseHeader] wrap [http::request::Parts] and [http::response::Parts]
//! and add the header queries a cache needs: comma separated token lookups, validators, dates and
//! the merge of a 304 response into a stored one.

#![allow(clippy::new_without_default)]

use http::header::{AsHeaderName, HeaderName, HeaderValue};
use http::request::Parts as ReqParts;
use http::response::Parts as RespParts;
use http::uri::Uri;
use httpcache_error::{ErrorType::*, OrErr, Result};
use std::ops::Deref;
use std::time::SystemTime;

pub use http::method::Method;
pub use http::status::StatusCode;
pub use http::version::Version;
pub use http::HeaderMap as HMap;

/// The HTTP request header type.
///
/// [RequestHeader] implements [Deref] for [http::request::Parts] so it can be used as it in most
/// places.
#[derive(Debug)]
pub struct RequestHeader {
    base: ReqParts,
}

impl Deref for RequestHeader {
    type Target = ReqParts;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl RequestHeader {
    fn new(size_hint: Option<usize>) -> Self {
        let mut base = http::Request::new(()).into_parts().0;
        base.headers.reserve(http_header_map_upper_bound(size_hint));
        RequestHeader { base }
    }

    /// Create a new [RequestHeader] with the given method and URI.
    ///
    /// The `uri` can be a path or an absolute URL.
    pub fn build(method: impl TryInto<Method>, uri: &str, size_hint: Option<usize>) -> Result<Self> {
        let mut req = Self::new(size_hint);
        req.base.method = method
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid method")?;
        req.base.uri = uri
            .parse::<Uri>()
            .explain_err(InvalidHTTPHeader, |_| format!("invalid uri {}", uri))?;
        Ok(req)
    }

    /// Append the header name and value to `self`.
    ///
    /// If there are already some headers under the same name, a new value will be added without
    /// any others being removed.
    pub fn append_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<bool> {
        let (name, value) = header_pair(name, value)?;
        Ok(self.base.headers.append(name, value))
    }

    /// Insert the header name and value to `self`.
    ///
    /// Different from [Self::append_header()], this method will replace all other existing headers
    /// under the same name (case-insensitive).
    pub fn insert_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = header_pair(name, value)?;
        self.base.headers.insert(name, value);
        Ok(())
    }

    /// Replace all headers with the given map
    pub fn set_headers(&mut self, headers: HMap) {
        self.base.headers = headers;
    }

    /// The first value of the header as a str, if it is valid visible ASCII
    pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
        header_str(&self.base.headers, name)
    }

    /// Whether any comma separated token of the header equals `value`, case-insensitively
    pub fn has_header_value(&self, name: impl AsHeaderName, value: &str) -> bool {
        has_header_value(&self.base.headers, name, value)
    }
}

impl Clone for RequestHeader {
    fn clone(&self) -> Self {
        Self {
            base: clone_req_parts(&self.base),
        }
    }
}

impl From<ReqParts> for RequestHeader {
    fn from(base: ReqParts) -> Self {
        RequestHeader { base }
    }
}

/// The HTTP response header type.
///
/// [ResponseHeader] implements [Deref] for [http::response::Parts] so it can be used as it in most
/// places.
#[derive(Debug)]
pub struct ResponseHeader {
    base: RespParts,
}

impl Deref for ResponseHeader {
    type Target = RespParts;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl Clone for ResponseHeader {
    fn clone(&self) -> Self {
        Self {
            base: clone_resp_parts(&self.base),
        }
    }
}

/// Headers of a 304 or 206 response that never replace the stored ones.
const NON_UPDATED_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "www-authenticate",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-location",
    "content-md5",
    "etag",
    "content-encoding",
    "content-range",
    "content-type",
    "content-length",
    "x-frame-options",
    "x-xss-protection",
];

const NON_UPDATED_HEADER_PREFIXES: &[&str] = &["x-content-", "x-webkit-"];

fn should_update_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    !NON_UPDATED_HEADERS.contains(&name)
        && !NON_UPDATED_HEADER_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

impl ResponseHeader {
    fn new(size_hint: Option<usize>) -> Self {
        let mut base = http::Response::new(()).into_parts().0;
        base.headers.reserve(http_header_map_upper_bound(size_hint));
        ResponseHeader { base }
    }

    /// Create a new [ResponseHeader] with the given status code.
    pub fn build(code: impl TryInto<StatusCode>, size_hint: Option<usize>) -> Result<Self> {
        let mut resp = Self::new(size_hint);
        resp.base.status = code
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid status")?;
        Ok(resp)
    }

    /// Append the header name and value to `self`.
    ///
    /// If there are already some headers under the same name, a new value will be added without
    /// any others being removed.
    pub fn append_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<bool> {
        let (name, value) = header_pair(name, value)?;
        Ok(self.base.headers.append(name, value))
    }

    /// Insert the header name and value to `self`.
    ///
    /// Different from [Self::append_header()], this method will replace all other existing headers
    /// under the same name (case insensitive).
    pub fn insert_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = header_pair(name, value)?;
        self.base.headers.insert(name, value);
        Ok(())
    }

    /// Remove all headers under the name
    pub fn remove_header<'a, N: ?Sized>(&mut self, name: &'a N) -> Option<HeaderValue>
    where
        &'a N: 'a + AsHeaderName,
    {
        self.base.headers.remove(name)
    }

    /// Set the status code
    pub fn set_status(&mut self, status: impl TryInto<StatusCode>) -> Result<()> {
        self.base.status = status
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid status")?;
        Ok(())
    }

    /// Replace the status line with `status` over HTTP/1.1
    pub fn replace_status(&mut self, status: StatusCode) {
        self.base.status = status;
        self.base.version = Version::HTTP_11;
    }

    /// Set the HTTP version
    pub fn set_version(&mut self, version: Version) {
        self.base.version = version
    }

    /// The first value of the header as a str, if it is valid visible ASCII
    pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
        header_str(&self.base.headers, name)
    }

    /// Whether the header is present at all
    pub fn has_header(&self, name: impl AsHeaderName) -> bool {
        self.base.headers.contains_key(name)
    }

    /// Whether any comma separated token of the header equals `value`, case-insensitively
    pub fn has_header_value(&self, name: impl AsHeaderName, value: &str) -> bool {
        has_header_value(&self.base.headers, name, value)
    }

    /// The Content-Length, if present and well formed
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(http::header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Parse the header as an HTTP date
    pub fn header_time(&self, name: impl AsHeaderName) -> Option<SystemTime> {
        self.header_str(name)
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
    }

    /// The media type of Content-Type, lowercased and without parameters
    pub fn mime_type(&self) -> Option<String> {
        let ct = self.header_str(http::header::CONTENT_TYPE)?;
        let mime = ct.split(';').next()?.trim();
        if mime.is_empty() {
            None
        } else {
            Some(mime.to_ascii_lowercase())
        }
    }

    /// Whether the response carries validators usable for a conditional request.
    ///
    /// Last-Modified counts from HTTP/1.0, ETag from HTTP/1.1.
    pub fn has_validators(&self) -> bool {
        if self.base.version < Version::HTTP_10 {
            return false;
        }
        if self.header_time(http::header::LAST_MODIFIED).is_some() {
            return true;
        }
        if self.base.version < Version::HTTP_11 {
            return false;
        }
        self.header_str(http::header::ETAG)
            .map_or(false, |etag| !etag.is_empty())
    }

    /// Whether the response carries validators that are strong enough to resume a body.
    ///
    /// A non-weak ETag is strong. Last-Modified is only strong when it is at least 60 seconds
    /// before Date.
    pub fn has_strong_validators(&self) -> bool {
        if !self.has_validators() || self.base.version < Version::HTTP_11 {
            return false;
        }
        if let Some(etag) = self.header_str(http::header::ETAG) {
            let etag = etag.trim();
            match etag.find('/') {
                None | Some(0) => return true,
                Some(slash) => {
                    if !etag[..slash].trim().eq_ignore_ascii_case("w") {
                        return true;
                    }
                }
            }
        }
        let (Some(last_modified), Some(date)) = (
            self.header_time(http::header::LAST_MODIFIED),
            self.header_time(http::header::DATE),
        ) else {
            return false;
        };
        date.duration_since(last_modified)
            .map_or(false, |d| d.as_secs() >= 60)
    }

    /// Merge the headers of a 304 (or 206) response into `self`.
    ///
    /// Every header of `new` replaces the stored values under the same name, except the ones
    /// describing the stored body or the connection.
    pub fn update(&mut self, new: &ResponseHeader) {
        let mut replaced: Vec<&HeaderName> = Vec::new();
        for (name, value) in new.base.headers.iter() {
            if !should_update_header(name) {
                continue;
            }
            if !replaced.contains(&name) {
                self.base.headers.remove(name);
                replaced.push(name);
            }
            self.base.headers.append(name.clone(), value.clone());
        }
    }
}

/// The first value of the header as a str
pub fn header_str(headers: &HMap, name: impl AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Iterate over every comma separated, trimmed, non-empty token of every value of the header
pub fn header_tokens<'a>(
    headers: &'a HMap,
    name: impl AsHeaderName,
) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Whether any comma separated token of the header equals `value`, case-insensitively
pub fn has_header_value(headers: &HMap, name: impl AsHeaderName, value: &str) -> bool {
    header_tokens(headers, name).any(|t| t.eq_ignore_ascii_case(value))
}

fn header_pair(
    name: impl TryInto<HeaderName>,
    value: impl TryInto<HeaderValue>,
) -> Result<(HeaderName, HeaderValue)> {
    let name = name
        .try_into()
        .explain_err(InvalidHTTPHeader, |_| "invalid header name")?;
    let value = value
        .try_into()
        .explain_err(InvalidHTTPHeader, |_| "invalid header value")?;
    Ok((name, value))
}

fn clone_req_parts(me: &ReqParts) -> ReqParts {
    let mut parts = http::Request::new(()).into_parts().0;
    parts.method = me.method.clone();
    parts.uri = me.uri.clone();
    parts.version = me.version;
    parts.headers = me.headers.clone();
    parts
}

fn clone_resp_parts(me: &RespParts) -> RespParts {
    let mut parts = http::Response::new(()).into_parts().0;
    parts.status = me.status;
    parts.version = me.version;
    parts.headers = me.headers.clone();
    parts
}

// This function returns an upper bound on the size of the header map used inside the http crate.
// As of version 0.2, there is a limit of 1 << 15 (32,768) items inside the map. There is an
// assertion against this size inside the crate, so we want to avoid panicking by not exceeding this
// upper bound.
fn http_header_map_upper_bound(size_hint: Option<usize>) -> usize {
    const MAX_HEADER_COUNT: usize = 4096;
    const INIT_HEADER_SIZE: usize = 8;

    std::cmp::min(size_hint.unwrap_or(INIT_HEADER_SIZE), MAX_HEADER_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn header_map_upper_bound() {
        assert_eq!(8, http_header_map_upper_bound(None));
        assert_eq!(16, http_header_map_upper_bound(Some(16)));
        assert_eq!(4096, http_header_map_upper_bound(Some(7777)));
    }

    #[test]
    fn test_request_build() {
        let mut req = RequestHeader::build("GET", "http://example.com/a?b=1", None).unwrap();
        req.insert_header("Cache-Control", "max-age=0, no-transform")
            .unwrap();
        assert_eq!(req.uri.host(), Some("example.com"));
        assert!(req.has_header_value("cache-control", "MAX-AGE=0"));
        assert!(!req.has_header_value("cache-control", "no-cache"));

        assert!(RequestHeader::build("GET", "http://exa mple.com", None).is_err());
    }

    #[test]
    fn test_header_tokens() {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.append_header("vary", "accept-encoding, , Origin").unwrap();
        resp.append_header("vary", "cookie").unwrap();
        let tokens: Vec<_> = header_tokens(&resp.headers, "vary").collect();
        assert_eq!(tokens, vec!["accept-encoding", "Origin", "cookie"]);
        assert!(resp.has_header_value("vary", "origin"));
    }

    #[test]
    fn test_replace_status() {
        let mut resp = ResponseHeader::build(304, None).unwrap();
        resp.set_version(Version::HTTP_10);
        resp.replace_status(StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.version, Version::HTTP_11);
    }

    #[test]
    fn test_validators() {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        assert!(!resp.has_validators());

        resp.insert_header("etag", "\"abc\"").unwrap();
        assert!(resp.has_validators());
        assert!(resp.has_strong_validators());

        resp.insert_header("etag", "W/\"abc\"").unwrap();
        assert!(resp.has_validators());
        assert!(!resp.has_strong_validators());

        // etags don't count before HTTP/1.1
        resp.set_version(Version::HTTP_10);
        assert!(!resp.has_validators());
    }

    #[test]
    fn test_last_modified_strength() {
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.insert_header("date", httpdate::fmt_http_date(date))
            .unwrap();
        resp.insert_header(
            "last-modified",
            httpdate::fmt_http_date(date - Duration::from_secs(30)),
        )
        .unwrap();
        assert!(resp.has_validators());
        assert!(!resp.has_strong_validators());

        resp.insert_header(
            "last-modified",
            httpdate::fmt_http_date(date - Duration::from_secs(60)),
        )
        .unwrap();
        assert!(resp.has_strong_validators());
    }

    #[test]
    fn test_update_304() {
        let mut stored = ResponseHeader::build(200, None).unwrap();
        stored.insert_header("etag", "\"1\"").unwrap();
        stored.insert_header("content-length", "10").unwrap();
        stored.insert_header("cache-control", "max-age=1").unwrap();
        stored.insert_header("x-keep", "yes").unwrap();

        let mut not_modified = ResponseHeader::build(304, None).unwrap();
        not_modified.insert_header("etag", "\"2\"").unwrap();
        not_modified.insert_header("content-length", "0").unwrap();
        not_modified
            .append_header("cache-control", "max-age=100")
            .unwrap();
        not_modified.append_header("cache-control", "public").unwrap();
        not_modified.insert_header("x-content-foo", "bar").unwrap();

        stored.update(&not_modified);
        assert_eq!(stored.status, 200);
        assert_eq!(stored.header_str("etag"), Some("\"1\""));
        assert_eq!(stored.content_length(), Some(10));
        let cc: Vec<_> = header_tokens(&stored.headers, "cache-control").collect();
        assert_eq!(cc, vec!["max-age=100", "public"]);
        assert_eq!(stored.header_str("x-keep"), Some("yes"));
        assert!(!stored.has_header("x-content-foo"));
    }

    #[test]
    fn test_mime_type() {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        assert_eq!(resp.mime_type(), None);
        resp.insert_header("content-type", "Video/MP4; codecs=avc1")
            .unwrap();
        assert_eq!(resp.mime_type().as_deref(), Some("video/mp4"));
    }
}
