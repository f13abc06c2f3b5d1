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

//! The request descriptor a cache transaction is started with

use super::*;
use bitflags::bitflags;

bitflags! {
    /// Per request switches that steer how the cache is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        /// Use the cache the normal way
        const NORMAL = 0;
        /// Validate the cached response with the server even if it is fresh
        const VALIDATE_CACHE = 1 << 0;
        /// Ignore any cached response and fetch from the network, then store the result
        const BYPASS_CACHE = 1 << 1;
        /// Use any cached response, even if it is stale
        const SKIP_CACHE_VALIDATION = 1 << 2;
        /// Never touch the network. A miss is an error
        const ONLY_FROM_CACHE = 1 << 3;
        /// Neither read from nor write to the cache
        const DISABLE_CACHE = 1 << 4;
        /// The request is a prefetch
        const PREFETCH = 1 << 5;
        /// The request is a prefetch that only some consumers may reuse
        const RESTRICTED_PREFETCH = 1 << 6;
        /// The consumer is allowed to reuse restricted prefetches
        const CAN_USE_RESTRICTED_PREFETCH = 1 << 7;
        /// Stale-while-revalidate responses may be served, the caller will revalidate
        const SUPPORT_ASYNC_REVALIDATION = 1 << 8;
        /// Don't compare the Vary fields of the stored response
        const SKIP_VARY_CHECK = 1 << 9;
    }
}

/// The priority of a request, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, IntoStaticStr)]
pub enum RequestPriority {
    Throttled,
    Idle,
    Lowest,
    #[default]
    Low,
    Medium,
    Highest,
}

/// Credentials to restart a request with after a 401 or 407.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthCredentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// First-Party Sets cache filter data of a request.
///
/// Entries written before `clear_at_run_id` are stale and must not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirstPartySetsFilter {
    pub clear_at_run_id: Option<i64>,
    pub browser_run_id: Option<i64>,
}

/// Everything the cache needs to know about a request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Method, URL and headers
    pub header: RequestHeader,
    pub load_flags: LoadFlags,
    /// The network isolation key. `None` means the key is transient and the request can't use a
    /// split cache.
    pub isolation_key: Option<String>,
    /// Identifies the upload body of a POST, 0 if there is none
    pub upload_id: u64,
    /// Whether the request carries a body
    pub has_upload: bool,
    /// Expected SHA-256 of the selected response headers and the body, as hex. Setting it opts
    /// into the single-keyed cache.
    pub checksum: Option<String>,
    pub fps_cache_filter: FirstPartySetsFilter,
}

impl Default for RequestInfo {
    /// A GET of `/`
    fn default() -> Self {
        let (parts, _) = http::Request::new(()).into_parts();
        RequestInfo {
            header: parts.into(),
            load_flags: LoadFlags::NORMAL,
            isolation_key: None,
            upload_id: 0,
            has_upload: false,
            checksum: None,
            fps_cache_filter: FirstPartySetsFilter::default(),
        }
    }
}

impl RequestInfo {
    /// Create a request with no extra headers and [LoadFlags::NORMAL].
    pub fn new(method: impl TryInto<Method>, url: &str) -> Result<Self> {
        Ok(RequestInfo {
            header: RequestHeader::build(method, url, None)?,
            load_flags: LoadFlags::NORMAL,
            isolation_key: None,
            upload_id: 0,
            has_upload: false,
            checksum: None,
            fps_cache_filter: FirstPartySetsFilter::default(),
        })
    }

    pub fn method(&self) -> &Method {
        &self.header.method
    }

    pub fn url(&self) -> String {
        self.header.uri.to_string()
    }

    pub fn headers(&self) -> &HMap {
        &self.header.headers
    }

    /// Builder style helper to add a header
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        self.header.append_header(name, value)?;
        Ok(self)
    }

    /// Builder style helper to set the load flags
    pub fn with_load_flags(mut self, flags: LoadFlags) -> Self {
        self.load_flags = flags;
        self
    }

    pub(crate) fn is_method(&self, method: &Method) -> bool {
        &self.header.method == method
    }

    /// PUT, DELETE and PATCH only use the cache to invalidate it.
    pub(crate) fn is_write_method(&self) -> bool {
        matches!(
            self.header.method,
            Method::PUT | Method::DELETE | Method::PATCH
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_info() {
        let req = RequestInfo::new("PATCH", "http://example.com/x")
            .unwrap()
            .with_header("range", "bytes=0-1")
            .unwrap()
            .with_load_flags(LoadFlags::VALIDATE_CACHE | LoadFlags::PREFETCH);
        assert!(req.is_write_method());
        assert!(req.is_method(&Method::PATCH));
        assert_eq!(req.url(), "http://example.com/x");
        assert_eq!(req.header.header_str("Range"), Some("bytes=0-1"));
        assert!(req.load_flags.contains(LoadFlags::PREFETCH));
        assert!(!req.load_flags.contains(LoadFlags::BYPASS_CACHE));
    }

    #[test]
    fn test_priority_order() {
        assert!(RequestPriority::Highest > RequestPriority::Medium);
        assert!(RequestPriority::Throttled < RequestPriority::Idle);
        assert_eq!(RequestPriority::default(), RequestPriority::Low);
        let name: &'static str = RequestPriority::Medium.into();
        assert_eq!(name, "Medium");
    }
}
