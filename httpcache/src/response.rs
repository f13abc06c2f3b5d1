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

//! The response a transaction hands to its caller

use super::*;
use crate::vary::VaryData;
use std::time::SystemTime;

/// How the cache entry was involved in producing the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoStaticStr)]
pub enum CacheEntryStatus {
    #[default]
    Undefined,
    /// Served from the cache without validation
    Used,
    /// Validated with a 304
    Validated,
    /// Replaced by a new network response
    Updated,
    /// Fetched from the network, there was no entry
    NotInCache,
    /// The entry had no validators and was replaced
    CantConditionalize,
    /// Anything else, including conflicting updates
    Other,
}

impl CacheEntryStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Merge a newly observed status into `self`.
    ///
    /// The first status sticks. A second, different one turns the status into `Other`, which
    /// never changes again.
    pub fn update(&mut self, new: CacheEntryStatus) {
        *self = match *self {
            CacheEntryStatus::Other => CacheEntryStatus::Other,
            CacheEntryStatus::Undefined => new,
            current if current == new => current,
            _ => CacheEntryStatus::Other,
        };
    }
}

/// Response headers plus the cache metadata the caller may inspect.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub headers: Option<ResponseHeader>,
    /// When the request that produced the response was sent
    pub request_time: SystemTime,
    /// When the response headers were received
    pub response_time: SystemTime,
    /// Whether the response came out of the cache
    pub was_cached: bool,
    /// Whether the network was touched, including a validation
    pub network_accessed: bool,
    pub unused_since_prefetch: bool,
    pub restricted_prefetch: bool,
    pub single_keyed_cache_entry_unusable: bool,
    /// The response was served stale and the caller should revalidate it
    pub async_revalidation_requested: bool,
    /// Until when a stale-while-revalidate response may be served again
    pub stale_revalidate_timeout: Option<SystemTime>,
    pub vary_data: VaryData,
    /// The run id of the browser session that wrote the entry
    pub browser_run_id: Option<i64>,
    pub cache_entry_status: CacheEntryStatus,
}

impl Default for ResponseInfo {
    fn default() -> Self {
        ResponseInfo {
            headers: None,
            request_time: SystemTime::UNIX_EPOCH,
            response_time: SystemTime::UNIX_EPOCH,
            was_cached: false,
            network_accessed: false,
            unused_since_prefetch: false,
            restricted_prefetch: false,
            single_keyed_cache_entry_unusable: false,
            async_revalidation_requested: false,
            stale_revalidate_timeout: None,
            vary_data: VaryData::default(),
            browser_run_id: None,
            cache_entry_status: CacheEntryStatus::Undefined,
        }
    }
}

impl ResponseInfo {
    pub fn status(&self) -> Option<StatusCode> {
        self.headers.as_ref().map(|h| h.status)
    }

    /// The status code, or 0 without headers
    pub(crate) fn status_u16(&self) -> u16 {
        self.status().map_or(0, |s| s.as_u16())
    }

    pub(crate) fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.as_ref().and_then(|h| h.header_str(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_entry_status_sticky() {
        let mut status = CacheEntryStatus::default();
        status.update(CacheEntryStatus::Used);
        assert_eq!(status, CacheEntryStatus::Used);
        status.update(CacheEntryStatus::Used);
        assert_eq!(status, CacheEntryStatus::Used);
        status.update(CacheEntryStatus::Validated);
        assert_eq!(status, CacheEntryStatus::Other);
        status.update(CacheEntryStatus::Updated);
        assert_eq!(status, CacheEntryStatus::Other);
        let name: &'static str = status.into();
        assert_eq!(name, "Other");
    }
}
