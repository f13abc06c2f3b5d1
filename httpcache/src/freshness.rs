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

//! Header driven freshness: lifetimes, age and the resulting validation need

use super::*;
use crate::cache_control::CacheDirectives;
use http::header::{AGE, DATE, EXPIRES, LAST_MODIFIED, PRAGMA};
use std::time::{Duration, SystemTime};

/// How much a cached response needs validating before it can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ValidationType {
    /// The response is fresh
    None,
    /// The response may be served now but should be revalidated in the background
    Asynchronous,
    /// The response must be validated before it is used
    Synchronous,
}

/// How long a response stays fresh, and how long after that it may be served stale while it is
/// revalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreshnessLifetimes {
    pub freshness: Duration,
    pub staleness: Duration,
}

/// Effectively forever
const MAX_FRESHNESS: Duration = Duration::from_secs(u32::MAX as u64);

/// Compute the freshness lifetimes of a response.
///
/// `response_time` stands in for a missing Date header.
pub fn freshness_lifetimes(resp: &ResponseHeader, response_time: SystemTime) -> FreshnessLifetimes {
    let mut lifetimes = FreshnessLifetimes::default();
    let cc = CacheDirectives::from_response(resp);

    // Pragma: no-cache is treated as a synonym of Cache-Control: no-cache
    if cc.as_ref().map_or(false, |cc| cc.forbids_reuse())
        || resp.has_header_value(PRAGMA, "no-cache")
    {
        return lifetimes;
    }

    let must_revalidate = cc.as_ref().map_or(false, |cc| cc.must_revalidate);
    if let Some(swr) = cc.as_ref().and_then(|cc| cc.stale_sec()) {
        lifetimes.staleness = Duration::from_secs(swr as u64);
    }

    // max-age overrides Expires
    if let Some(max_age) = cc.as_ref().and_then(|cc| cc.fresh_sec()) {
        lifetimes.freshness = Duration::from_secs(max_age as u64);
        return lifetimes;
    }

    let date = resp.header_time(DATE).unwrap_or(response_time);
    if resp.has_header(EXPIRES) {
        // an unparsable or past Expires means already expired
        if let Some(expires) = resp.header_time(EXPIRES) {
            if let Ok(fresh) = expires.duration_since(date) {
                lifetimes.freshness = fresh;
            }
        }
        return lifetimes;
    }

    let status = resp.status.as_u16();
    if matches!(status, 200 | 203 | 206) && !must_revalidate {
        if let Some(last_modified) = resp.header_time(LAST_MODIFIED) {
            // the last-modified value can be a date in the future
            if let Ok(since) = date.duration_since(last_modified) {
                lifetimes.freshness = since / 10;
                return lifetimes;
            }
        }
    }

    // implicitly fresh, and never stale
    if matches!(status, 300 | 301 | 308 | 410) {
        lifetimes.freshness = MAX_FRESHNESS;
        lifetimes.staleness = Duration::ZERO;
    }
    lifetimes
}

/// The current age of a response per RFC 7234 section 4.2.3.
pub fn current_age(
    resp: &ResponseHeader,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Duration {
    let date = resp.header_time(DATE).unwrap_or(response_time);
    let age_value = resp
        .header_str(AGE)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs);

    let apparent_age = response_time.duration_since(date).unwrap_or_default();
    let response_delay = response_time
        .duration_since(request_time)
        .unwrap_or_default();
    let corrected_initial_age = apparent_age.max(age_value + response_delay);
    let resident_time = now.duration_since(response_time).unwrap_or_default();
    corrected_initial_age + resident_time
}

/// Decide from the headers alone whether the response needs validating at `now`.
pub fn requires_validation_by_headers(
    resp: &ResponseHeader,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> ValidationType {
    let lifetimes = freshness_lifetimes(resp, response_time);
    if lifetimes.freshness.is_zero() && lifetimes.staleness.is_zero() {
        return ValidationType::Synchronous;
    }
    let age = current_age(resp, request_time, response_time, now);
    if lifetimes.freshness > age {
        return ValidationType::None;
    }
    if lifetimes.freshness.saturating_add(lifetimes.staleness) > age {
        return ValidationType::Asynchronous;
    }
    ValidationType::Synchronous
}
