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

//! Whether a stored response can be used as is, and how to validate it when it can't

use super::*;
use crate::freshness::{freshness_lifetimes, requires_validation_by_headers, ValidationType};
use crate::request::LoadFlags;
use crate::response::ResponseInfo;
use http::header::{HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, LAST_MODIFIED};
use std::time::{Duration, SystemTime};

/// Why a stored response has to be validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ValidationCause {
    /// The request selects a different variant than the stored one
    VaryMismatch,
    /// The caller asked for validation with [LoadFlags::VALIDATE_CACHE]
    ValidateFlag,
    /// The response outlived its freshness
    Stale,
    /// The response was never fresh
    ZeroFreshness,
}

/// The outcome of [ValidationPolicy::requires_validation()]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub kind: ValidationType,
    pub cause: Option<ValidationCause>,
    /// Set when the Vary fields don't match. Last-Modified alone can't validate the entry then.
    pub vary_mismatch: bool,
}

impl Validation {
    fn new(kind: ValidationType) -> Self {
        Validation {
            kind,
            cause: None,
            vary_mismatch: false,
        }
    }

    fn because(kind: ValidationType, cause: ValidationCause) -> Self {
        Validation {
            kind,
            cause: Some(cause),
            vary_mismatch: false,
        }
    }
}

/// Everything the validation decision depends on
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub method: &'a Method,
    pub request: &'a RequestHeader,
    pub load_flags: LoadFlags,
    pub response: &'a ResponseInfo,
    pub now: SystemTime,
}

/// The validation rules of a cache.
#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy {
    /// How long after a prefetch its first use skips validation
    pub prefetch_reuse: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy {
            prefetch_reuse: Duration::from_secs(5 * 60),
        }
    }
}

impl ValidationPolicy {
    pub fn new(prefetch_reuse: Duration) -> Self {
        ValidationPolicy { prefetch_reuse }
    }

    /// Decide how much validation the stored response needs before it can serve the request.
    ///
    /// This is a pure function of its input.
    pub fn requires_validation(&self, input: &ValidationInput) -> Validation {
        let response = input.response;
        let Some(headers) = response.headers.as_ref() else {
            // nothing to validate against, treat it like an expired response
            return Validation::new(ValidationType::Synchronous);
        };
        let flags = input.load_flags;

        if !flags.contains(LoadFlags::SKIP_VARY_CHECK)
            && response.vary_data.is_valid()
            && !response.vary_data.matches_request(input.request, headers)
        {
            let mut validation =
                Validation::because(ValidationType::Synchronous, ValidationCause::VaryMismatch);
            validation.vary_mismatch = true;
            return validation;
        }

        if flags.contains(LoadFlags::SKIP_CACHE_VALIDATION) {
            return Validation::new(ValidationType::None);
        }

        if matches!(*input.method, Method::PUT | Method::DELETE | Method::PATCH) {
            return Validation::new(ValidationType::Synchronous);
        }

        let validate_flag = flags.contains(LoadFlags::VALIDATE_CACHE);
        let by_headers = if validate_flag {
            ValidationType::Synchronous
        } else {
            requires_validation_by_headers(
                headers,
                response.request_time,
                response.response_time,
                input.now,
            )
        };

        if !flags.contains(LoadFlags::PREFETCH) {
            // a response from the future is never inside the window
            if let Ok(in_cache) = input.now.duration_since(response.response_time) {
                // the first use of a prefetched response skips validation
                if response.unused_since_prefetch && in_cache < self.prefetch_reuse {
                    return Validation::new(ValidationType::None);
                }
            }
        }

        if validate_flag {
            return Validation::because(ValidationType::Synchronous, ValidationCause::ValidateFlag);
        }

        let mut validation = Validation::new(by_headers);
        if by_headers != ValidationType::None {
            let lifetimes = freshness_lifetimes(headers, response.response_time);
            validation.cause = Some(if lifetimes.freshness.is_zero() {
                ValidationCause::ZeroFreshness
            } else {
                ValidationCause::Stale
            });
        }

        if by_headers == ValidationType::Asynchronous {
            // only a GET can be revalidated in the background
            if *input.method != Method::GET {
                validation.kind = ValidationType::Synchronous;
            } else if response
                .stale_revalidate_timeout
                .map_or(false, |deadline| deadline < input.now)
            {
                // the stale response was already served once and never revalidated
                validation.kind = ValidationType::Synchronous;
            }
        }
        validation
    }
}

/// The validators of a stored response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// The validators a conditional request for the stored response can use, if any.
///
/// Only 200 and 206 responses qualify. An ETag counts from HTTP/1.1.
pub fn is_response_conditionalizable(resp: &ResponseHeader) -> Option<Validators> {
    if resp.status != StatusCode::OK && resp.status != StatusCode::PARTIAL_CONTENT {
        return None;
    }
    let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());
    let etag = if resp.version >= Version::HTTP_11 {
        resp.header_str(ETAG).and_then(non_empty)
    } else {
        None
    };
    let last_modified = resp.header_str(LAST_MODIFIED).and_then(non_empty);
    if etag.is_none() && last_modified.is_none() {
        return None;
    }
    Some(Validators {
        etag,
        last_modified,
    })
}

/// The state of a range request being conditionalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValidation {
    pub current_range_cached: bool,
    pub invalid_range: bool,
}

fn set_validator(headers: &mut HMap, name: http::header::HeaderName, value: &str) {
    // the value was read out of a header
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Add the validators of `response` to the request `headers`.
///
/// Return false when the request can't be made conditional, then the stored response can only
/// be replaced.
pub fn conditionalize(
    response: &ResponseInfo,
    method: &Method,
    vary_mismatch: bool,
    range: Option<RangeValidation>,
    headers: &mut HMap,
) -> bool {
    if matches!(*method, Method::PUT | Method::DELETE | Method::PATCH) {
        return false;
    }
    let Some(Validators {
        etag,
        mut last_modified,
    }) = response
        .headers
        .as_ref()
        .and_then(is_response_conditionalizable)
    else {
        return false;
    };

    if vary_mismatch {
        // the dates of different variants can't be compared
        last_modified = None;
        if etag.is_none() {
            return false;
        }
    }

    let range_not_cached = range.map_or(false, |r| !r.current_range_cached);
    let use_if_range = range.map_or(false, |r| !r.current_range_cached && !r.invalid_range);

    if let Some(etag) = etag {
        let name = if use_if_range { IF_RANGE } else { IF_NONE_MATCH };
        set_validator(headers, name, &etag);
        // a sub range request is validated one way only
        if range_not_cached {
            return true;
        }
    }

    if let Some(last_modified) = last_modified {
        let name = if use_if_range {
            IF_RANGE
        } else {
            IF_MODIFIED_SINCE
        };
        set_validator(headers, name, &last_modified);
    }
    true
}

/// Whether the stored response is useless to a normal request: it can't be validated and is
/// never fresh.
pub fn compute_unusable_per_caching_headers(response: &ResponseInfo) -> bool {
    // a prefetched response gets one free use whatever its headers say
    if response.unused_since_prefetch {
        return false;
    }
    let Some(headers) = response.headers.as_ref() else {
        return false;
    };
    if is_response_conditionalizable(headers).is_some() {
        return false;
    }
    freshness_lifetimes(headers, response.response_time)
        .freshness
        .is_zero()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vary::VaryData;
    use http::header::CACHE_CONTROL;
    use once_cell::sync::Lazy;

    static NOW: Lazy<SystemTime> =
        Lazy::new(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));

    fn stored(cache_control: &str, age_secs: u64) -> ResponseInfo {
        let mut headers = ResponseHeader::build(200, None).unwrap();
        headers.insert_header(CACHE_CONTROL, cache_control).unwrap();
        headers.insert_header(ETAG, "\"e1\"").unwrap();
        let when = *NOW - Duration::from_secs(age_secs);
        headers
            .insert_header("date", httpdate::fmt_http_date(when))
            .unwrap();
        ResponseInfo {
            headers: Some(headers),
            request_time: when,
            response_time: when,
            ..Default::default()
        }
    }

    fn get() -> RequestHeader {
        RequestHeader::build("GET", "http://a.com/", None).unwrap()
    }

    fn check(response: &ResponseInfo, method: &Method, flags: LoadFlags) -> Validation {
        let request = get();
        ValidationPolicy::default().requires_validation(&ValidationInput {
            method,
            request: &request,
            load_flags: flags,
            response,
            now: *NOW,
        })
    }

    #[test]
    fn test_fresh_and_stale() {
        let fresh = stored("max-age=100", 10);
        let v = check(&fresh, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::None);
        assert_eq!(v.cause, None);

        let stale = stored("max-age=100", 200);
        let v = check(&stale, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Synchronous);
        assert_eq!(v.cause, Some(ValidationCause::Stale));

        let v = check(&stale, &Method::GET, LoadFlags::SKIP_CACHE_VALIDATION);
        assert_eq!(v.kind, ValidationType::None);

        let never_fresh = stored("no-cache", 0);
        let v = check(&never_fresh, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.cause, Some(ValidationCause::ZeroFreshness));

        let v = check(&fresh, &Method::GET, LoadFlags::VALIDATE_CACHE);
        assert_eq!(v.kind, ValidationType::Synchronous);
        assert_eq!(v.cause, Some(ValidationCause::ValidateFlag));

        let v = check(&fresh, &Method::DELETE, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Synchronous);
    }

    #[test]
    fn test_repeated_calls_agree() {
        let responses = [
            stored("max-age=100", 10),
            stored("max-age=10, stale-while-revalidate=100", 50),
        ];
        for response in responses {
            let first = check(&response, &Method::GET, LoadFlags::NORMAL);
            let second = check(&response, &Method::GET, LoadFlags::NORMAL);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_vary_mismatch_overrides_freshness() {
        let mut response = stored("max-age=1000", 0);
        response
            .headers
            .as_mut()
            .unwrap()
            .insert_header("vary", "accept-language")
            .unwrap();
        let mut english = get();
        english.insert_header("accept-language", "en").unwrap();
        response.vary_data = VaryData::init(&english, response.headers.as_ref().unwrap());

        let mut french = get();
        french.insert_header("accept-language", "fr").unwrap();
        let policy = ValidationPolicy::default();
        for flags in [LoadFlags::NORMAL, LoadFlags::SKIP_CACHE_VALIDATION] {
            let v = policy.requires_validation(&ValidationInput {
                method: &Method::GET,
                request: &french,
                load_flags: flags,
                response: &response,
                now: *NOW,
            });
            assert_eq!(v.kind, ValidationType::Synchronous);
            assert_eq!(v.cause, Some(ValidationCause::VaryMismatch));
            assert!(v.vary_mismatch);
        }

        let v = policy.requires_validation(&ValidationInput {
            method: &Method::GET,
            request: &french,
            load_flags: LoadFlags::SKIP_VARY_CHECK,
            response: &response,
            now: *NOW,
        });
        assert_eq!(v.kind, ValidationType::None);

        let v = policy.requires_validation(&ValidationInput {
            method: &Method::GET,
            request: &english,
            load_flags: LoadFlags::NORMAL,
            response: &response,
            now: *NOW,
        });
        assert_eq!(v.kind, ValidationType::None);
    }

    #[test]
    fn test_stale_while_revalidate() {
        let mut response = stored("max-age=10, stale-while-revalidate=100", 50);
        let v = check(&response, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Asynchronous);
        assert_eq!(v.cause, Some(ValidationCause::Stale));

        let v = check(&response, &Method::HEAD, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Synchronous);

        // served stale before and the deadline passed
        response.stale_revalidate_timeout = Some(*NOW - Duration::from_secs(1));
        let v = check(&response, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Synchronous);

        response.stale_revalidate_timeout = Some(*NOW + Duration::from_secs(30));
        let v = check(&response, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Asynchronous);
    }

    #[test]
    fn test_prefetch_reuse_window() {
        let mut response = stored("no-cache", 60);
        response.unused_since_prefetch = true;
        let v = check(&response, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::None);

        // another prefetch doesn't count as a use
        let v = check(&response, &Method::GET, LoadFlags::PREFETCH);
        assert_eq!(v.kind, ValidationType::Synchronous);

        let mut old = stored("no-cache", 600);
        old.unused_since_prefetch = true;
        let v = check(&old, &Method::GET, LoadFlags::NORMAL);
        assert_eq!(v.kind, ValidationType::Synchronous);
    }

    #[test]
    fn test_conditionalize() {
        let mut response = stored("max-age=0", 10);
        response
            .headers
            .as_mut()
            .unwrap()
            .insert_header("last-modified", "Tue, 14 Nov 2023 22:00:00 GMT")
            .unwrap();

        let mut headers = HMap::new();
        assert!(conditionalize(&response, &Method::GET, false, None, &mut headers));
        assert_eq!(header_str(&headers, IF_NONE_MATCH), Some("\"e1\""));
        assert_eq!(
            header_str(&headers, IF_MODIFIED_SINCE),
            Some("Tue, 14 Nov 2023 22:00:00 GMT")
        );

        let mut headers = HMap::new();
        assert!(!conditionalize(&response, &Method::PUT, false, None, &mut headers));
        assert!(headers.is_empty());

        // a missing sub range uses If-Range with the ETag only
        let mut headers = HMap::new();
        let range = RangeValidation {
            current_range_cached: false,
            invalid_range: false,
        };
        assert!(conditionalize(&response, &Method::GET, false, Some(range), &mut headers));
        assert_eq!(header_str(&headers, IF_RANGE), Some("\"e1\""));
        assert!(!headers.contains_key(IF_NONE_MATCH));
        assert!(!headers.contains_key(IF_MODIFIED_SINCE));

        // vary mismatch without an ETag
        response.headers.as_mut().unwrap().remove_header("etag");
        let mut headers = HMap::new();
        assert!(!conditionalize(&response, &Method::GET, true, None, &mut headers));
        assert!(conditionalize(&response, &Method::GET, false, None, &mut headers));
        assert!(headers.contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn test_conditionalizable() {
        let mut resp = ResponseHeader::build(404, None).unwrap();
        resp.insert_header("etag", "\"x\"").unwrap();
        assert!(is_response_conditionalizable(&resp).is_none());

        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.insert_header("etag", "\"x\"").unwrap();
        assert_eq!(
            is_response_conditionalizable(&resp).unwrap().etag.as_deref(),
            Some("\"x\"")
        );
        resp.set_version(Version::HTTP_10);
        assert!(is_response_conditionalizable(&resp).is_none());
    }

    #[test]
    fn test_unusable_per_caching_headers() {
        let mut response = stored("no-cache", 0);
        assert!(!compute_unusable_per_caching_headers(&response));
        response.headers.as_mut().unwrap().remove_header("etag");
        assert!(compute_unusable_per_caching_headers(&response));
        response.unused_since_prefetch = true;
        assert!(!compute_unusable_per_caching_headers(&response));

        // no validators and no freshness information at all
        let bare = ResponseInfo {
            headers: Some(ResponseHeader::build(200, None).unwrap()),
            ..stored("max-age=60", 0)
        };
        assert!(compute_unusable_per_caching_headers(&bare));
    }
}
