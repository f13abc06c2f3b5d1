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

//! Byte range bookkeeping of one transaction
//!
//! A range request, or any request served from a sparse or truncated entry, is handled as a
//! sequence of sub ranges. Each sub range is either read from the cache or fetched from the
//! network. [PartialData] tracks where the transaction currently is within the requested range
//! and what the cache holds from there on.

use super::*;
use crate::range::{parse_content_range, parse_range_header, ByteRange, ContentRange};
use crate::storage::{StorageEntry, BODY_INDEX};
use crate::writers::WriteTarget;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};

/// Unbounded sub ranges are clamped to this length when asking storage what it holds
const MAX_RANGE_LEN: u64 = i32::MAX as u64;

#[derive(Debug)]
pub(crate) struct PartialData {
    // None until a suffix range is resolved
    current_range_start: Option<u64>,
    current_range_end: Option<u64>,
    cached_start: u64,
    resource_size: u64,
    cached_min_len: u64,
    byte_range: ByteRange,
    // the range as the caller asked for it
    user_byte_range: ByteRange,
    extra_headers: HMap,
    range_requested: bool,
    range_present: bool,
    final_range: bool,
    sparse_entry: bool,
    truncated: bool,
    initial_validation: bool,
}

impl Default for PartialData {
    fn default() -> Self {
        PartialData {
            current_range_start: None,
            current_range_end: None,
            cached_start: 0,
            resource_size: 0,
            cached_min_len: 0,
            byte_range: ByteRange::default(),
            user_byte_range: ByteRange::default(),
            extra_headers: HMap::new(),
            range_requested: false,
            range_present: false,
            final_range: false,
            sparse_entry: true,
            truncated: false,
            initial_validation: false,
        }
    }
}

fn set_range(headers: &mut HMap, range: &ByteRange) {
    // digits and dashes are always a valid header value
    if let Ok(value) = HeaderValue::from_str(&range.header_value()) {
        headers.insert(RANGE, value);
    }
}

impl PartialData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up the tracker from the `Range` header of the request.
    ///
    /// Return false when there is no range, or when it is one this cache can't handle
    /// (multiple ranges, an invalid spec).
    pub fn init(&mut self, headers: &HMap) -> bool {
        let Some(value) = header_str(headers, RANGE) else {
            self.range_requested = false;
            return false;
        };
        self.range_requested = true;
        let ranges = match parse_range_header(value) {
            Some(ranges) if ranges.len() == 1 => ranges,
            _ => return false,
        };
        self.byte_range = ranges[0];
        self.user_byte_range = self.byte_range;
        if !self.byte_range.is_valid() {
            return false;
        }
        self.current_range_start = self.byte_range.first();
        trace!(
            "range start: {:?} end: {:?}",
            self.current_range_start,
            self.byte_range.last()
        );
        true
    }

    /// The request headers to send, minus `Range`
    pub fn set_headers(&mut self, headers: HMap) {
        self.extra_headers = headers;
    }

    /// Rebuild the request headers for a request of everything left of the range.
    pub fn restore_headers(&self, headers: &mut HMap) {
        *headers = self.extra_headers.clone();
        if self.truncated || !self.byte_range.is_valid() {
            return;
        }
        let end = match self.byte_range.suffix_length() {
            Some(suffix) => Some(suffix),
            None => self.byte_range.last(),
        };
        let range = match (self.current_range_start, end) {
            (None, Some(end)) => ByteRange::suffix(end),
            (Some(start), end) => ByteRange::bounded(start, end),
            (None, None) => return,
        };
        set_range(headers, &range);
    }

    fn next_range_len(&self) -> u64 {
        let current = self.current_range_start.unwrap_or(0);
        match self.byte_range.last() {
            Some(last) => last
                .saturating_add(1)
                .saturating_sub(current)
                .min(MAX_RANGE_LEN),
            None => MAX_RANGE_LEN,
        }
    }

    /// Look up how much of the next sub range the entry holds.
    ///
    /// Return `Ok(0)` when the whole range has been served and `Ok(1)` when there is more to do.
    pub async fn should_validate_cache(&mut self, entry: &dyn StorageEntry) -> Result<usize> {
        let mut len = self.next_range_len();
        if len == 0 {
            return Ok(0);
        }
        self.range_present = false;
        let current = self.current_range_start.unwrap_or(0);
        if self.sparse_entry {
            let available = entry.get_available_range(current, len).await?;
            self.cached_min_len = available.len;
            self.cached_start = available.start;
        } else if !self.truncated {
            if self
                .byte_range
                .first()
                .map_or(false, |first| first >= self.resource_size)
            {
                len = 0;
            }
            self.cached_min_len = len;
            self.cached_start = current;
        }
        Ok(1)
    }

    /// Write the `Range` of the request for the next sub range into `headers`.
    ///
    /// The sub range either is the stored run at the current position, or stops right before the
    /// next stored run.
    pub fn prepare_cache_validation(&mut self, headers: &mut HMap) {
        let len = self.next_range_len();
        self.range_present = false;
        *headers = self.extra_headers.clone();

        if self.cached_min_len == 0 {
            // nothing else is stored
            self.final_range = true;
            self.cached_start = self
                .byte_range
                .last()
                .map_or(0, |last| last.saturating_add(1));
        }

        let current = self.current_range_start.unwrap_or(0);
        if self.cached_min_len > 0 && current == self.cached_start {
            self.range_present = true;
            self.current_range_end = Some(self.cached_start + self.cached_min_len - 1);
            if len == self.cached_min_len {
                self.final_range = true;
            }
        } else {
            self.current_range_end = self.cached_start.checked_sub(1);
        }
        set_range(
            headers,
            &ByteRange::bounded(current, self.current_range_end),
        );
    }

    /// Whether the current sub range is served from the cache
    pub fn is_current_range_cached(&self) -> bool {
        self.range_present
    }

    pub fn is_last_range(&self) -> bool {
        self.final_range
    }

    /// Reconcile the range with the stored response.
    ///
    /// Return false when the stored response can't be used to serve the range, so the entry has
    /// to be replaced.
    pub fn update_from_stored_headers(
        &mut self,
        headers: &ResponseHeader,
        entry: &dyn StorageEntry,
        truncated: bool,
        writing_in_progress: bool,
    ) -> bool {
        self.resource_size = 0;
        if truncated {
            // a truncated entry is resumed with a range of its own, the caller can't have one
            if self.byte_range.is_valid() {
                return false;
            }
            if !headers.has_strong_validators() {
                return false;
            }
            let total_length = match headers.content_length() {
                Some(len) if len > 0 => len,
                _ => return false,
            };
            // a one byte request with If-Range tells whether the server can resume
            self.truncated = true;
            self.initial_validation = true;
            self.sparse_entry = false;
            let current_len = entry.data_size(BODY_INDEX);
            self.byte_range.set_first(current_len);
            self.resource_size = total_length;
            self.current_range_start = Some(current_len);
            self.cached_min_len = current_len;
            self.cached_start = current_len + 1;
            return true;
        }

        self.sparse_entry = headers.status == StatusCode::PARTIAL_CONTENT;
        if writing_in_progress || self.sparse_entry {
            // the stored body is incomplete or sparse, only Content-Length knows the size
            match headers.content_length() {
                Some(len) if len > 0 => self.resource_size = len,
                _ => return false,
            }
        } else {
            self.resource_size = entry.data_size(BODY_INDEX);
        }
        trace!("update from stored headers, size: {}", self.resource_size);

        if self.sparse_entry {
            // cached and network data get stitched together
            return headers.has_strong_validators();
        }
        true
    }

    /// Restart a truncated entry download from the first byte.
    pub fn set_range_to_start_download(&mut self) {
        self.current_range_start = Some(0);
        self.cached_start = 0;
        self.initial_validation = false;
    }

    /// Whether the requested range can be satisfied by a resource of the known size.
    pub fn is_requested_range_ok(&mut self) -> bool {
        if self.byte_range.is_valid() {
            if !self.byte_range.compute_bounds(self.resource_size) {
                return false;
            }
            if self.truncated {
                return true;
            }
            if self.current_range_start.is_none() {
                self.current_range_start = self.byte_range.first();
            }
        } else {
            // no range asked for, but the stored data is partial
            self.current_range_start = Some(0);
            if let Some(last) = self.resource_size.checked_sub(1) {
                self.byte_range.set_last(last);
            }
        }
        if self.current_range_start.is_none() {
            self.current_range_start = Some(0);
            return false;
        }
        true
    }

    /// Whether a 304 or 206 from the server fits the sub range that was asked for.
    pub fn response_headers_ok(&mut self, headers: &ResponseHeader) -> bool {
        if headers.status == StatusCode::NOT_MODIFIED {
            if !self.byte_range.is_valid() || self.truncated {
                return true;
            }
            // the range has to be complete
            return self.byte_range.first().is_some() && self.byte_range.last().is_some();
        }

        let Some(content_range) = headers
            .header_str(CONTENT_RANGE)
            .and_then(parse_content_range)
        else {
            return false;
        };
        let ContentRange { first, last, total } = content_range;
        if total == 0 {
            return false;
        }
        // servers don't always send Content-Length with a 206
        if let Some(len) = headers.content_length() {
            if len > 0 && len != content_range.len() {
                return false;
            }
        }

        if self.resource_size == 0 {
            // the first response tells the size
            self.resource_size = total;
            if self.byte_range.first().is_none() {
                self.byte_range.set_first(first);
                self.current_range_start = Some(first);
            }
            match self.byte_range.last() {
                None => self.byte_range.set_last(last),
                // the requested end can lie past the end of the resource
                Some(requested) if requested >= total => self.byte_range.set_last(total - 1),
                Some(_) => {}
            }
        } else if self.resource_size != total {
            return false;
        }

        if self.truncated && self.byte_range.last().is_none() {
            self.byte_range.set_last(last);
        }

        if Some(first) != self.current_range_start {
            return false;
        }
        if self.byte_range.last().map_or(false, |l| last > l) {
            return false;
        }
        true
    }

    /// Rewrite the response for the caller so it describes the requested range as one response.
    ///
    /// Without `success` the response becomes a 416.
    pub fn fix_response_headers(&self, headers: &mut ResponseHeader, success: bool) -> Result<()> {
        if self.truncated {
            return Ok(());
        }
        if !success {
            headers.replace_status(StatusCode::RANGE_NOT_SATISFIABLE);
            headers.insert_header(CONTENT_RANGE, format!("bytes */{}", self.resource_size))?;
            headers.insert_header(CONTENT_LENGTH, "0")?;
            return Ok(());
        }

        let range_len = if self.range_requested {
            let (Some(first), Some(last)) = (self.byte_range.first(), self.byte_range.last())
            else {
                return Error::e_explain(InvalidRange, "range bounds not resolved");
            };
            let content_range = ContentRange {
                first,
                last,
                total: self.resource_size,
            };
            headers.insert_header(CONTENT_RANGE, content_range.header_value())?;
            if !self.sparse_entry {
                headers.replace_status(StatusCode::PARTIAL_CONTENT);
            }
            content_range.len()
        } else {
            headers.replace_status(StatusCode::OK);
            headers.remove_header(&CONTENT_RANGE);
            self.resource_size
        };
        headers.insert_header(CONTENT_LENGTH, range_len.to_string())
    }

    /// Store the size of the whole resource as the Content-Length of a stored 206.
    pub fn fix_content_length(&self, headers: &mut ResponseHeader) -> Result<()> {
        headers.insert_header(CONTENT_LENGTH, self.resource_size.to_string())
    }

    /// Read the stored part of the current sub range.
    pub async fn cache_read(&self, entry: &dyn StorageEntry, buf: &mut [u8]) -> Result<usize> {
        let read_len = (buf.len() as u64).min(self.cached_min_len) as usize;
        if read_len == 0 {
            return Ok(0);
        }
        let current = self.current_range_start.unwrap_or(0);
        if self.sparse_entry {
            entry.read_sparse_data(current, &mut buf[..read_len]).await
        } else {
            entry
                .read_data(BODY_INDEX, current, &mut buf[..read_len])
                .await
        }
    }

    /// Where the network bytes of the current sub range go in the entry
    pub fn cache_write_target(&self) -> WriteTarget {
        let current = self.current_range_start.unwrap_or(0);
        if self.sparse_entry {
            WriteTarget::Sparse(current)
        } else {
            WriteTarget::Stream(current)
        }
    }

    pub fn on_cache_read_completed(&mut self, read: usize) {
        if read > 0 {
            let read = read as u64;
            self.current_range_start = Some(self.current_range_start.unwrap_or(0) + read);
            self.cached_min_len = self.cached_min_len.saturating_sub(read);
        }
    }

    pub fn on_network_read_completed(&mut self, read: usize) {
        if read > 0 {
            self.current_range_start = Some(self.current_range_start.unwrap_or(0) + read as u64);
        }
    }

    /// Whether the caller sent a `Range` header
    pub fn range_requested(&self) -> bool {
        self.range_requested
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Whether the pending network request is the one byte check of a truncated entry
    pub fn initial_validation(&self) -> bool {
        self.initial_validation
    }

    pub fn resource_size(&self) -> u64 {
        self.resource_size
    }

    /// The range as requested by the caller, before it was resolved
    pub fn user_byte_range(&self) -> &ByteRange {
        &self.user_byte_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemStorage;
    use crate::storage::{EntryRef, Storage};

    fn range_headers(range: &str) -> HMap {
        let mut headers = HMap::new();
        headers.insert(RANGE, HeaderValue::from_str(range).unwrap());
        headers
    }

    fn stored_206(total: u64) -> ResponseHeader {
        let mut resp = ResponseHeader::build(206, None).unwrap();
        resp.insert_header("etag", "\"abc\"").unwrap();
        resp.insert_header("content-length", total.to_string())
            .unwrap();
        resp
    }

    fn response_206(first: u64, last: u64, total: u64) -> ResponseHeader {
        let mut resp = ResponseHeader::build(206, None).unwrap();
        resp.insert_header("content-range", format!("bytes {first}-{last}/{total}"))
            .unwrap();
        resp.insert_header("content-length", (last - first + 1).to_string())
            .unwrap();
        resp
    }

    async fn sparse_entry(chunks: &[(u64, usize)]) -> EntryRef {
        let storage = MemStorage::new();
        let entry = storage
            .create_entry(&CacheKey::from_string("partial"))
            .await
            .unwrap();
        for (offset, len) in chunks {
            entry
                .write_sparse_data(*offset, &vec![b'x'; *len])
                .await
                .unwrap();
        }
        entry
    }

    #[test]
    fn test_init() {
        let mut partial = PartialData::new();
        assert!(!partial.init(&HMap::new()));
        assert!(!partial.range_requested());

        let mut partial = PartialData::new();
        assert!(!partial.init(&range_headers("bytes=0-1,4-5")));
        assert!(partial.range_requested());

        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=10-19")));
        assert_eq!(partial.current_range_start, Some(10));

        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=-30")));
        assert_eq!(partial.current_range_start, None);
    }

    #[test]
    fn test_restore_headers() {
        let mut partial = PartialData::new();
        let headers = range_headers("bytes=100-199");
        assert!(partial.init(&headers));
        let mut extra = HMap::new();
        extra.insert("x-extra", HeaderValue::from_static("1"));
        partial.set_headers(extra);

        partial.on_network_read_completed(20);
        let mut restored = HMap::new();
        partial.restore_headers(&mut restored);
        assert_eq!(header_str(&restored, RANGE), Some("bytes=120-199"));
        assert_eq!(header_str(&restored, "x-extra"), Some("1"));

        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=-30")));
        let mut restored = HMap::new();
        partial.restore_headers(&mut restored);
        assert_eq!(header_str(&restored, RANGE), Some("bytes=-30"));
    }

    #[tokio::test]
    async fn test_sparse_validation_walk() {
        // bytes 100..=149 are stored
        let entry = sparse_entry(&[(100, 50)]).await;
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=100-199")));
        assert!(partial.update_from_stored_headers(&stored_206(1000), entry.as_ref(), false, false));
        assert_eq!(partial.resource_size(), 1000);
        assert!(partial.is_requested_range_ok());

        // the first sub range is in the cache
        assert_eq!(partial.should_validate_cache(entry.as_ref()).await.unwrap(), 1);
        let mut headers = HMap::new();
        partial.prepare_cache_validation(&mut headers);
        assert!(partial.is_current_range_cached());
        assert!(!partial.is_last_range());
        assert_eq!(header_str(&headers, RANGE), Some("bytes=100-149"));

        let mut buf = [0u8; 80];
        let n = partial.cache_read(entry.as_ref(), &mut buf).await.unwrap();
        assert_eq!(n, 50);
        partial.on_cache_read_completed(n);
        assert_eq!(partial.cache_read(entry.as_ref(), &mut buf).await.unwrap(), 0);

        // the rest comes from the network
        assert_eq!(partial.should_validate_cache(entry.as_ref()).await.unwrap(), 1);
        partial.prepare_cache_validation(&mut headers);
        assert!(!partial.is_current_range_cached());
        assert!(partial.is_last_range());
        assert_eq!(header_str(&headers, RANGE), Some("bytes=150-199"));
        assert_eq!(partial.cache_write_target(), WriteTarget::Sparse(150));

        assert!(partial.response_headers_ok(&response_206(150, 199, 1000)));
        partial.on_network_read_completed(50);
        assert_eq!(partial.should_validate_cache(entry.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gap_before_cached_run() {
        let entry = sparse_entry(&[(50, 10)]).await;
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=0-99")));
        assert!(partial.update_from_stored_headers(&stored_206(100), entry.as_ref(), false, false));
        assert!(partial.is_requested_range_ok());
        partial.should_validate_cache(entry.as_ref()).await.unwrap();
        let mut headers = HMap::new();
        partial.prepare_cache_validation(&mut headers);
        assert!(!partial.is_current_range_cached());
        assert_eq!(header_str(&headers, RANGE), Some("bytes=0-49"));
        // the server answers for a different start
        assert!(!partial.response_headers_ok(&response_206(10, 49, 100)));
    }

    #[tokio::test]
    async fn test_truncated_entry() {
        let storage = MemStorage::new();
        let entry = storage
            .create_entry(&CacheKey::from_string("truncated"))
            .await
            .unwrap();
        entry.write_data(BODY_INDEX, 0, &[1; 40], true).await.unwrap();

        let mut stored = ResponseHeader::build(200, None).unwrap();
        stored.insert_header("etag", "\"v1\"").unwrap();
        stored.insert_header("content-length", "100").unwrap();

        // a caller range can't be mixed with resuming
        let mut partial = PartialData::new();
        partial.init(&range_headers("bytes=0-9"));
        assert!(!partial.update_from_stored_headers(&stored, entry.as_ref(), true, false));

        let mut partial = PartialData::new();
        assert!(!partial.init(&HMap::new()));
        assert!(partial.update_from_stored_headers(&stored, entry.as_ref(), true, false));
        assert!(partial.is_truncated());
        assert!(partial.initial_validation());
        assert!(partial.is_requested_range_ok());

        // one byte request right after the stored data
        assert_eq!(partial.should_validate_cache(entry.as_ref()).await.unwrap(), 1);
        let mut headers = HMap::new();
        partial.prepare_cache_validation(&mut headers);
        assert_eq!(header_str(&headers, RANGE), Some("bytes=40-40"));
        assert_eq!(partial.cache_write_target(), WriteTarget::Stream(40));

        partial.set_range_to_start_download();
        assert!(!partial.initial_validation());
        assert_eq!(partial.current_range_start, Some(0));

        // truncated responses are passed through untouched
        let mut resp = ResponseHeader::build(200, None).unwrap();
        partial.fix_response_headers(&mut resp, false).unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_weak_sparse_entry_rejected() {
        let entry = sparse_entry(&[(0, 10)]).await;
        let mut stored = ResponseHeader::build(206, None).unwrap();
        stored.insert_header("etag", "W/\"weak\"").unwrap();
        stored.insert_header("content-length", "100").unwrap();
        let mut partial = PartialData::new();
        partial.init(&range_headers("bytes=0-9"));
        assert!(!partial.update_from_stored_headers(&stored, entry.as_ref(), false, false));
    }

    #[test]
    fn test_response_headers_ok_new_entry() {
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=0-99")));
        // the Content-Length has to match the range
        let mut bad = response_206(0, 99, 1000);
        bad.insert_header("content-length", "10").unwrap();
        assert!(!partial.response_headers_ok(&bad));

        assert!(partial.response_headers_ok(&response_206(0, 99, 1000)));
        assert_eq!(partial.resource_size(), 1000);
        // an unknown total is not acceptable
        let mut unknown = ResponseHeader::build(206, None).unwrap();
        unknown
            .insert_header("content-range", "bytes 0-99/*")
            .unwrap();
        assert!(!partial.response_headers_ok(&unknown));

        let not_modified = ResponseHeader::build(304, None).unwrap();
        assert!(partial.response_headers_ok(&not_modified));
    }

    #[test]
    fn test_suffix_range_resolved_by_server() {
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=-100")));
        assert!(partial.response_headers_ok(&response_206(900, 999, 1000)));
        assert_eq!(partial.current_range_start, Some(900));
        assert_eq!(partial.cache_write_target(), WriteTarget::Sparse(900));
    }

    #[test]
    fn test_range_end_past_resource() {
        for range in ["bytes=0-1000000", "bytes=0-18446744073709551615"] {
            let mut partial = PartialData::new();
            assert!(partial.init(&range_headers(range)));
            assert!(partial.response_headers_ok(&response_206(0, 99, 100)));
            assert_eq!(partial.byte_range.last(), Some(99));

            let mut resp = response_206(0, 99, 100);
            partial.fix_response_headers(&mut resp, true).unwrap();
            assert_eq!(resp.header_str("content-range"), Some("bytes 0-99/100"));
            assert_eq!(resp.content_length(), Some(100));

            // nothing is left to fetch once the resource is served
            partial.on_network_read_completed(100);
            assert_eq!(partial.next_range_len(), 0);
        }

        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=50-18446744073709551615")));
        assert_eq!(partial.next_range_len(), MAX_RANGE_LEN);
        partial.cached_min_len = 0;
        let mut headers = HMap::new();
        partial.prepare_cache_validation(&mut headers);
        assert!(partial.is_last_range());
    }

    #[test]
    fn test_fix_response_headers() {
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=10-19")));
        partial.resource_size = 100;
        assert!(partial.is_requested_range_ok());

        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.insert_header("content-length", "100").unwrap();
        partial.sparse_entry = false;
        partial.fix_response_headers(&mut resp, true).unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.header_str("content-range"), Some("bytes 10-19/100"));
        assert_eq!(resp.content_length(), Some(10));

        let mut resp = ResponseHeader::build(200, None).unwrap();
        partial.fix_response_headers(&mut resp, false).unwrap();
        assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.header_str("content-range"), Some("bytes */100"));
        assert_eq!(resp.content_length(), Some(0));

        // a whole resource request served from a sparse entry looks like a 200
        let mut whole = PartialData::new();
        whole.resource_size = 100;
        let mut resp = stored_206(100);
        resp.insert_header("content-range", "bytes 0-9/100").unwrap();
        whole.fix_response_headers(&mut resp, true).unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert!(!resp.has_header("content-range"));
        assert_eq!(resp.content_length(), Some(100));

        let mut stored = ResponseHeader::build(206, None).unwrap();
        partial.fix_content_length(&mut stored).unwrap();
        assert_eq!(stored.content_length(), Some(100));
    }

    #[test]
    fn test_requested_range_out_of_bounds() {
        let mut partial = PartialData::new();
        assert!(partial.init(&range_headers("bytes=200-")));
        partial.resource_size = 100;
        assert!(!partial.is_requested_range_ok());
    }
}
