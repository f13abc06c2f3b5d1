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

//! The response record persisted in stream 0 of an entry

use super::*;
use crate::key::HashBinary;
use crate::response::ResponseInfo;
use crate::vary::VaryData;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Hop-by-hop headers that are never persisted
const TRANSIENT_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A stored response: its [ResponseInfo] plus whether the stored body is incomplete.
#[derive(Debug, Clone)]
pub struct CachedResponseRecord {
    pub info: ResponseInfo,
    /// The body write was interrupted, the entry can be resumed with a range request
    pub truncated: bool,
}

impl CachedResponseRecord {
    pub fn new(info: ResponseInfo, truncated: bool) -> Self {
        CachedResponseRecord { info, truncated }
    }

    /// Encode the record in the latest format. Transient headers are dropped.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let Some(headers) = self.info.headers.as_ref() else {
            return Error::e_explain(InternalError, "no response headers to persist");
        };
        let record = internal_record::RecordLatest {
            version: internal_record::RecordLatest::VERSION,
            status: headers.status.as_u16(),
            http_version: version_to_u8(headers.version),
            headers: header_pairs(headers),
            request_time: self.info.request_time,
            response_time: self.info.response_time,
            truncated: self.truncated,
            unused_since_prefetch: self.info.unused_since_prefetch,
            restricted_prefetch: self.info.restricted_prefetch,
            single_keyed_cache_entry_unusable: self.info.single_keyed_cache_entry_unusable,
            vary: self.info.vary_data.digest(),
            stale_revalidate_timeout: self.info.stale_revalidate_timeout,
            browser_run_id: self.info.browser_run_id,
        };
        record.serialize()
    }

    /// Decode a record written by any known version.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let record = internal_record::deserialize(buf)?;
        let mut headers = ResponseHeader::build(record.status, Some(record.headers.len()))
            .or_err(CacheReadFailure, "invalid stored status")?;
        headers.set_version(version_from_u8(record.http_version));
        for (name, value) in record.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .or_err(CacheReadFailure, "invalid stored header name")?;
            let value = HeaderValue::from_bytes(&value)
                .or_err(CacheReadFailure, "invalid stored header value")?;
            headers.append_header(name, value)?;
        }
        let info = ResponseInfo {
            headers: Some(headers),
            request_time: record.request_time,
            response_time: record.response_time,
            unused_since_prefetch: record.unused_since_prefetch,
            restricted_prefetch: record.restricted_prefetch,
            single_keyed_cache_entry_unusable: record.single_keyed_cache_entry_unusable,
            vary_data: VaryData::from_digest(record.vary),
            stale_revalidate_timeout: record.stale_revalidate_timeout,
            browser_run_id: record.browser_run_id,
            ..Default::default()
        };
        Ok(CachedResponseRecord {
            info,
            truncated: record.truncated,
        })
    }
}

fn header_pairs(headers: &ResponseHeader) -> Vec<(String, Vec<u8>)> {
    headers
        .headers
        .iter()
        .filter(|(name, _)| !TRANSIENT_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
        .collect()
}

fn version_to_u8(version: Version) -> u8 {
    match version {
        Version::HTTP_09 => 9,
        Version::HTTP_10 => 10,
        Version::HTTP_2 => 20,
        Version::HTTP_3 => 30,
        _ => 11,
    }
}

fn version_from_u8(version: u8) -> Version {
    match version {
        9 => Version::HTTP_09,
        10 => Version::HTTP_10,
        20 => Version::HTTP_2,
        30 => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

mod internal_record {
    use super::*;

    pub(crate) type RecordLatest = RecordV1;

    #[derive(Debug, Deserialize, Serialize, Clone)]
    pub(crate) struct RecordV0 {
        pub(crate) status: u16,
        pub(crate) http_version: u8,
        pub(crate) headers: Vec<(String, Vec<u8>)>,
        pub(crate) request_time: SystemTime,
        pub(crate) response_time: SystemTime,
        pub(crate) truncated: bool,
        pub(crate) unused_since_prefetch: bool,
        pub(crate) restricted_prefetch: bool,
        pub(crate) single_keyed_cache_entry_unusable: bool,
        pub(crate) vary: Option<HashBinary>,
        pub(crate) stale_revalidate_timeout: Option<SystemTime>,
        // Do not add more field
    }

    impl RecordV0 {
        /// The number of fields, which is how a v0 record is told apart
        const FIELDS: u32 = 11;

        #[allow(dead_code)]
        pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
            rmp_serde::encode::to_vec(self).or_err(InternalError, "failed to encode record")
        }

        fn deserialize(buf: &[u8]) -> Result<Self> {
            rmp_serde::decode::from_slice(buf).or_err(CacheReadFailure, "failed to decode record v0")
        }
    }

    #[derive(Debug, Deserialize, Serialize, Clone)]
    pub(crate) struct RecordV1 {
        pub(crate) version: u8,
        pub(crate) status: u16,
        pub(crate) http_version: u8,
        pub(crate) headers: Vec<(String, Vec<u8>)>,
        pub(crate) request_time: SystemTime,
        pub(crate) response_time: SystemTime,
        pub(crate) truncated: bool,
        pub(crate) unused_since_prefetch: bool,
        pub(crate) restricted_prefetch: bool,
        pub(crate) single_keyed_cache_entry_unusable: bool,
        pub(crate) vary: Option<HashBinary>,
        pub(crate) stale_revalidate_timeout: Option<SystemTime>,
        // Only the extended field to be added below. One field at a time.
        #[serde(default)]
        pub(crate) browser_run_id: Option<i64>,
    }

    impl RecordV1 {
        pub const VERSION: u8 = 1;

        pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
            if self.version != Self::VERSION {
                return Error::e_explain(InternalError, "wrong record version");
            }
            rmp_serde::encode::to_vec(self).or_err(InternalError, "failed to encode record")
        }

        fn deserialize(buf: &[u8]) -> Result<Self> {
            rmp_serde::decode::from_slice(buf).or_err(CacheReadFailure, "failed to decode record v1")
        }
    }

    impl From<RecordV0> for RecordV1 {
        fn from(v0: RecordV0) -> Self {
            RecordV1 {
                version: RecordV1::VERSION,
                status: v0.status,
                http_version: v0.http_version,
                headers: v0.headers,
                request_time: v0.request_time,
                response_time: v0.response_time,
                truncated: v0.truncated,
                unused_since_prefetch: v0.unused_since_prefetch,
                restricted_prefetch: v0.restricted_prefetch,
                single_keyed_cache_entry_unusable: v0.single_keyed_cache_entry_unusable,
                vary: v0.vary,
                stale_revalidate_timeout: v0.stale_revalidate_timeout,
                browser_run_id: None,
            }
        }
    }

    // cross version decode
    pub(crate) fn deserialize(buf: &[u8]) -> Result<RecordLatest> {
        const MIN_SIZE: usize = 2; // array marker plus the version fixint
        if buf.len() < MIN_SIZE {
            return Error::e_explain(
                CacheReadFailure,
                format!("Buf too short ({}) to be a record", buf.len()),
            );
        }
        let preread_buf = &mut &buf[..];
        // the struct is always packed as a fixed size array
        match rmp::decode::read_array_len(preread_buf)
            .or_err(CacheReadFailure, "failed to decode record array size")?
        {
            RecordV0::FIELDS => Ok(RecordV0::deserialize(buf)?.into()),
            _ => {
                // rmp encodes `version` < 128 into a fixint (one byte)
                let version = rmp::decode::read_pfix(preread_buf)
                    .or_err(CacheReadFailure, "failed to decode record version")?;
                match version {
                    1 => RecordV1::deserialize(buf),
                    _ => Error::e_explain(
                        CacheReadFailure,
                        format!("Unknown record version {version}"),
                    ),
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        fn v0() -> RecordV0 {
            RecordV0 {
                status: 200,
                http_version: 11,
                headers: vec![("etag".into(), b"\"a\"".to_vec())],
                request_time: SystemTime::UNIX_EPOCH + Duration::from_secs(10),
                response_time: SystemTime::UNIX_EPOCH + Duration::from_secs(11),
                truncated: true,
                unused_since_prefetch: false,
                restricted_prefetch: false,
                single_keyed_cache_entry_unusable: false,
                vary: None,
                stale_revalidate_timeout: None,
            }
        }

        #[test]
        fn test_record_v0_upgrade() {
            let binary = v0().serialize().unwrap();
            let record = deserialize(&binary).unwrap();
            assert_eq!(record.version, RecordV1::VERSION);
            assert!(record.truncated);
            assert_eq!(record.browser_run_id, None);
            assert_eq!(record.headers[0].0, "etag");
        }

        #[test]
        fn test_record_v1() {
            let mut record: RecordV1 = v0().into();
            record.browser_run_id = Some(7);
            record.vary = Some([1; 16]);
            let binary = record.serialize().unwrap();
            let record2 = deserialize(&binary).unwrap();
            assert_eq!(record2.browser_run_id, Some(7));
            assert_eq!(record2.vary, Some([1; 16]));
            assert_eq!(record2.response_time, record.response_time);
        }

        #[test]
        fn test_garbage() {
            assert!(deserialize(b"").is_err());
            assert!(deserialize(b"\x93\x05\x01\x02").is_err());
            assert!(deserialize(b"not msgpack").is_err());
        }
    }
}
