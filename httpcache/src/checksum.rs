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

//! Integrity checksum of single-keyed cache responses

use super::*;
use sha2::{Digest, Sha256};

// The headers that change how a response is interpreted. Sorted.
const CHECKSUM_HEADERS: &[&str] = &[
    "access-control-allow-credentials",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-allow-origin",
    "access-control-expose-headers",
    "access-control-max-age",
    "access-control-request-headers",
    "access-control-request-method",
    "clear-site-data",
    "content-encoding",
    "content-security-policy",
    "content-type",
    "cross-origin-embedder-policy",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
    "location",
    "sec-websocket-accept",
    "sec-websocket-extensions",
    "sec-websocket-key",
    "sec-websocket-protocol",
    "sec-websocket-version",
    "upgrade",
    "vary",
];

/// A running SHA-256 over the selected response headers and then the body.
#[derive(Clone)]
pub(crate) struct ResponseChecksum {
    hasher: Sha256,
}

impl ResponseChecksum {
    /// Start a checksum with the header lines of `resp`.
    pub fn for_headers(resp: &ResponseHeader) -> Self {
        let mut lines: Vec<(&str, &[u8])> = resp
            .headers
            .iter()
            .filter(|(name, _)| CHECKSUM_HEADERS.binary_search(&name.as_str()).is_ok())
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        for (name, value) in lines {
            hasher.update(name.as_bytes());
            hasher.update(b": ");
            hasher.update(value);
            hasher.update(b"\n");
        }
        hasher.update(b"\n");
        ResponseChecksum { hasher }
    }

    /// Add body bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Whether the digest equals the hex encoded `expected`, ignoring case.
    pub fn finish_and_check(self, expected: &str) -> bool {
        let digest = hex::encode(self.hasher.finalize());
        if !digest.eq_ignore_ascii_case(expected) {
            debug!("checksum mismatch: got {digest}, expected {expected}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn expected(lines: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(lines.as_bytes());
        hasher.update(body);
        hex::encode_upper(hasher.finalize())
    }

    #[test]
    fn test_header_selection() {
        assert!(CHECKSUM_HEADERS.windows(2).all(|w| w[0] < w[1]));

        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.append_header("Vary", "origin").unwrap();
        resp.append_header("Content-Type", "text/javascript").unwrap();
        resp.append_header("Date", "Tue, 14 Nov 2023 22:13:20 GMT")
            .unwrap();
        resp.append_header("X-Custom", "ignored").unwrap();

        let mut checksum = ResponseChecksum::for_headers(&resp);
        checksum.update(b"body");
        let want = expected("content-type: text/javascript\nvary: origin\n\n", b"body");
        assert!(checksum.finish_and_check(&want));
    }

    #[test]
    fn test_mismatch() {
        let resp = ResponseHeader::build(200, None).unwrap();
        let mut checksum = ResponseChecksum::for_headers(&resp);
        checksum.update(b"body");
        assert!(!checksum.clone().finish_and_check(&expected("\n", b"other")));
        assert!(checksum.finish_and_check(&expected("\n", b"body").to_lowercase()));
    }
}
