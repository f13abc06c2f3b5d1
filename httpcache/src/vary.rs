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

//! The Vary descriptor of a stored response
//!
//! The request values of the fields named by `Vary` are hashed, in the order they are listed,
//! when the response is stored. A later request matches the stored response only when hashing
//! its own values gives the same digest.

use super::*;
use crate::key::{Blake2b128, HashBinary};
use blake2::Digest;
use http::header::VARY;

/// Separates the hashed fields so that moving bytes between values changes the digest
const SALT: &[u8; 1] = &[0u8; 1];

/// The digest of the request fields a response varies on.
///
/// `None` when the response has no usable `Vary` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VaryData {
    digest: Option<HashBinary>,
}

impl VaryData {
    /// Compute the descriptor of `response` for `request`.
    ///
    /// `Vary: *` gives a valid descriptor that never matches any request.
    pub fn init(request: &RequestHeader, response: &ResponseHeader) -> Self {
        let mut hasher = Blake2b128::new();
        let mut processed = false;
        for field in header_tokens(&response.headers, VARY) {
            if field == "*" {
                // the digest is never compared against, keep it deterministic
                return VaryData {
                    digest: Some([0; 16]),
                };
            }
            let name = field.to_ascii_lowercase();
            hasher.update(name.as_bytes());
            hasher.update(SALT);
            for value in request.headers.get_all(name.as_str()) {
                hasher.update(value.as_bytes());
                hasher.update(SALT);
            }
            hasher.update(b"\n");
            processed = true;
        }
        if processed {
            VaryData {
                digest: Some(hasher.finalize().into()),
            }
        } else {
            VaryData::default()
        }
    }

    pub(crate) fn from_digest(digest: Option<HashBinary>) -> Self {
        VaryData { digest }
    }

    pub(crate) fn digest(&self) -> Option<HashBinary> {
        self.digest
    }

    pub fn is_valid(&self) -> bool {
        self.digest.is_some()
    }

    /// Whether `request` selects the same variant as the one this descriptor was built for.
    pub fn matches_request(&self, request: &RequestHeader, cached: &ResponseHeader) -> bool {
        if cached.has_header_value(VARY, "*") {
            return false;
        }
        let new = VaryData::init(request, cached);
        // a descriptor that can't be rebuilt never matches
        new.is_valid() && new.digest == self.digest
    }
}
