// Copyright 2025 Cloudflare, Inc.
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

//! Cache key

use super::*;

use blake2::{Blake2b, Digest};
use std::fmt::{Display, Formatter, Result as FmtResult};

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

/// Prefix of the keys of the single-keyed cache, which ignores the isolation key.
const SINGLE_KEYED_PREFIX: &str = "sk/";

// decode a slot name back into its [HashBinary]
#[cfg(test)]
fn str2hex(s: &str) -> Option<HashBinary> {
    if s.len() != KEY_SIZE * 2 {
        return None;
    }
    let mut output = [0; KEY_SIZE];
    // no need to bubble the error, it should be obvious why the decode fails
    hex::decode_to_slice(s.as_bytes(), &mut output).ok()?;
    Some(output)
}

/// The key of one cache slot.
///
/// The key string is `{upload id}/{isolation}{url}`. Requests sharing a slot (GET, HEAD and the
/// invalidating PUT, DELETE and PATCH of the same URL) produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
}

impl CacheKey {
    /// Generate the key of a request.
    ///
    /// With `split_cache` the isolation key becomes part of the key. Callers must not cache
    /// requests with a transient isolation key in that case.
    pub fn from_request(req: &RequestInfo, split_cache: bool, single_keyed: bool) -> Self {
        let upload_id = if req.is_method(&Method::POST) {
            req.upload_id
        } else {
            0
        };
        Self::build(req, upload_id, split_cache, single_keyed)
    }

    /// The key of the GET entry for the URL of `req`.
    pub fn main_entry_for(req: &RequestInfo, split_cache: bool) -> Self {
        Self::build(req, 0, split_cache, false)
    }

    fn build(req: &RequestInfo, upload_id: u64, split_cache: bool, single_keyed: bool) -> Self {
        let full_url = req.url();
        let url = strip_fragment(&full_url);
        if single_keyed {
            return CacheKey {
                key: format!("{SINGLE_KEYED_PREFIX}{url}"),
            };
        }
        let isolation = match (&req.isolation_key, split_cache) {
            (Some(isolation), true) => format!("_dk_{isolation} "),
            _ => String::new(),
        };
        CacheKey {
            key: format!("{upload_id}/{isolation}{url}"),
        }
    }

    /// Wrap an already generated key string.
    pub fn from_string(key: impl Into<String>) -> Self {
        CacheKey { key: key.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Return the hash of the key
    pub fn primary_bin(&self) -> HashBinary {
        hash_key(&self.key)
    }

    /// The hex string of [Self::primary_bin()], used by storage to name the slot
    pub fn combined(&self) -> String {
        hex::encode(self.primary_bin())
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.key)
    }
}

fn strip_fragment(url: &str) -> &str {
    url.split_once('#').map_or(url, |(before, _)| before)
}

// blake2b truncated to 128 bits. The digest has to be stable across machines since storage
// names slots by it.
pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

/// helper function: hash a key string to [HashBinary]
pub fn hash_key<K: AsRef<[u8]>>(key: K) -> HashBinary {
    let mut hasher = Blake2b128::new();
    hasher.update(key.as_ref());
    let raw = hasher.finalize();
    raw.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, url: &str) -> RequestInfo {
        RequestInfo::new(method, url).unwrap()
    }

    #[test]
    fn test_slot_name() {
        let key = CacheKey::from_string("aa");
        let hash = key.combined();
        assert_eq!(hash, "ac10f2aef117729f8dad056b3059eb7e");
        assert_eq!(str2hex(&hash), Some(key.primary_bin()));
    }

    #[test]
    fn test_same_slot_for_invalidating_methods() {
        let get = CacheKey::from_request(&req("GET", "http://a.com/x"), false, false);
        assert_eq!(get.as_str(), "0/http://a.com/x");
        for method in ["HEAD", "PUT", "DELETE", "PATCH"] {
            let other = CacheKey::from_request(&req(method, "http://a.com/x"), false, false);
            assert_eq!(get, other);
        }
    }

    #[test]
    fn test_post_upload_id() {
        let mut post = req("POST", "http://a.com/form");
        post.upload_id = 42;
        let key = CacheKey::from_request(&post, false, false);
        assert_eq!(key.as_str(), "42/http://a.com/form");
        let main = CacheKey::main_entry_for(&post, false);
        assert_eq!(main.as_str(), "0/http://a.com/form");
    }

    #[test]
    fn test_split_and_single_keyed() {
        let mut r = req("GET", "http://a.com/x");
        r.isolation_key = Some("https://top.com".into());
        let split = CacheKey::from_request(&r, true, false);
        assert_eq!(split.as_str(), "0/_dk_https://top.com http://a.com/x");
        let unsplit = CacheKey::from_request(&r, false, false);
        assert_eq!(unsplit.as_str(), "0/http://a.com/x");

        let single = CacheKey::from_request(&r, true, true);
        assert_eq!(single.as_str(), "sk/http://a.com/x");
        assert!(single.as_str().starts_with(SINGLE_KEYED_PREFIX));
        assert!(!split.as_str().starts_with(SINGLE_KEYED_PREFIX));
    }

    #[test]
    fn test_str2hex() {
        let bin: HashBinary = std::array::from_fn(|i| (i * 17) as u8);
        assert_eq!(str2hex(&hex::encode(bin)), Some(bin));
        assert!(str2hex("abc").is_none());
        assert!(str2hex(&"zz".repeat(KEY_SIZE)).is_none());
    }
}
