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

//! Cache configurations
//!
//! The configuration decides how long transactions wait for each other, how long prefetched and
//! stale responses stay usable and which responses are kept out of the cache.

use super::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Whether the cache is used at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Normal,
    /// Every request goes to the network and nothing is stored
    Disable,
}

/// The configuration of a [crate::HttpCache]
///
/// Configuration files are YAML. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    /// Version
    pub version: usize,
    pub mode: CacheMode,
    /// How long a transaction waits for the entry held by other transactions
    pub lock_timeout_ms: u64,
    /// The wait of a range request while an exclusive writer holds the entry
    pub partial_lock_timeout_ms: u64,
    /// For how long the first use of a prefetched response skips validation
    pub prefetch_reuse_mins: u64,
    /// For how long a stale-while-revalidate response can be served again before it is revalidated
    pub stale_revalidate_timeout_secs: u64,
    /// Key entries by the isolation key of the request as well
    pub split_cache: bool,
    /// Don't store audio and video responses larger than `large_media_threshold`
    pub disable_large_media_caching: bool,
    pub large_media_threshold: u64,
    /// Whether requests with a checksum use the single-keyed cache
    pub single_keyed_cache: bool,
}

impl Default for CacheConf {
    fn default() -> Self {
        CacheConf {
            version: 1,
            mode: CacheMode::Normal,
            lock_timeout_ms: 20000,
            partial_lock_timeout_ms: 25,
            prefetch_reuse_mins: 5,
            stale_revalidate_timeout_secs: 60,
            split_cache: false,
            disable_large_media_caching: false,
            large_media_threshold: 16384,
            single_keyed_cache: true,
        }
    }
}

const CONF_ERROR: ErrorType = ErrorType::new("ConfError");

impl CacheConf {
    // Does not has to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: CacheConf = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize conf")
    }

    pub fn validate(self) -> Result<Self> {
        if self.lock_timeout_ms == 0 {
            return Error::e_explain(CONF_ERROR, "lock_timeout_ms can't be 0");
        }
        if self.partial_lock_timeout_ms > self.lock_timeout_ms {
            return Error::e_explain(
                CONF_ERROR,
                format!(
                    "partial_lock_timeout_ms {} is larger than lock_timeout_ms {}",
                    self.partial_lock_timeout_ms, self.lock_timeout_ms
                ),
            );
        }
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn partial_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_lock_timeout_ms)
    }

    pub fn prefetch_reuse(&self) -> Duration {
        Duration::from_secs(self.prefetch_reuse_mins * 60)
    }

    pub fn stale_revalidate_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_revalidate_timeout_secs)
    }
}
