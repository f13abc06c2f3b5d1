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

//! Cache backend storage abstraction

use super::*;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// The stream holding the serialized response record
pub const RESPONSE_INFO_INDEX: usize = 0;
/// The stream holding the response body
pub const BODY_INDEX: usize = 1;

/// A contiguous run of sparse data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailableRange {
    pub start: u64,
    pub len: u64,
}

/// One slot of the storage.
///
/// An entry has two streams, see [RESPONSE_INFO_INDEX] and [BODY_INDEX], and alternatively
/// sparse body data addressed by offset.
#[async_trait]
pub trait StorageEntry: Send + Sync {
    /// The key the entry was opened or created with
    fn key(&self) -> &CacheKey;

    /// Read from `offset` of stream `index`. Return 0 at the end of the stream.
    async fn read_data(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset` of stream `index`.
    ///
    /// With `truncate` the stream ends right after the written bytes.
    async fn write_data(&self, index: usize, offset: u64, buf: &[u8], truncate: bool)
        -> Result<usize>;

    /// The current size of stream `index`
    fn data_size(&self, index: usize) -> u64;

    /// Read sparse data starting at `offset`. Return 0 when `offset` is not stored.
    async fn read_sparse_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    async fn write_sparse_data(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Find the first stored run within `offset..offset + len`.
    ///
    /// When nothing is stored the returned range starts at `offset` with zero length.
    async fn get_available_range(&self, offset: u64, len: u64) -> Result<AvailableRange>;

    /// Wait until sparse operations on this entry can be issued
    async fn ready_for_sparse_io(&self) -> Result<()> {
        Ok(())
    }

    /// Abort any sparse operation in flight
    fn cancel_sparse_io(&self) {}

    /// Mark the entry for deletion. It stays usable by the current holders.
    fn doom(&self);

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// A shared handle to a [StorageEntry]
pub type EntryRef = Arc<dyn StorageEntry>;

/// Cache storage interface
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open an existing entry. A missing entry is a [ErrorType::CacheMiss].
    async fn open_entry(&self, key: &CacheKey) -> Result<EntryRef>;

    /// Create a new entry. Fail if one exists.
    async fn create_entry(&self, key: &CacheKey) -> Result<EntryRef>;

    /// Open the entry or create it. The flag tells whether it was opened.
    async fn open_or_create_entry(&self, key: &CacheKey) -> Result<(EntryRef, bool)>;

    /// Doom the entry stored under `key`
    async fn doom_entry(&self, key: &CacheKey) -> Result<()>;

    /// Small hints kept in memory next to the index, see [crate::HINT_UNUSABLE_PER_CACHING_HEADERS]
    fn get_entry_in_memory_data(&self, _key: &CacheKey) -> u8 {
        0
    }

    fn set_entry_in_memory_data(&self, _key: &CacheKey, _data: u8) {}

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn Any + Send + Sync + 'static);
}

/// Creates the [Storage] the first time a transaction needs it
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Storage>>;
}
