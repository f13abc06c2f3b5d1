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

//! Hash map based in memory cache
//!
//! For testing only, not for production use

use super::*;
use crate::storage::{AvailableRange, EntryRef, Storage, StorageEntry, StorageFactory};

use async_trait::async_trait;
use httpcache_error::OkOrErr;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type EntryMap = Arc<RwLock<HashMap<String, Arc<MemEntry>>>>;

#[derive(Default)]
struct Faults {
    info_read_failures: AtomicUsize,
    content_read_failure: AtomicBool,
    content_write_failure: AtomicBool,
}

impl Faults {
    fn take_info_read_failure(&self) -> bool {
        self.info_read_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
struct EntryData {
    streams: [Vec<u8>; 2],
    // offset -> bytes, never overlapping nor adjacent
    sparse: BTreeMap<u64, Vec<u8>>,
}

impl EntryData {
    fn stream(&self, index: usize) -> Result<&Vec<u8>> {
        self.streams
            .get(index)
            .or_err_with(InternalError, || format!("no stream {index}"))
    }

    fn stream_mut(&mut self, index: usize) -> Result<&mut Vec<u8>> {
        self.streams
            .get_mut(index)
            .or_err_with(InternalError, || format!("no stream {index}"))
    }

    fn write_sparse(&mut self, offset: u64, buf: &[u8]) {
        let mut start = offset;
        let mut data = buf.to_vec();
        let end = offset + buf.len() as u64;

        // absorb every chunk that overlaps or touches the new one
        let touching: Vec<u64> = self
            .sparse
            .range(..=end)
            .filter(|(s, d)| **s + d.len() as u64 >= offset)
            .map(|(s, _)| *s)
            .collect();
        for chunk_start in touching {
            let Some(chunk) = self.sparse.remove(&chunk_start) else {
                continue;
            };
            let chunk_end = chunk_start + chunk.len() as u64;
            let merged_start = start.min(chunk_start);
            let merged_end = (start + data.len() as u64).max(chunk_end);
            let mut merged = vec![0; (merged_end - merged_start) as usize];
            let at = (chunk_start - merged_start) as usize;
            merged[at..at + chunk.len()].copy_from_slice(&chunk);
            // the new bytes win
            let at = (start - merged_start) as usize;
            merged[at..at + data.len()].copy_from_slice(&data);
            start = merged_start;
            data = merged;
        }
        self.sparse.insert(start, data);
    }

    fn available_range(&self, offset: u64, len: u64) -> AvailableRange {
        if len == 0 {
            return AvailableRange { start: offset, len: 0 };
        }
        let end = offset.saturating_add(len);
        // the chunk holding `offset`, if any, then the ones after it
        let before = self.sparse.range(..=offset).next_back();
        let candidates = before
            .into_iter()
            .chain(self.sparse.range(offset.saturating_add(1)..end));
        for (start, data) in candidates {
            let chunk_end = start + data.len() as u64;
            if chunk_end <= offset {
                continue;
            }
            let run_start = (*start).max(offset);
            let run_end = chunk_end.min(end);
            if run_start < run_end {
                return AvailableRange {
                    start: run_start,
                    len: run_end - run_start,
                };
            }
        }
        AvailableRange { start: offset, len: 0 }
    }

    fn read_sparse(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Some((start, data)) = self.sparse.range(..=offset).next_back() else {
            return 0;
        };
        let at = (offset - start) as usize;
        if at >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - at);
        buf[..n].copy_from_slice(&data[at..at + n]);
        n
    }
}

/// An entry of [MemStorage]
pub struct MemEntry {
    key: CacheKey,
    data: RwLock<EntryData>,
    doomed: AtomicBool,
    faults: Arc<Faults>,
    entries: EntryMap,
}

impl MemEntry {
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Relaxed)
    }

    /// A copy of the stream, for assertions
    pub fn stream_data(&self, index: usize) -> Vec<u8> {
        self.data
            .read()
            .streams
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// The stored sparse chunks as `(offset, len)`, for assertions
    pub fn sparse_chunks(&self) -> Vec<(u64, u64)> {
        self.data
            .read()
            .sparse
            .iter()
            .map(|(s, d)| (*s, d.len() as u64))
            .collect()
    }
}

#[async_trait]
impl StorageEntry for MemEntry {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    async fn read_data(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if index == storage::RESPONSE_INFO_INDEX && self.faults.take_info_read_failure() {
            return Error::e_explain(CacheReadFailure, "injected response info read failure");
        }
        if index == storage::BODY_INDEX && self.faults.content_read_failure.load(Ordering::Relaxed) {
            return Error::e_explain(CacheReadFailure, "injected body read failure");
        }
        let data = self.data.read();
        let stream = data.stream(index)?;
        let offset = offset as usize;
        if offset >= stream.len() {
            return Ok(0);
        }
        let n = buf.len().min(stream.len() - offset);
        buf[..n].copy_from_slice(&stream[offset..offset + n]);
        Ok(n)
    }

    async fn write_data(
        &self,
        index: usize,
        offset: u64,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if index == storage::BODY_INDEX && self.faults.content_write_failure.load(Ordering::Relaxed)
        {
            return Error::e_explain(CacheWriteFailure, "injected body write failure");
        }
        let mut data = self.data.write();
        let stream = data.stream_mut(index)?;
        let offset = offset as usize;
        if stream.len() < offset {
            stream.resize(offset, 0);
        }
        let end = offset + buf.len();
        if stream.len() < end {
            stream.resize(end, 0);
        }
        stream[offset..end].copy_from_slice(buf);
        if truncate {
            stream.truncate(end);
        }
        Ok(buf.len())
    }

    fn data_size(&self, index: usize) -> u64 {
        self.data
            .read()
            .streams
            .get(index)
            .map_or(0, |s| s.len() as u64)
    }

    async fn read_sparse_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.data.read().read_sparse(offset, buf))
    }

    async fn write_sparse_data(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.faults.content_write_failure.load(Ordering::Relaxed) {
            return Error::e_explain(CacheWriteFailure, "injected sparse write failure");
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.data.write().write_sparse(offset, buf);
        Ok(buf.len())
    }

    async fn get_available_range(&self, offset: u64, len: u64) -> Result<AvailableRange> {
        Ok(self.data.read().available_range(offset, len))
    }

    fn doom(&self) {
        if self.doomed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut entries = self.entries.write();
        let name = self.key.combined();
        // only detach the map slot if it still points at this entry
        if entries
            .get(&name)
            .map_or(false, |e| std::ptr::eq(e.as_ref(), self))
        {
            entries.remove(&name);
        }
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Hash map based in memory storage
///
/// For testing only, not for production use.
#[derive(Default)]
pub struct MemStorage {
    entries: EntryMap,
    in_memory_data: RwLock<HashMap<String, u8>>,
    faults: Arc<Faults>,
    open_count: AtomicUsize,
    create_count: AtomicUsize,
    open_or_create_count: AtomicUsize,
    doom_count: AtomicUsize,
}

impl MemStorage {
    /// Create a new [MemStorage]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` reads of the response record
    pub fn fail_info_reads(&self, n: usize) {
        self.faults.info_read_failures.store(n, Ordering::Relaxed);
    }

    /// Fail every body read while set
    pub fn fail_content_reads(&self, fail: bool) {
        self.faults
            .content_read_failure
            .store(fail, Ordering::Relaxed);
    }

    /// Fail every body write while set
    pub fn fail_content_writes(&self, fail: bool) {
        self.faults
            .content_write_failure
            .store(fail, Ordering::Relaxed);
    }

    /// The live entry stored under `key`
    pub fn get(&self, key: &CacheKey) -> Option<Arc<MemEntry>> {
        self.entries.read().get(&key.combined()).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Relaxed)
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::Relaxed)
    }

    pub fn open_or_create_count(&self) -> usize {
        self.open_or_create_count.load(Ordering::Relaxed)
    }

    pub fn doom_count(&self) -> usize {
        self.doom_count.load(Ordering::Relaxed)
    }

    fn new_entry(&self, key: &CacheKey) -> Arc<MemEntry> {
        Arc::new(MemEntry {
            key: key.clone(),
            data: RwLock::new(EntryData::default()),
            doomed: AtomicBool::new(false),
            faults: self.faults.clone(),
            entries: self.entries.clone(),
        })
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn open_entry(&self, key: &CacheKey) -> Result<EntryRef> {
        self.open_count.fetch_add(1, Ordering::Relaxed);
        match self.get(key) {
            Some(entry) => Ok(entry),
            None => Error::e_explain(CacheMiss, "no such entry"),
        }
    }

    async fn create_entry(&self, key: &CacheKey) -> Result<EntryRef> {
        self.create_count.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let name = key.combined();
        if entries.contains_key(&name) {
            return Error::e_explain(CacheCreateFailure, "entry exists");
        }
        let entry = self.new_entry(key);
        entries.insert(name, entry.clone());
        Ok(entry)
    }

    async fn open_or_create_entry(&self, key: &CacheKey) -> Result<(EntryRef, bool)> {
        self.open_or_create_count.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let name = key.combined();
        if let Some(entry) = entries.get(&name) {
            return Ok((entry.clone(), true));
        }
        let entry = self.new_entry(key);
        entries.insert(name, entry.clone());
        Ok((entry, false))
    }

    async fn doom_entry(&self, key: &CacheKey) -> Result<()> {
        self.doom_count.fetch_add(1, Ordering::Relaxed);
        // take the entry out first, MemEntry::doom() locks the map too
        let entry = self.entries.write().remove(&key.combined());
        if let Some(entry) = entry {
            entry.doom();
        }
        Ok(())
    }

    fn get_entry_in_memory_data(&self, key: &CacheKey) -> u8 {
        self.in_memory_data
            .read()
            .get(&key.combined())
            .copied()
            .unwrap_or(0)
    }

    fn set_entry_in_memory_data(&self, key: &CacheKey, data: u8) {
        self.in_memory_data.write().insert(key.combined(), data);
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// A [StorageFactory] that hands out one shared [MemStorage], or fails when built with
/// [MemStorageFactory::failing()].
pub struct MemStorageFactory {
    storage: Option<Arc<MemStorage>>,
}

impl MemStorageFactory {
    pub fn new(storage: Arc<MemStorage>) -> Self {
        MemStorageFactory {
            storage: Some(storage),
        }
    }

    pub fn failing() -> Self {
        MemStorageFactory { storage: None }
    }
}

#[async_trait]
impl StorageFactory for MemStorageFactory {
    async fn create(&self) -> Result<Arc<dyn Storage>> {
        match &self.storage {
            Some(storage) => Ok(storage.clone()),
            None => Error::e_explain(CacheOpenFailure, "storage unavailable"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use once_cell::sync::Lazy;

    fn key(s: &str) -> CacheKey {
        CacheKey::from_string(s)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        static MEM_STORAGE: Lazy<MemStorage> = Lazy::new(MemStorage::new);
        let key1 = key("a");
        assert!(MEM_STORAGE.open_entry(&key1).await.is_err());

        let entry = MEM_STORAGE.create_entry(&key1).await.unwrap();
        entry.write_data(1, 0, b"test1", true).await.unwrap();
        entry.write_data(1, 5, b"test2", true).await.unwrap();
        assert_eq!(entry.data_size(1), 10);
        assert!(MEM_STORAGE.create_entry(&key1).await.is_err());

        let entry = MEM_STORAGE.open_entry(&key1).await.unwrap();
        let mut buf = [0; 7];
        assert_eq!(entry.read_data(1, 3, &mut buf).await.unwrap(), 7);
        assert_eq!(&buf, b"t1test2");
        assert_eq!(entry.read_data(1, 10, &mut buf).await.unwrap(), 0);

        // truncation
        entry.write_data(1, 2, b"xy", true).await.unwrap();
        assert_eq!(entry.data_size(1), 4);
        assert_eq!(MEM_STORAGE.create_count(), 2);
        assert_eq!(MEM_STORAGE.open_count(), 2);
    }

    #[tokio::test]
    async fn test_open_or_create_and_doom() {
        let storage = MemStorage::new();
        let key1 = key("b");
        let (entry, opened) = storage.open_or_create_entry(&key1).await.unwrap();
        assert!(!opened);
        let (_, opened) = storage.open_or_create_entry(&key1).await.unwrap();
        assert!(opened);

        entry.doom();
        assert_eq!(storage.entry_count(), 0);
        // the doomed entry is still usable by its holder
        entry.write_data(0, 0, b"meta", true).await.unwrap();
        let mem = entry.as_any().downcast_ref::<MemEntry>().unwrap();
        assert!(mem.is_doomed());

        // a new entry under the same key is not affected by dooming the old one again
        let (entry2, opened) = storage.open_or_create_entry(&key1).await.unwrap();
        assert!(!opened);
        entry.doom();
        assert_eq!(storage.entry_count(), 1);
        storage.doom_entry(&key1).await.unwrap();
        assert_eq!(storage.entry_count(), 0);
        assert!(entry2.as_any().downcast_ref::<MemEntry>().unwrap().is_doomed());
    }

    #[tokio::test]
    async fn test_sparse() {
        let storage = MemStorage::new();
        let entry = storage.create_entry(&key("c")).await.unwrap();
        entry.write_sparse_data(100, &[1; 50]).await.unwrap();
        entry.write_sparse_data(0, &[2; 20]).await.unwrap();
        // touching chunks merge
        entry.write_sparse_data(150, &[3; 10]).await.unwrap();
        let mem = entry.as_any().downcast_ref::<MemEntry>().unwrap();
        assert_eq!(mem.sparse_chunks(), vec![(0, 20), (100, 60)]);

        let r = entry.get_available_range(10, 200).await.unwrap();
        assert_eq!(r, AvailableRange { start: 10, len: 10 });
        let r = entry.get_available_range(30, 100).await.unwrap();
        assert_eq!(r, AvailableRange { start: 100, len: 30 });
        let r = entry.get_available_range(20, 50).await.unwrap();
        assert_eq!(r, AvailableRange { start: 20, len: 0 });
        let r = entry.get_available_range(155, 100).await.unwrap();
        assert_eq!(r, AvailableRange { start: 155, len: 5 });

        let mut buf = [0; 8];
        assert_eq!(entry.read_sparse_data(146, &mut buf).await.unwrap(), 8);
        assert_eq!(buf, [1, 1, 1, 1, 3, 3, 3, 3]);
        assert_eq!(entry.read_sparse_data(20, &mut buf).await.unwrap(), 0);

        // overlap fills the gap
        entry.write_sparse_data(15, &[4; 90]).await.unwrap();
        assert_eq!(mem.sparse_chunks(), vec![(0, 160)]);
    }

    #[tokio::test]
    async fn test_faults() {
        let storage = MemStorage::new();
        let entry = storage.create_entry(&key("d")).await.unwrap();
        entry.write_data(0, 0, b"meta", true).await.unwrap();
        storage.fail_info_reads(1);
        let mut buf = [0; 4];
        assert!(entry.read_data(0, 0, &mut buf).await.is_err());
        assert_eq!(entry.read_data(0, 0, &mut buf).await.unwrap(), 4);

        entry.write_data(1, 0, b"body", true).await.unwrap();
        storage.fail_content_reads(true);
        assert!(entry.read_data(1, 0, &mut buf).await.is_err());
        assert_eq!(entry.read_data(0, 0, &mut buf).await.unwrap(), 4);
        storage.fail_content_reads(false);
        assert_eq!(entry.read_data(1, 0, &mut buf).await.unwrap(), 4);

        storage.fail_content_writes(true);
        assert!(entry.write_data(1, 0, b"x", false).await.is_err());
        assert!(entry.write_sparse_data(0, b"x").await.is_err());
        storage.fail_content_writes(false);
        assert!(entry.write_data(1, 0, b"x", false).await.is_ok());

        storage.set_entry_in_memory_data(&key("d"), 1);
        assert_eq!(storage.get_entry_in_memory_data(&key("d")), 1);
        assert_eq!(storage.get_entry_in_memory_data(&key("e")), 0);
    }
}
