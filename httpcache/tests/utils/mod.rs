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

#![allow(unused)]

pub mod mock_origin;

use async_trait::async_trait;
use httpcache::conf::CacheConf;
use httpcache::key::CacheKey;
use httpcache::memory::{MemStorage, MemStorageFactory};
use httpcache::observer::RecordingObserver;
use httpcache::storage::{EntryRef, Storage, StorageFactory};
use httpcache::{HttpCache, ManualClock, RequestInfo, Transaction};
use httpcache_error::Result;
use mock_origin::{Handler, MockNetworkLayer, MockOrigin};
use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Where the clock of every test cache starts
pub static START_TIME: Lazy<SystemTime> =
    Lazy::new(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A cache over a [MemStorage] and a [MockOrigin], with everything a test wants to look at.
pub struct TestCache {
    pub cache: Arc<HttpCache>,
    pub storage: Arc<MemStorage>,
    pub observer: Arc<RecordingObserver>,
    pub clock: Arc<ManualClock>,
    pub origin: Arc<MockOrigin>,
}

impl TestCache {
    pub fn new(handler: Box<Handler>) -> Self {
        Self::with_conf(CacheConf::default(), handler)
    }

    pub fn with_conf(conf: CacheConf, handler: Box<Handler>) -> Self {
        let storage = Arc::new(MemStorage::new());
        let factory = Box::new(MemStorageFactory::new(storage.clone()));
        Self::build(conf, storage, factory, handler)
    }

    /// Storage operations yield once before they run, so that concurrent transactions interleave
    /// with them.
    pub fn yielding(handler: Box<Handler>) -> Self {
        let storage = Arc::new(MemStorage::new());
        let factory = Box::new(YieldingStorageFactory(Arc::new(YieldingStorage(
            storage.clone(),
        ))));
        Self::build(CacheConf::default(), storage, factory, handler)
    }

    /// Every storage creation fails
    pub fn without_storage(handler: Box<Handler>) -> Self {
        let storage = Arc::new(MemStorage::new());
        let factory = Box::new(MemStorageFactory::failing());
        Self::build(CacheConf::default(), storage, factory, handler)
    }

    fn build(
        conf: CacheConf,
        storage: Arc<MemStorage>,
        factory: Box<dyn StorageFactory>,
        handler: Box<Handler>,
    ) -> Self {
        init();
        let clock = Arc::new(ManualClock::new(*START_TIME));
        let observer = Arc::new(RecordingObserver::new());
        let origin = Arc::new(MockOrigin::new(handler, clock.clone()));
        let cache = HttpCache::new(
            conf,
            factory,
            Arc::new(MockNetworkLayer::new(origin.clone())),
        )
        .with_observer(observer.clone())
        .with_clock(clock.clone());
        TestCache {
            cache: Arc::new(cache),
            storage,
            observer,
            clock,
            origin,
        }
    }

    pub fn transaction(&self) -> Transaction {
        self.cache.create_transaction(Default::default())
    }

    /// Run `req` to the end and return the transaction with the body it read
    pub async fn fetch(&self, req: &RequestInfo) -> (Transaction, Vec<u8>) {
        let mut txn = self.transaction();
        txn.start(req).await.unwrap();
        let body = read_to_end(&mut txn).await.unwrap();
        (txn, body)
    }

    pub fn stored(&self, req: &RequestInfo) -> Option<Arc<httpcache::memory::MemEntry>> {
        self.storage.get(&CacheKey::from_request(req, false, false))
    }
}

pub async fn read_to_end(txn: &mut Transaction) -> Result<Vec<u8>> {
    let mut body = vec![];
    let mut buf = [0u8; 64];
    loop {
        let n = txn.read(&mut buf).await?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&buf[..n]);
    }
}

/// `len` bytes that differ from one offset to the next
pub fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn get(url: &str) -> RequestInfo {
    RequestInfo::new("GET", url).unwrap()
}

struct YieldingStorage(Arc<MemStorage>);

#[async_trait]
impl Storage for YieldingStorage {
    async fn open_entry(&self, key: &CacheKey) -> Result<EntryRef> {
        tokio::task::yield_now().await;
        self.0.open_entry(key).await
    }

    async fn create_entry(&self, key: &CacheKey) -> Result<EntryRef> {
        tokio::task::yield_now().await;
        self.0.create_entry(key).await
    }

    async fn open_or_create_entry(&self, key: &CacheKey) -> Result<(EntryRef, bool)> {
        tokio::task::yield_now().await;
        self.0.open_or_create_entry(key).await
    }

    async fn doom_entry(&self, key: &CacheKey) -> Result<()> {
        tokio::task::yield_now().await;
        self.0.doom_entry(key).await
    }

    fn get_entry_in_memory_data(&self, key: &CacheKey) -> u8 {
        self.0.get_entry_in_memory_data(key)
    }

    fn set_entry_in_memory_data(&self, key: &CacheKey, data: u8) {
        self.0.set_entry_in_memory_data(key, data)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

struct YieldingStorageFactory(Arc<YieldingStorage>);

#[async_trait]
impl StorageFactory for YieldingStorageFactory {
    async fn create(&self) -> Result<Arc<dyn Storage>> {
        Ok(self.0.clone())
    }
}
