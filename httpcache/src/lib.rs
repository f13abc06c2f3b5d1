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

//! The HTTP cache transaction engine.
//!
//! An [HttpCache] sits between a client and a [network::NetworkLayer]. Every request goes through
//! a [Transaction] which decides whether the response can come from the
//! [storage::Storage], has to be validated with the server, or has to be fetched and stored.
//! Concurrent transactions for the same URL share one entry: one of them talks to the server and
//! the others read along.

#![allow(clippy::new_without_default)]

use httpcache_error::{Error, ErrorType, ErrorType::*, OrErr, Result};
use httpcache_http::{
    has_header_value, header_str, header_tokens, HMap, Method, RequestHeader, ResponseHeader,
    StatusCode, Version,
};
use log::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strum::IntoStaticStr;

pub mod cache_control;
mod checksum;
pub mod conf;
mod entry;
pub mod freshness;
pub mod key;
mod lock;
pub mod memory;
pub mod network;
pub mod observer;
mod partial;
pub mod range;
pub mod record;
pub mod request;
pub mod response;
pub mod storage;
mod transaction;
pub mod validation;
pub mod vary;
mod writers;

use conf::CacheConf;
use entry::{EntryArena, EntryId, OpKind, OpOutcome, OpStart, TxnId};
use network::{ConnectedHook, NetworkLayer};
use observer::{NoopObserver, Observer};
use request::RequestPriority;
use storage::{Storage, StorageFactory};
use validation::ValidationPolicy;
use writers::Truncation;

pub use key::CacheKey;
pub use lock::LockStatus;
pub use request::RequestInfo;
pub use response::{CacheEntryStatus, ResponseInfo};
pub use transaction::{Mode, Transaction};

/// Set in the in-memory data of an entry whose response can't be revalidated, so that the next
/// transaction can skip reading it.
pub const HINT_UNUSABLE_PER_CACHING_HEADERS: u8 = 1;

/// The source of the current time for freshness decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// The HTTP cache
///
/// Create [Transaction]s with [HttpCache::create_transaction()]. The storage is created the first
/// time a transaction needs it. When that fails, every transaction goes to the network.
pub struct HttpCache {
    conf: CacheConf,
    validation: ValidationPolicy,
    storage_factory: Box<dyn StorageFactory>,
    storage: tokio::sync::OnceCell<Option<Arc<dyn Storage>>>,
    network_layer: Arc<dyn NetworkLayer>,
    pub(crate) observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
    connected_hook: Option<Arc<dyn ConnectedHook>>,
    pub(crate) arena: Mutex<EntryArena>,
    next_txn_id: AtomicU64,
}

impl HttpCache {
    pub fn new(
        conf: CacheConf,
        storage_factory: Box<dyn StorageFactory>,
        network_layer: Arc<dyn NetworkLayer>,
    ) -> Self {
        HttpCache {
            validation: ValidationPolicy::new(conf.prefetch_reuse()),
            arena: Mutex::new(EntryArena::new(conf.large_media_threshold)),
            conf,
            storage_factory,
            storage: tokio::sync::OnceCell::new(),
            network_layer,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            connected_hook: None,
            next_txn_id: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_connected_hook(mut self, hook: Arc<dyn ConnectedHook>) -> Self {
        self.connected_hook = Some(hook);
        self
    }

    pub fn conf(&self) -> &CacheConf {
        &self.conf
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Create a transaction for one request.
    pub fn create_transaction(self: &Arc<Self>, priority: RequestPriority) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed) + 1;
        Transaction::new(self.clone(), id, priority)
    }

    /// The number of entries in use by some transaction
    pub fn active_entry_count(&self) -> usize {
        self.arena.lock().len()
    }

    /// The storage, created on first use. `None` when it can't be created.
    pub(crate) async fn storage(&self) -> Option<Arc<dyn Storage>> {
        self.storage
            .get_or_init(|| async {
                match self.storage_factory.create().await {
                    Ok(storage) => Some(storage),
                    Err(e) => {
                        warn!("failed to create the cache storage, caching is disabled: {e}");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Open, create or doom the entry of `key` for `txn`.
    ///
    /// Operations on the same key run one at a time, the later ones wait and share the outcome
    /// of the earlier one. Return the entry and whether it was just created, or None once the key
    /// is doomed.
    pub(crate) async fn entry_op(
        &self,
        key: &CacheKey,
        txn: TxnId,
        kind: OpKind,
    ) -> Result<Option<(EntryId, bool)>> {
        let start = self.arena.lock().begin_op(key, txn, kind);
        match start {
            OpStart::Active(id) => Ok(Some((id, false))),
            OpStart::Doomed => Ok(None),
            OpStart::Fail(etype) => Error::e_explain(etype, "entry is in use"),
            OpStart::Queued(mut wait) => match wait.wait(None).await {
                Ok(Ok(id)) => Ok(Some((id, false))),
                Ok(Err(etype)) => Error::e_explain(etype, "queued entry operation failed"),
                Err(_) => Error::e_explain(CacheRace, "queued entry operation was dropped"),
            },
            OpStart::Run => self.run_entry_op(key, kind).await,
        }
    }

    async fn run_entry_op(&self, key: &CacheKey, kind: OpKind) -> Result<Option<(EntryId, bool)>> {
        let mut op = EntryOpGuard {
            cache: self,
            key,
            kind,
            finished: false,
        };
        let Some(storage) = self.storage().await else {
            op.finish(OpOutcome::Failed);
            return Error::e_explain(CacheOpenFailure, "no cache storage");
        };
        let res = match kind {
            OpKind::Open => storage.open_entry(key).await.map(|e| (e, true)),
            OpKind::Create => storage.create_entry(key).await.map(|e| (e, false)),
            OpKind::OpenOrCreate => storage.open_or_create_entry(key).await,
            OpKind::Doom => {
                if let Err(e) = storage.doom_entry(key).await {
                    debug!("failed to doom {key}: {e}");
                }
                op.finish(OpOutcome::Doomed);
                return Ok(None);
            }
        };
        match res {
            Ok((storage_entry, opened)) => {
                match op.finish(OpOutcome::Entry(storage_entry, opened)) {
                    Some(id) => Ok(Some((id, !opened || kind == OpKind::Create))),
                    None => Error::e_explain(CacheRace, "entry was doomed while opening it"),
                }
            }
            Err(e) => {
                op.finish(OpOutcome::Failed);
                Err(e)
            }
        }
    }

    /// Release `truncation` from a context that can't await it.
    pub(crate) fn finish_truncation(self: &Arc<Self>, truncation: Truncation) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                handle.spawn(async move { truncation.run(&cache).await });
            }
            Err(_) => truncation.abandon(self),
        }
    }

    /// Doom the entry a GET of the URL of `request` would use.
    pub(crate) async fn doom_main_entry_for_url(&self, request: &RequestInfo) {
        let key = CacheKey::main_entry_for(request, self.conf.split_cache);
        let doomed = self.arena.lock().doom_key(&key);
        if doomed {
            return;
        }
        let Some(storage) = self.storage().await else {
            return;
        };
        if let Err(e) = storage.doom_entry(&key).await {
            debug!("failed to doom {key}: {e}");
        }
    }
}

/// An entry operation this transaction runs for its key.
///
/// Dropping it unfinished, e.g. when the transaction is dropped mid-operation, fails the
/// operation for the transactions queued behind it.
struct EntryOpGuard<'a> {
    cache: &'a HttpCache,
    key: &'a CacheKey,
    kind: OpKind,
    finished: bool,
}

impl EntryOpGuard<'_> {
    fn finish(&mut self, outcome: OpOutcome) -> Option<EntryId> {
        self.finished = true;
        self.cache
            .arena
            .lock()
            .finish_op(self.key, self.kind, outcome)
    }
}

impl Drop for EntryOpGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache
                .arena
                .lock()
                .finish_op(self.key, self.kind, OpOutcome::Failed);
        }
    }
}
