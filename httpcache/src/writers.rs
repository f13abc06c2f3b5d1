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

//! The writers of an entry
//!
//! Transactions that fetch the same body share one network transaction. The transaction that
//! holds the [SharedNetwork] lock reads from the network and appends to the entry. The others
//! wait for the lock and then find the bytes in the entry already, see [WriterRead::Behind].

use super::*;
use crate::checksum::ResponseChecksum;
use crate::entry::{EntryId, TxnId, TxnInfo};
use crate::network::NetworkTransaction;
use crate::observer::EventKind;
use crate::record::CachedResponseRecord;
use crate::request::RequestPriority;
use crate::response::ResponseInfo;
use crate::storage::{EntryRef, StorageEntry, BODY_INDEX, RESPONSE_INFO_INDEX};
use http::header::{ACCEPT_RANGES, CONTENT_ENCODING};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where network bytes of a range transaction are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteTarget {
    /// Sparse data at this offset
    Sparse(u64),
    /// The body stream at this offset
    Stream(u64),
}

/// A transaction about to become a writer
#[derive(Debug, Clone)]
pub(crate) struct WriterInfo {
    pub txn: TxnInfo,
    /// Whether the transaction resumes a truncated entry
    pub truncated: bool,
    /// The response as the transaction stored it
    pub response: ResponseInfo,
}

/// The network side shared by the writers
#[derive(Default)]
pub(crate) struct SharedNetwork {
    transaction: Option<Box<dyn NetworkTransaction>>,
    // the running checksum and the expected hex digest
    checksum: Option<(ResponseChecksum, String)>,
    // set while bytes were read from the network but not stored yet
    in_flight: bool,
    // body bytes of the current exchange
    received: u64,
}

pub(crate) type SharedRef = Arc<Mutex<SharedNetwork>>;

/// The writer set of one entry. It lives in the [crate::entry::ActiveEntry].
pub(crate) struct Writers {
    members: IndexMap<TxnId, TxnInfo>,
    exclusive: bool,
    network_read_only: bool,
    should_keep_entry: bool,
    partial_do_not_truncate: bool,
    // the entry is being truncated, the set is about to go away
    finishing: bool,
    has_network: bool,
    response_info_truncation: ResponseInfo,
    shared: SharedRef,
}

impl Writers {
    pub fn new(first: &WriterInfo, exclusive: bool) -> Self {
        let mut writers = Writers {
            members: IndexMap::new(),
            exclusive,
            network_read_only: false,
            should_keep_entry: true,
            partial_do_not_truncate: false,
            finishing: false,
            has_network: false,
            response_info_truncation: first.response.clone(),
            shared: Arc::new(Mutex::new(SharedNetwork::default())),
        };
        writers.add(first);
        writers
    }

    pub fn add(&mut self, info: &WriterInfo) {
        if info.txn.is_partial && !info.truncated {
            // a sparse entry is never truncated
            self.partial_do_not_truncate = true;
        }
        self.members.insert(info.txn.id, info.txn);
    }

    pub fn remove(&mut self, txn: TxnId) -> bool {
        self.members.shift_remove(&txn).is_some()
    }

    pub fn contains(&self, txn: TxnId) -> bool {
        self.members.contains_key(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn can_add_writers(&self) -> bool {
        if self.finishing {
            return false;
        }
        self.members.is_empty() || (!self.exclusive && !self.network_read_only)
    }

    pub fn network_read_only(&self) -> bool {
        self.network_read_only
    }

    pub fn has_network(&self) -> bool {
        self.has_network
    }

    pub fn should_keep_entry(&self) -> bool {
        self.should_keep_entry
    }

    /// Stop writing to the entry. The body is only read from the network from now on.
    pub fn stop_writing(&mut self, keep_entry: bool) {
        self.network_read_only = true;
        if !keep_entry {
            self.should_keep_entry = false;
        }
    }

    pub fn shared(&self) -> SharedRef {
        self.shared.clone()
    }

    pub fn is_same(&self, shared: &SharedRef) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub fn take_members(&mut self) -> Vec<TxnInfo> {
        self.members.drain(..).map(|(_, txn)| txn).collect()
    }

    pub fn remove_all_but(&mut self, active: TxnId) -> Vec<TxnInfo> {
        let others: Vec<TxnInfo> = self
            .members
            .values()
            .filter(|txn| txn.id != active)
            .copied()
            .collect();
        self.members.retain(|id, _| *id == active);
        others
    }

    pub fn set_priority(&mut self, txn: TxnId, priority: RequestPriority) {
        if let Some(member) = self.members.get_mut(&txn) {
            member.priority = priority;
        }
    }

    /// The network transaction runs at the highest priority of the writers
    pub fn priority(&self) -> RequestPriority {
        self.members
            .values()
            .map(|txn| txn.priority)
            .max()
            .unwrap_or_default()
    }

    /// Whether the incomplete entry can be kept as a truncated entry to resume later.
    pub fn should_truncate(&mut self, storage: &dyn StorageEntry) -> bool {
        if !self.should_keep_entry || self.partial_do_not_truncate {
            return false;
        }
        let Some(headers) = self.response_info_truncation.headers.as_ref() else {
            self.should_keep_entry = false;
            return false;
        };
        let content_length = headers.content_length().unwrap_or(0);
        if content_length == 0
            || headers.has_header_value(ACCEPT_RANGES, "none")
            || !headers.has_strong_validators()
            || headers.has_header(CONTENT_ENCODING)
        {
            self.should_keep_entry = false;
            return false;
        }
        let stored = storage.data_size(BODY_INDEX);
        if stored == 0 {
            self.should_keep_entry = false;
            return false;
        }
        // the body is complete after all
        stored < content_length
    }

    /// Mark the set as finishing and prepare the truncated record.
    pub fn begin_truncation(&mut self, entry: EntryId, storage: EntryRef) -> Truncation {
        self.finishing = true;
        Truncation {
            entry,
            storage,
            shared: self.shared(),
            record: CachedResponseRecord::new(self.response_info_truncation.clone(), true)
                .serialize(),
        }
    }

    fn unusable_record(&self) -> Result<Vec<u8>> {
        let mut info = self.response_info_truncation.clone();
        info.single_keyed_cache_entry_unusable = true;
        CachedResponseRecord::new(info, false).serialize()
    }
}

/// The rewrite of an entry record as truncated, after its writers left early
pub(crate) struct Truncation {
    entry: EntryId,
    storage: EntryRef,
    shared: SharedRef,
    record: Result<Vec<u8>>,
}

impl Truncation {
    /// Write the record and release the entry
    pub async fn run(self, cache: &HttpCache) {
        let written = match &self.record {
            Ok(record) => match self
                .storage
                .write_data(RESPONSE_INFO_INDEX, 0, record, true)
                .await
            {
                Ok(n) => n == record.len(),
                Err(e) => {
                    warn!("failed to write truncated record of {}: {e}", self.storage.key());
                    false
                }
            },
            Err(e) => {
                warn!("failed to serialize truncated record: {e}");
                false
            }
        };
        debug!("entry {} truncated: {written}", self.storage.key());
        cache
            .arena
            .lock()
            .writers_done(self.entry, &self.shared, false, written, vec![]);
    }

    /// Release the entry without writing the record, when there is no runtime to write it.
    ///
    /// The entry is dropped since its record doesn't say it is truncated.
    pub fn abandon(self, cache: &HttpCache) {
        warn!("dropping unfinished entry {}", self.storage.key());
        cache
            .arena
            .lock()
            .writers_done(self.entry, &self.shared, false, false, vec![]);
    }
}

/// The result of [read()]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriterRead {
    /// Bytes read from the network into the buffer, 0 at the end
    Data(usize),
    /// The entry already holds the bytes at the read offset, read them from there
    Behind,
    /// The transaction is not a writer anymore
    Left,
}

/// Hand the network transaction of the first writer to the set.
pub(crate) async fn set_network_transaction(
    cache: &HttpCache,
    id: EntryId,
    txn: TxnId,
    mut network: Box<dyn NetworkTransaction>,
    checksum: Option<(ResponseChecksum, String)>,
) {
    let Some(shared) = cache
        .arena
        .lock()
        .get(id)
        .and_then(|e| e.writers.as_ref())
        .filter(|w| w.contains(txn))
        .map(|w| w.shared())
    else {
        return;
    };
    let mut net = shared.lock().await;
    {
        let mut arena = cache.arena.lock();
        let Some(writers) = arena.writers_mut(id).filter(|w| w.is_same(&shared)) else {
            return;
        };
        if writers.has_network {
            error!("writers of {id:?} have a network transaction already");
            return;
        }
        writers.has_network = true;
        network.set_priority(writers.priority());
    }
    net.transaction = Some(network);
    net.checksum = checksum;
    net.received = 0;
}

/// Drop the network transaction of the set, a range writer is done with its sub range.
pub(crate) async fn reset_network_transaction(cache: &HttpCache, id: EntryId) {
    let Some(shared) = cache.arena.lock().writers_mut(id).map(|w| w.shared()) else {
        return;
    };
    let mut net = shared.lock().await;
    net.transaction = None;
    net.received = 0;
    if let Some(writers) = cache
        .arena
        .lock()
        .writers_mut(id)
        .filter(|w| w.is_same(&shared))
    {
        writers.has_network = false;
    }
}

/// Update the priority of `txn` and of the shared network transaction.
pub(crate) fn set_priority(cache: &HttpCache, id: EntryId, txn: TxnId, priority: RequestPriority) {
    let (shared, priority) = {
        let mut arena = cache.arena.lock();
        let Some(writers) = arena.writers_mut(id) else {
            return;
        };
        writers.set_priority(txn, priority);
        (writers.shared(), writers.priority())
    };
    // a read in flight keeps the old priority, it is only a hint
    if let Ok(mut net) = shared.try_lock() {
        if let Some(network) = net.transaction.as_mut() {
            network.set_priority(priority);
        }
    };
}

/// Read the body for writer `txn` at `read_offset`.
///
/// `target` is where a range transaction stores the bytes. Without it, the bytes are appended to
/// the body stream and a writer lagging behind the stored body gets [WriterRead::Behind].
pub(crate) async fn read(
    cache: &HttpCache,
    id: EntryId,
    txn: TxnId,
    read_offset: u64,
    target: Option<WriteTarget>,
    buf: &mut [u8],
) -> Result<WriterRead> {
    let (shared, storage) = {
        let arena = cache.arena.lock();
        let Some(entry) = arena.get(id) else {
            return Ok(WriterRead::Left);
        };
        let Some(writers) = entry.writers.as_ref().filter(|w| w.contains(txn)) else {
            return Ok(WriterRead::Left);
        };
        (writers.shared(), entry.storage.clone())
    };

    let mut net = shared.lock().await;

    // the set may have changed while waiting for the lock
    let network_only = {
        let arena = cache.arena.lock();
        let Some(writers) = arena
            .get(id)
            .and_then(|e| e.writers.as_ref())
            .filter(|w| w.contains(txn) && w.is_same(&shared))
        else {
            return Ok(WriterRead::Left);
        };
        if target.is_none()
            && !writers.network_read_only()
            && storage.data_size(BODY_INDEX) > read_offset
        {
            return Ok(WriterRead::Behind);
        }
        writers.network_read_only()
    };

    if net.in_flight {
        // the previous reader was dropped with bytes that never made it into the entry
        warn!("shared network read of {} was interrupted", storage.key());
        net.in_flight = false;
        net.transaction = None;
        let truncation =
            cache
                .arena
                .lock()
                .writers_fail_all(id, txn, Some(ReadError), Some(ReadError));
        if let Some(truncation) = truncation {
            truncation.run(cache).await;
        }
        return Error::e_explain(ReadError, "shared network read was interrupted");
    }

    net.in_flight = true;
    let Some(network) = net.transaction.as_mut() else {
        net.in_flight = false;
        return Error::e_explain(InternalError, "writers have no network transaction");
    };
    let n = match network.read(buf).await {
        Ok(n) => n,
        Err(e) => {
            warn!("network read for {} failed: {e}", storage.key());
            net.in_flight = false;
            net.transaction = None;
            let etype = e.etype().clone();
            let truncation =
                cache
                    .arena
                    .lock()
                    .writers_fail_all(id, txn, Some(etype.clone()), Some(etype));
            if let Some(truncation) = truncation {
                truncation.run(cache).await;
            }
            return Err(e);
        }
    };

    if n == 0 {
        net.in_flight = false;
        if target.is_some() {
            // the range transaction moves on to its next sub range
            return Ok(WriterRead::Data(0));
        }
        let content_length = net
            .transaction
            .as_ref()
            .and_then(|t| t.response_info())
            .and_then(|r| r.header.content_length());
        net.transaction = None;
        if content_length.map_or(false, |len| len > net.received) {
            debug!(
                "body of {} ended early: {} of {content_length:?}",
                storage.key(),
                net.received
            );
            let truncation = cache.arena.lock().writers_fail_all(
                id,
                txn,
                Some(ConnectionClosed),
                Some(ConnectionClosed),
            );
            if let Some(truncation) = truncation {
                truncation.run(cache).await;
            }
            return Error::e_explain(ConnectionClosed, "network body ended early");
        }

        if let Some((checksum, expected)) = net.checksum.take() {
            if !network_only && !checksum.finish_and_check(&expected) {
                mark_unusable(cache, id, &storage).await;
            }
        }
        cache.arena.lock().writers_complete(id, txn);
        return Ok(WriterRead::Data(0));
    }

    net.received += n as u64;
    if !network_only {
        let data = &buf[..n];
        let written = match target {
            Some(WriteTarget::Sparse(offset)) => storage.write_sparse_data(offset, data).await,
            Some(WriteTarget::Stream(offset)) => {
                storage.write_data(BODY_INDEX, offset, data, true).await
            }
            None => {
                let offset = storage.data_size(BODY_INDEX);
                storage.write_data(BODY_INDEX, offset, data, true).await
            }
        };
        match written {
            Ok(written) if written == n => {
                if target.is_none() {
                    if let Some((checksum, _)) = net.checksum.as_mut() {
                        checksum.update(data);
                    }
                }
            }
            Ok(written) => {
                warn!("short write to {}: {written} of {n}", storage.key());
                cache.arena.lock().writers_cache_write_failure(id, txn);
            }
            Err(e) => {
                warn!("failed to write response data to {}: {e}", storage.key());
                cache.arena.lock().writers_cache_write_failure(id, txn);
            }
        }
    }
    net.in_flight = false;
    Ok(WriterRead::Data(n))
}

async fn mark_unusable(cache: &HttpCache, id: EntryId, storage: &EntryRef) {
    cache
        .observer
        .record_event(EventKind::ChecksumMismatch, storage.key().as_str());
    let record = {
        let mut arena = cache.arena.lock();
        match arena.writers_mut(id) {
            Some(writers) => writers.unusable_record(),
            None => return,
        }
    };
    let result = match record {
        Ok(record) => storage
            .write_data(RESPONSE_INFO_INDEX, 0, &record, true)
            .await
            .map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("failed to mark {} unusable: {e}", storage.key());
    }
}
