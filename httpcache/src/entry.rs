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

//! Active entries and the transactions sharing them
//!
//! The [EntryArena] is the bookkeeping of every storage entry some transaction is using. An entry
//! is used by at most one transaction in the headers phase at a time. The others wait in one of
//! two queues until they are admitted as readers or writers. The arena never awaits: storage I/O
//! happens outside of it and transactions wait on a [LockWait] for their turn.
//!
//! Transactions refer to entries by [EntryId]. A stale id (the entry was destroyed) is simply not
//! found anymore.

use super::*;
use crate::lock::{wait_pair, LockStatus, LockWait, WaitSlot};
use crate::request::RequestPriority;
use crate::storage::EntryRef;
use crate::transaction::Mode;
use crate::writers::{SharedRef, Truncation, WriterInfo, Writers};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

pub(crate) type TxnId = u64;

/// The handle of an active entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId {
    index: usize,
    generation: u64,
}

/// What the arena knows about a transaction using an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxnInfo {
    pub id: TxnId,
    pub mode: Mode,
    pub is_partial: bool,
    pub is_get: bool,
    /// The announced body length of the response, once known
    pub content_length: Option<u64>,
    pub priority: RequestPriority,
}

impl TxnInfo {
    /// Whether the transaction can share the writing of the entry with others.
    ///
    /// `max_len` is the body size above which a writer keeps the entry to itself.
    pub fn can_join_writers(&self, max_len: u64) -> bool {
        self.is_get
            && !self.is_partial
            && self.mode != Mode::Read
            && self.content_length.map_or(true, |len| len <= max_len)
    }
}

/// A message to a transaction about its role in an entry. Transactions drain them with
/// [EntryArena::take_notices()].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notice {
    /// The transaction is no longer a writer and lost the entry, with the error to report if any
    LeaveWriters(Option<ErrorType>),
    /// The body is complete, the writer goes on as a reader
    PromoteToReader,
    /// The headers phase of the transaction can't go on with the entry
    CannotProceed,
}

struct Waiter<I> {
    info: I,
    slot: WaitSlot,
}

/// One storage entry in use
pub(crate) struct ActiveEntry {
    pub key: CacheKey,
    pub storage: EntryRef,
    pub doomed: bool,
    /// Whether some transaction was admitted to the entry before
    pub opened: bool,
    headers_transaction: Option<TxnInfo>,
    add_to_entry_queue: VecDeque<Waiter<TxnInfo>>,
    done_headers_queue: VecDeque<Waiter<WriterInfo>>,
    readers: IndexMap<TxnId, TxnInfo>,
    pub writers: Option<Writers>,
}

impl ActiveEntry {
    fn new(key: CacheKey, storage: EntryRef) -> Self {
        ActiveEntry {
            key,
            storage,
            doomed: false,
            opened: false,
            headers_transaction: None,
            add_to_entry_queue: VecDeque::new(),
            done_headers_queue: VecDeque::new(),
            readers: IndexMap::new(),
            writers: None,
        }
    }

    fn has_no_transactions(&self) -> bool {
        self.headers_transaction.is_none()
            && self.add_to_entry_queue.is_empty()
            && self.done_headers_queue.is_empty()
            && self.readers.is_empty()
            && self.writers.is_none()
    }

    fn writers_can_take_more(&self) -> bool {
        self.writers.as_ref().map_or(true, |w| w.can_add_writers())
    }

    fn is_headers_transaction(&self, txn: TxnId) -> bool {
        self.headers_transaction.map_or(false, |t| t.id == txn)
    }
}

/// Storage operations that are serialized per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum OpKind {
    Open,
    Create,
    OpenOrCreate,
    Doom,
}

/// What a queued storage operation ends with: the entry it can use, or the error
pub(crate) type OpResult = std::result::Result<EntryId, ErrorType>;

/// How the first storage operation of a key ended
pub(crate) enum OpOutcome {
    Entry(EntryRef, bool),
    Doomed,
    Failed,
}

/// The answer of [EntryArena::begin_op()]
pub(crate) enum OpStart {
    /// The entry is active already, no storage call is needed
    Active(EntryId),
    /// The active entry was doomed
    Doomed,
    /// The caller runs the storage operation and reports with [EntryArena::finish_op()]
    Run,
    /// Another operation on the key is in flight
    Queued(LockWait<OpResult>),
    Fail(ErrorType),
}

#[derive(Default)]
struct PendingOp {
    queue: VecDeque<(TxnId, OpKind, WaitSlot<OpResult>)>,
}

struct Slot {
    generation: u64,
    entry: Option<ActiveEntry>,
}

/// The active entries of a cache. See the module doc.
pub(crate) struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    active: HashMap<CacheKey, EntryId>,
    pending: HashMap<CacheKey, PendingOp>,
    notices: HashMap<TxnId, Vec<Notice>>,
    max_shared_len: u64,
}

/// What the front of the done-headers queue becomes
enum Admission {
    Writer,
    Reader,
    PromotedReader,
}

impl EntryArena {
    /// `max_shared_len` is the largest announced body that writers share.
    pub fn new(max_shared_len: u64) -> Self {
        EntryArena {
            slots: vec![],
            free: vec![],
            active: HashMap::new(),
            pending: HashMap::new(),
            notices: HashMap::new(),
            max_shared_len,
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&ActiveEntry> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut ActiveEntry> {
        Self::entry_in(&mut self.slots, id)
    }

    fn entry_in(slots: &mut [Slot], id: EntryId) -> Option<&mut ActiveEntry> {
        slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn find_active(&self, key: &CacheKey) -> Option<EntryId> {
        self.active.get(key).copied()
    }

    /// The number of entries in use, doomed ones included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    fn activate(&mut self, key: CacheKey, storage: EntryRef) -> EntryId {
        let entry = ActiveEntry::new(key.clone(), storage);
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.entry = Some(entry);
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        if let Some(old) = self.active.insert(key, id) {
            // a doomed entry should have been detached already
            error!("entry {old:?} was still active under the same key");
        }
        id
    }

    fn destroy(&mut self, id: EntryId) {
        let Some(slot) = self.slots.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            if self.active.get(&entry.key) == Some(&id) {
                self.active.remove(&entry.key);
            }
            self.free.push(id.index);
            trace!("entry {} destroyed", entry.key);
        }
    }

    fn maybe_destroy(&mut self, id: EntryId) {
        if self.get(id).map_or(false, |e| e.has_no_transactions()) {
            self.destroy(id);
        }
    }

    /* Storage operations */

    /// Start a storage operation of `kind` on `key` for `txn`.
    pub fn begin_op(&mut self, key: &CacheKey, txn: TxnId, kind: OpKind) -> OpStart {
        if let Some(pending) = self.pending.get_mut(key) {
            let (slot, wait) = wait_pair();
            pending.queue.push_back((txn, kind, slot));
            return OpStart::Queued(wait);
        }
        if let Some(id) = self.find_active(key) {
            return match kind {
                OpKind::Open | OpKind::OpenOrCreate => OpStart::Active(id),
                OpKind::Create => OpStart::Fail(CacheRace),
                OpKind::Doom => {
                    self.doom_active(id);
                    self.maybe_destroy(id);
                    OpStart::Doomed
                }
            };
        }
        self.pending.insert(key.clone(), PendingOp::default());
        OpStart::Run
    }

    /// Report how the storage operation started with [OpStart::Run] ended.
    ///
    /// Return the now active entry, if any. The queued operations of the key are answered without
    /// another storage call.
    pub fn finish_op(
        &mut self,
        key: &CacheKey,
        kind: OpKind,
        outcome: OpOutcome,
    ) -> Option<EntryId> {
        let pending = self.pending.remove(key).unwrap_or_default();
        let id = match outcome {
            OpOutcome::Entry(storage, opened) => {
                let id = self.activate(key.clone(), storage);
                if let Some(entry) = self.get_mut(id) {
                    entry.opened = opened && kind != OpKind::Create;
                }
                Some(id)
            }
            OpOutcome::Doomed | OpOutcome::Failed => None,
        };
        for (txn, queued, slot) in pending.queue {
            let result = match (id, queued) {
                (Some(id), OpKind::Open | OpKind::OpenOrCreate) => Ok(id),
                (Some(_), OpKind::Create) => Err(CacheCreateFailure),
                _ => Err(CacheRace),
            };
            let name: &str = queued.into();
            trace!("answer queued {name} of txn {txn}: {result:?}");
            // the waiter may be gone
            let _ = slot.signal(result);
        }
        id
    }

    /* Headers phase */

    /// Queue `info` for the headers phase of the entry.
    ///
    /// Return the wait and whether the shorter lock timeout of range requests applies.
    pub fn add_to_entry(&mut self, id: EntryId, info: TxnInfo) -> Result<(LockWait, bool)> {
        let Some(entry) = self.get_mut(id) else {
            return Error::e_explain(CacheRace, "entry is gone");
        };
        entry.opened = true;
        let partial_timeout = info.is_partial
            && entry
                .writers
                .as_ref()
                .map_or(false, |w| !w.is_empty() && w.is_exclusive());
        let (slot, wait) = wait_pair();
        entry.add_to_entry_queue.push_back(Waiter { info, slot });
        self.process_queues(id);
        Ok((wait, partial_timeout))
    }

    /// The transaction finished its headers phase.
    ///
    /// Return None when the transaction is a writer right away, otherwise the wait for its turn.
    pub fn done_with_response_headers(
        &mut self,
        id: EntryId,
        info: WriterInfo,
    ) -> Result<Option<LockWait>> {
        let max_shared_len = self.max_shared_len;
        let Some(entry) = self.get_mut(id) else {
            return Error::e_explain(CacheRace, "entry is gone");
        };
        let txn = info.txn;
        // a range transaction goes back to its headers phase between sub ranges
        if entry.writers.as_ref().map_or(false, |w| w.contains(txn.id)) {
            return Ok(None);
        }
        if entry.is_headers_transaction(txn.id) {
            entry.headers_transaction = None;
        }

        if txn.mode.can_write() && entry.writers.is_none() && entry.readers.is_empty() {
            let exclusive = !txn.can_join_writers(max_shared_len);
            entry.writers = Some(Writers::new(&info, exclusive));
            self.process_queues(id);
            return Ok(None);
        }

        let (slot, wait) = wait_pair();
        entry.done_headers_queue.push_back(Waiter { info, slot });
        self.process_queues(id);
        Ok(Some(wait))
    }

    /// Whether `txn` may write the response headers into the entry.
    ///
    /// `is_match` tells that the response validated the stored one.
    pub fn can_transaction_write_response_headers(
        &self,
        id: EntryId,
        txn: TxnId,
        mode: Mode,
        is_match: bool,
    ) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        if entry.writers.as_ref().map_or(false, |w| w.contains(txn)) {
            return true;
        }
        if !entry.is_headers_transaction(txn) || !mode.can_write() {
            return false;
        }
        if !is_match {
            // only the transaction that will write the body can replace the headers
            return entry.writers.as_ref().map_or(true, |w| w.is_empty())
                && entry.done_headers_queue.is_empty()
                && entry.readers.is_empty();
        }
        true
    }

    pub fn is_writing_in_progress(&self, id: EntryId) -> bool {
        self.get(id).map_or(false, |e| e.writers.is_some())
    }

    pub fn in_writers(&self, id: EntryId, txn: TxnId) -> bool {
        self.get(id)
            .and_then(|e| e.writers.as_ref())
            .map_or(false, |w| w.contains(txn))
    }

    pub fn writers_mut(&mut self, id: EntryId) -> Option<&mut Writers> {
        self.get_mut(id).and_then(|e| e.writers.as_mut())
    }

    /// Remove `txn` from the entry.
    ///
    /// `complete` tells whether the transaction is done with the entry in good order. A write mode
    /// transaction that leaves early makes the waiters start over. When the last writer leaves
    /// early, the returned [Truncation] has to be carried out and reported with
    /// [Self::writers_done()].
    pub fn done_with_entry(
        &mut self,
        id: EntryId,
        txn: TxnId,
        mode: Mode,
        complete: bool,
        is_partial: bool,
    ) -> Option<Truncation> {
        let entry = self.get_mut(id)?;
        let read_only = mode == Mode::Read;
        if !complete && !read_only && is_partial {
            entry.storage.cancel_sparse_io();
        }

        if let Some(pos) = entry
            .done_headers_queue
            .iter()
            .position(|w| w.info.txn.id == txn)
        {
            entry.done_headers_queue.remove(pos);
            if !complete && !read_only {
                // the body was not going to be written
                self.process_entry_failure(id);
            } else {
                self.process_queues(id);
            }
            return None;
        }

        if entry.is_headers_transaction(txn) {
            entry.headers_transaction = None;
            if complete || read_only {
                self.process_queues(id);
            } else {
                self.process_entry_failure(id);
            }
            return None;
        }

        if entry.writers.as_ref().map_or(false, |w| w.contains(txn)) {
            return self.remove_writer(id, txn, complete);
        }

        if entry.readers.shift_remove(&txn).is_none() {
            // the transaction may still be queued after a cancellation
            entry.add_to_entry_queue.retain(|w| w.info.id != txn);
        }
        self.process_queues(id);
        None
    }

    /// Drop a transaction that gave up waiting for the entry or for a storage operation.
    pub fn remove_pending_transaction(&mut self, id: Option<EntryId>, key: &CacheKey, txn: TxnId) {
        if let Some(id) = id {
            if let Some(entry) = self.get_mut(id) {
                entry.add_to_entry_queue.retain(|w| w.info.id != txn);
                self.process_queues(id);
            }
        }
        if let Some(pending) = self.pending.get_mut(key) {
            pending.queue.retain(|(t, _, _)| *t != txn);
        }
    }

    /* Dooming */

    fn doom_active(&mut self, id: EntryId) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        entry.doomed = true;
        entry.storage.doom();
        let key = entry.key.clone();
        if self.active.get(&key) == Some(&id) {
            self.active.remove(&key);
        }
        debug!("doomed active entry {key}");
    }

    /// Doom the entry under `key` if it is active. Return false when it is not.
    pub fn doom_key(&mut self, key: &CacheKey) -> bool {
        match self.find_active(key) {
            Some(id) => {
                self.doom_active(id);
                self.maybe_destroy(id);
                true
            }
            None => false,
        }
    }

    /// Doom the entry by id. It stays usable for its current transactions.
    pub fn doom_entry(&mut self, id: EntryId) {
        self.doom_active(id);
        self.maybe_destroy(id);
    }

    /// The headers transaction got a response that doesn't match the stored one and can't replace
    /// it: the entry is doomed and the transactions waiting for it start over.
    pub fn doom_entry_validation_no_match(&mut self, id: EntryId) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        entry.headers_transaction = None;
        if entry.has_no_transactions() {
            entry.storage.doom();
            self.destroy(id);
            return;
        }
        let queue: Vec<_> = entry.add_to_entry_queue.drain(..).collect();
        self.doom_active(id);
        for waiter in queue {
            let _ = waiter.slot.signal(LockStatus::Race);
        }
        self.maybe_destroy(id);
    }

    /* Queue processing */

    fn process_queues(&mut self, id: EntryId) {
        while self.process_one(id) {}
        self.maybe_destroy(id);
    }

    // Admit at most one waiting transaction. Return whether the queues changed.
    fn process_one(&mut self, id: EntryId) -> bool {
        let max_shared_len = self.max_shared_len;
        let Some(entry) = Self::entry_in(&mut self.slots, id) else {
            return false;
        };

        // validated transactions go first to keep the FIFO order
        if !entry.done_headers_queue.is_empty() && entry.writers_can_take_more() {
            return Self::process_done_headers_queue(entry, &mut self.notices, max_shared_len);
        }

        if entry.headers_transaction.is_some()
            || entry.add_to_entry_queue.is_empty()
            || !entry.writers_can_take_more()
        {
            return false;
        }
        let Some(waiter) = entry.add_to_entry_queue.pop_front() else {
            return false;
        };
        if waiter.slot.is_cancelled() {
            return true;
        }
        entry.headers_transaction = Some(waiter.info);
        if waiter.slot.signal(LockStatus::Granted).is_err() {
            // the waiter left in between
            entry.headers_transaction = None;
        }
        true
    }

    fn process_done_headers_queue(
        entry: &mut ActiveEntry,
        notices: &mut HashMap<TxnId, Vec<Notice>>,
        max_shared_len: u64,
    ) -> bool {
        let Some(front) = entry.done_headers_queue.front() else {
            return false;
        };
        if front.slot.is_cancelled() {
            entry.done_headers_queue.pop_front();
            return true;
        }
        let txn = front.info.txn;
        let can_join = txn.can_join_writers(max_shared_len);

        let admission = if entry.writers.is_some() {
            if !can_join {
                // wait for the body to be complete
                return false;
            }
            Admission::Writer
        } else if txn.mode.can_write() {
            if !txn.is_partial {
                // the body was written already
                Admission::PromotedReader
            } else if entry.readers.is_empty() {
                Admission::Writer
            } else {
                return false;
            }
        } else {
            Admission::Reader
        };

        let Some(waiter) = entry.done_headers_queue.pop_front() else {
            return false;
        };
        let mut created_writers = false;
        match admission {
            Admission::Writer => match entry.writers.as_mut() {
                Some(writers) => writers.add(&waiter.info),
                None => {
                    let exclusive = !can_join;
                    entry.writers = Some(Writers::new(&waiter.info, exclusive));
                    created_writers = true;
                }
            },
            Admission::PromotedReader => {
                notices.entry(txn.id).or_default().push(Notice::PromoteToReader);
                entry.readers.insert(txn.id, txn);
            }
            Admission::Reader => {
                entry.readers.insert(txn.id, txn);
            }
        }

        if waiter.slot.signal(LockStatus::Granted).is_err() {
            // undo, the waiter is gone
            notices.remove(&txn.id);
            entry.readers.shift_remove(&txn.id);
            if let Some(writers) = entry.writers.as_mut() {
                writers.remove(txn.id);
                if created_writers {
                    entry.writers = None;
                }
            }
        }
        true
    }

    // The entry can't be completed by anybody waiting for it: doom it and let them start over.
    fn process_entry_failure(&mut self, id: EntryId) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        let mut slots: Vec<WaitSlot> = entry
            .done_headers_queue
            .drain(..)
            .map(|w| w.slot)
            .collect();
        slots.extend(entry.add_to_entry_queue.drain(..).map(|w| w.slot));
        entry.headers_transaction = None;

        if entry.has_no_transactions() {
            entry.storage.doom();
            self.destroy(id);
        } else {
            self.doom_active(id);
        }
        for slot in slots {
            let _ = slot.signal(LockStatus::Race);
        }
    }

    // Let the headers phase transactions re-read the entry, which is now truncated.
    fn restart_headers_phase_transactions(&mut self, id: EntryId) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        let headers_txn = entry.headers_transaction.take();
        let slots: Vec<WaitSlot> = entry
            .done_headers_queue
            .drain(..)
            .map(|w| w.slot)
            .collect();
        if let Some(txn) = headers_txn {
            self.push_notice(txn.id, Notice::CannotProceed);
        }
        for slot in slots {
            let _ = slot.signal(LockStatus::Race);
        }
    }

    /* Writers */

    fn remove_writer(&mut self, id: EntryId, txn: TxnId, success: bool) -> Option<Truncation> {
        let entry = self.get_mut(id)?;
        let storage = entry.storage.clone();
        let writers = entry.writers.as_mut()?;
        writers.remove(txn);
        if !writers.is_empty() {
            return None;
        }
        if !success && writers.should_truncate(storage.as_ref()) {
            return Some(writers.begin_truncation(id, storage));
        }
        let keep = writers.should_keep_entry();
        let shared = writers.shared();
        self.writers_done(id, &shared, success, keep, vec![]);
        None
    }

    /// Every writer leaves the entry because of a failure.
    ///
    /// `active` is the writer that saw the failure and gets `active_error`, the rest get
    /// `others_error`.
    pub fn writers_fail_all(
        &mut self,
        id: EntryId,
        active: TxnId,
        active_error: Option<ErrorType>,
        others_error: Option<ErrorType>,
    ) -> Option<Truncation> {
        let entry = self.get_mut(id)?;
        let storage = entry.storage.clone();
        let writers = entry.writers.as_mut()?;
        let members = writers.take_members();
        for txn in members {
            let err = if txn.id == active {
                active_error.clone()
            } else {
                others_error.clone()
            };
            self.push_notice(txn.id, Notice::LeaveWriters(err));
        }

        let writers = self.writers_mut(id)?;
        if writers.should_truncate(storage.as_ref()) {
            return Some(writers.begin_truncation(id, storage));
        }
        let keep = writers.should_keep_entry();
        let shared = writers.shared();
        self.writers_done(id, &shared, false, keep, vec![]);
        None
    }

    /// The network body ended and the entry is complete. The active writer leaves, the idle ones
    /// become readers.
    pub fn writers_complete(&mut self, id: EntryId, active: TxnId) {
        let Some(writers) = self.writers_mut(id) else {
            return;
        };
        let shared = writers.shared();
        let keep = writers.should_keep_entry();
        let members = writers.take_members();
        let mut readers = vec![];
        for txn in members {
            if txn.id == active {
                self.push_notice(txn.id, Notice::LeaveWriters(None));
            } else {
                readers.push(txn);
            }
        }
        self.writers_done(id, &shared, true, keep, readers);
    }

    /// Writing the body into the cache failed. The other writers leave, the active one keeps
    /// reading from the network alone and the entry is doomed.
    pub fn writers_cache_write_failure(&mut self, id: EntryId, active: TxnId) {
        let Some(writers) = self.writers_mut(id) else {
            return;
        };
        let shared = writers.shared();
        let others = writers.remove_all_but(active);
        writers.stop_writing(false);
        let lone = writers.is_empty();
        for txn in others {
            self.push_notice(txn.id, Notice::LeaveWriters(Some(CacheWriteFailure)));
        }
        if lone {
            self.writers_done(id, &shared, false, false, vec![]);
        } else {
            self.process_entry_failure(id);
        }
    }

    /// The lone writer stops writing to the entry and goes on with the network only.
    ///
    /// Return false when other writers share the entry. Without `keep_entry` the entry is doomed
    /// and the transactions waiting for it start over.
    pub fn writers_stop_caching(&mut self, id: EntryId, keep_entry: bool) -> bool {
        let Some(writers) = self.writers_mut(id) else {
            return false;
        };
        if writers.len() != 1 {
            return false;
        }
        writers.stop_writing(keep_entry);
        if !keep_entry {
            self.process_entry_failure(id);
        }
        true
    }

    /// The writers of `shared` are done with the entry.
    ///
    /// Without `success` the entry is kept only if `should_keep` (it was truncated). `make_readers`
    /// are the idle writers that go on reading the complete body.
    pub fn writers_done(
        &mut self,
        id: EntryId,
        shared: &SharedRef,
        success: bool,
        should_keep: bool,
        make_readers: Vec<TxnInfo>,
    ) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        // the writers may have been replaced meanwhile
        if !entry.writers.as_ref().map_or(false, |w| w.is_same(shared)) {
            return;
        }

        if !success && should_keep {
            entry.writers = None;
            self.restart_headers_phase_transactions(id);
            self.process_queues(id);
            return;
        }

        if success {
            for txn in &make_readers {
                entry.readers.insert(txn.id, *txn);
            }
            entry.writers = None;
            for txn in make_readers {
                self.push_notice(txn.id, Notice::PromoteToReader);
            }
            self.process_queues(id);
        } else {
            entry.writers = None;
            self.process_entry_failure(id);
        }
    }

    /* Notices */

    pub fn push_notice(&mut self, txn: TxnId, notice: Notice) {
        trace!("notice for txn {txn}: {notice:?}");
        self.notices.entry(txn).or_default().push(notice);
    }

    pub fn take_notices(&mut self, txn: TxnId) -> Vec<Notice> {
        self.notices.remove(&txn).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemStorage;
    use crate::response::ResponseInfo;
    use crate::storage::{Storage, BODY_INDEX};

    fn info(id: TxnId, mode: Mode) -> TxnInfo {
        TxnInfo {
            id,
            mode,
            is_partial: false,
            is_get: true,
            content_length: None,
            priority: RequestPriority::default(),
        }
    }

    fn writer_info(id: TxnId, mode: Mode) -> WriterInfo {
        WriterInfo {
            txn: info(id, mode),
            truncated: false,
            response: ResponseInfo::default(),
        }
    }

    async fn active_entry(arena: &mut EntryArena, storage: &MemStorage, url: &str) -> EntryId {
        let key = CacheKey::from_string(url);
        assert!(matches!(arena.begin_op(&key, 1, OpKind::OpenOrCreate), OpStart::Run));
        let (entry, opened) = storage.open_or_create_entry(&key).await.unwrap();
        arena
            .finish_op(&key, OpKind::OpenOrCreate, OpOutcome::Entry(entry, opened))
            .unwrap()
    }

    async fn granted(wait: &mut LockWait) -> bool {
        wait.wait(Some(std::time::Duration::from_millis(1))).await == Ok(LockStatus::Granted)
    }

    #[tokio::test]
    async fn test_pending_ops_share_result() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let key = CacheKey::from_string("http://a.com/");

        assert!(matches!(arena.begin_op(&key, 1, OpKind::OpenOrCreate), OpStart::Run));
        let OpStart::Queued(mut open) = arena.begin_op(&key, 2, OpKind::OpenOrCreate) else {
            panic!("not queued");
        };
        let OpStart::Queued(mut create) = arena.begin_op(&key, 3, OpKind::Create) else {
            panic!("not queued");
        };
        let OpStart::Queued(mut doom) = arena.begin_op(&key, 4, OpKind::Doom) else {
            panic!("not queued");
        };

        let (entry, opened) = storage.open_or_create_entry(&key).await.unwrap();
        let id = arena
            .finish_op(&key, OpKind::OpenOrCreate, OpOutcome::Entry(entry, opened))
            .unwrap();
        assert!(!arena.get(id).unwrap().opened);
        assert_eq!(open.wait(None).await.unwrap(), Ok(id));
        assert_eq!(create.wait(None).await.unwrap(), Err(CacheCreateFailure));
        assert_eq!(doom.wait(None).await.unwrap(), Err(CacheRace));
        assert_eq!(storage.open_or_create_count(), 1);

        // now active, no storage call needed
        assert!(matches!(arena.begin_op(&key, 5, OpKind::Open), OpStart::Active(i) if i == id));
        assert!(matches!(arena.begin_op(&key, 5, OpKind::Create), OpStart::Fail(CacheRace)));
    }

    #[tokio::test]
    async fn test_failed_op_races() {
        let mut arena = EntryArena::new(1 << 20);
        let key = CacheKey::from_string("http://a.com/");
        assert!(matches!(arena.begin_op(&key, 1, OpKind::Open), OpStart::Run));
        let OpStart::Queued(mut queued) = arena.begin_op(&key, 2, OpKind::Open) else {
            panic!("not queued");
        };
        assert!(arena.finish_op(&key, OpKind::Open, OpOutcome::Failed).is_none());
        assert_eq!(queued.wait(None).await.unwrap(), Err(CacheRace));
        // the key is free again
        assert!(matches!(arena.begin_op(&key, 3, OpKind::Open), OpStart::Run));
    }

    #[tokio::test]
    async fn test_headers_phase_one_at_a_time() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;

        let (mut first, partial_timeout) = arena.add_to_entry(id, info(1, Mode::Write)).unwrap();
        assert!(!partial_timeout);
        let (mut second, _) = arena.add_to_entry(id, info(2, Mode::ReadWrite)).unwrap();
        assert!(granted(&mut first).await);
        assert!(!granted(&mut second).await);

        // the writer is admitted right away, the next one gets its headers phase
        let wait = arena
            .done_with_response_headers(id, writer_info(1, Mode::Write))
            .unwrap();
        assert!(wait.is_none());
        assert!(arena.in_writers(id, 1));
        assert!(arena.is_writing_in_progress(id));
        // the second waiter timed out above, its slot is skipped and the third goes
        let (mut third, _) = arena.add_to_entry(id, info(3, Mode::ReadWrite)).unwrap();
        assert!(granted(&mut third).await);
        assert_eq!(second.lock_status(), LockStatus::Timeout);
    }

    #[tokio::test]
    async fn test_join_writers_and_complete() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;

        let (mut w1, _) = arena.add_to_entry(id, info(1, Mode::Write)).unwrap();
        assert!(granted(&mut w1).await);
        let (mut w2, _) = arena.add_to_entry(id, info(2, Mode::ReadWrite)).unwrap();
        assert!(arena
            .done_with_response_headers(id, writer_info(1, Mode::Write))
            .unwrap()
            .is_none());
        assert!(w2.wait(None).await.is_ok());

        let mut done = arena
            .done_with_response_headers(id, writer_info(2, Mode::ReadWrite))
            .unwrap()
            .unwrap();
        assert_eq!(done.wait(None).await, Ok(LockStatus::Granted));
        assert!(arena.in_writers(id, 2));
        assert!(arena.take_notices(2).is_empty());

        arena.writers_complete(id, 1);
        assert_eq!(arena.take_notices(1), vec![Notice::LeaveWriters(None)]);
        assert_eq!(arena.take_notices(2), vec![Notice::PromoteToReader]);
        assert!(!arena.is_writing_in_progress(id));

        // the last reader leaving destroys the entry, the storage keeps it
        assert!(arena.done_with_entry(id, 2, Mode::Read, true, false).is_none());
        assert!(arena.get(id).is_none());
        assert_eq!(arena.len(), 0);
        assert!(storage.get(&CacheKey::from_string("http://a.com/")).is_some());
    }

    #[tokio::test]
    async fn test_reader_waits_for_body() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;

        let (mut w1, _) = arena.add_to_entry(id, info(1, Mode::Write)).unwrap();
        assert!(granted(&mut w1).await);
        let (mut r, _) = arena.add_to_entry(id, info(2, Mode::Read)).unwrap();
        arena
            .done_with_response_headers(id, writer_info(1, Mode::Write))
            .unwrap();
        assert!(granted(&mut r).await);
        let mut reader = arena
            .done_with_response_headers(id, writer_info(2, Mode::Read))
            .unwrap()
            .unwrap();
        assert!(!granted(&mut reader).await);
        // the reader timed out in the queue, a new one waits until the writer is done
        let mut reader = {
            let (mut r2, _) = arena.add_to_entry(id, info(3, Mode::Read)).unwrap();
            assert!(granted(&mut r2).await);
            arena
                .done_with_response_headers(id, writer_info(3, Mode::Read))
                .unwrap()
                .unwrap()
        };
        arena.writers_complete(id, 1);
        assert_eq!(reader.wait(None).await, Ok(LockStatus::Granted));
    }

    #[tokio::test]
    async fn test_writer_failure_restarts_waiters() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;
        let key = CacheKey::from_string("http://a.com/");

        let (mut w1, _) = arena.add_to_entry(id, info(1, Mode::Write)).unwrap();
        assert!(granted(&mut w1).await);
        let (mut w2, _) = arena.add_to_entry(id, info(2, Mode::ReadWrite)).unwrap();

        // the headers transaction gives up before writing anything
        assert!(arena.done_with_entry(id, 1, Mode::Write, false, false).is_none());
        assert_eq!(w2.wait(None).await, Ok(LockStatus::Race));
        assert!(arena.get(id).is_none());
        assert!(storage.get(&key).is_none());
        assert!(arena.find_active(&key).is_none());
    }

    #[tokio::test]
    async fn test_validation_no_match() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;
        let key = CacheKey::from_string("http://a.com/");

        let (mut w1, _) = arena.add_to_entry(id, info(1, Mode::ReadWrite)).unwrap();
        assert!(granted(&mut w1).await);
        let (mut r1, _) = arena.add_to_entry(id, info(2, Mode::Read)).unwrap();
        arena.doom_entry_validation_no_match(id);
        assert_eq!(r1.wait(None).await, Ok(LockStatus::Race));
        assert!(arena.find_active(&key).is_none());
        assert!(storage.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_truncate_on_early_leave() {
        let storage = MemStorage::new();
        let mut arena = EntryArena::new(1 << 20);
        let id = active_entry(&mut arena, &storage, "http://a.com/").await;

        let mut response = ResponseHeader::build(200, None).unwrap();
        response.insert_header("content-length", "100").unwrap();
        response.insert_header("etag", "\"strong\"").unwrap();
        response
            .insert_header("last-modified", "Tue, 14 Nov 2023 22:13:20 GMT")
            .unwrap();
        response
            .insert_header("date", "Tue, 14 Nov 2023 22:13:20 GMT")
            .unwrap();
        let winfo = WriterInfo {
            txn: info(1, Mode::Write),
            truncated: false,
            response: ResponseInfo {
                headers: Some(response),
                ..Default::default()
            },
        };
        let (mut w1, _) = arena.add_to_entry(id, info(1, Mode::Write)).unwrap();
        assert!(granted(&mut w1).await);
        arena.done_with_response_headers(id, winfo).unwrap();

        let storage_entry = arena.get(id).unwrap().storage.clone();
        storage_entry
            .write_data(BODY_INDEX, 0, &[0u8; 10], true)
            .await
            .unwrap();
        let truncation = arena.done_with_entry(id, 1, Mode::Write, false, false);
        assert!(truncation.is_some());
        // no newcomer can join while the record is rewritten
        assert!(!arena.get(id).unwrap().writers_can_take_more());
    }
}
