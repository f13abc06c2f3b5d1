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

//! Cache mode selection and getting a turn on the entry

use super::*;
use crate::conf::CacheMode;
use crate::entry::OpKind;
use crate::lock::{LockStatus, LockWait};
use http::header::{IF_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE, PRAGMA, RANGE};
use std::time::Duration;

/// Requests with these headers skip the cache entirely
const PASS_THROUGH_HEADERS: [http::HeaderName; 3] = [IF_UNMODIFIED_SINCE, IF_MATCH, IF_RANGE];

impl Transaction {
    /// Derive the working request and the effective load flags from the initial request.
    pub(super) fn set_request(&mut self) {
        self.cache_entry_status = CacheEntryStatus::Undefined;
        self.external_validation = ExternalValidation::default();
        self.range_requested = false;
        self.partial = None;
        self.request = self.initial_request.clone();
        self.method = self.request.method().clone();
        self.effective_load_flags = self.request.load_flags;

        let conf = self.cache.conf();
        if conf.single_keyed_cache && self.request.checksum.as_deref().map_or(false, |c| !c.is_empty())
        {
            self.use_single_keyed = true;
        }
        if conf.mode == CacheMode::Disable {
            self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
        }

        let headers = self.request.headers();
        let range_found = headers.contains_key(RANGE);

        // the first header that implies a behavior wins
        if PASS_THROUGH_HEADERS.iter().any(|h| headers.contains_key(h)) {
            self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
        } else if has_header_value(headers, CACHE_CONTROL, "no-cache")
            || has_header_value(headers, PRAGMA, "no-cache")
        {
            self.effective_load_flags |= LoadFlags::BYPASS_CACHE;
        } else if has_header_value(headers, CACHE_CONTROL, "max-age=0") {
            self.effective_load_flags |= LoadFlags::VALIDATE_CACHE;
        }

        let mut external_validation_error = false;
        for (i, (name, _)) in VALIDATION_HEADERS.iter().enumerate() {
            let mut values = headers.get_all(name).iter();
            let Some(value) = values.next() else {
                continue;
            };
            let value = value.to_str().unwrap_or_default();
            if values.next().is_some() || value.is_empty() {
                external_validation_error = true;
            }
            self.external_validation.values[i] = Some(value.to_string());
            self.external_validation.initialized = true;
        }

        if range_found && self.external_validation.initialized {
            warn!("range request with validators of the caller, bypassing the cache");
            self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
        }
        if external_validation_error {
            warn!("invalid validators of the caller, bypassing the cache");
            self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
        }
        if self.external_validation.initialized {
            self.cache
                .observer
                .record_event(EventKind::ExternallyConditionalized, &self.request.url());
        }

        if range_found && !self.effective_load_flags.contains(LoadFlags::DISABLE_CACHE) {
            self.update_cache_entry_status(CacheEntryStatus::Other);
            let mut partial = PartialData::new();
            if self.method == Method::GET && partial.init(self.request.headers()) {
                // the range goes back on the request once the entry says what is missing
                let mut headers = self.request.headers().clone();
                headers.remove(RANGE);
                partial.set_headers(headers.clone());
                self.request.header.set_headers(headers);
                self.partial = Some(partial);
            } else {
                debug!("unsupported byte range, bypassing the cache");
                self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
            }
        }
    }

    fn should_pass_through(&self) -> bool {
        if self.storage.is_none()
            || self
                .effective_load_flags
                .contains(LoadFlags::DISABLE_CACHE)
        {
            return true;
        }
        // a transient isolation key can't address a split cache
        if self.cache.conf().split_cache && self.request.isolation_key.is_none() {
            return true;
        }
        let cacheable = match self.method {
            Method::GET | Method::HEAD | Method::DELETE | Method::PATCH => true,
            Method::POST => self.request.has_upload && self.request.upload_id != 0,
            Method::PUT => self.request.has_upload,
            _ => false,
        };
        !cacheable
    }

    pub(super) async fn get_backend(&mut self) -> Step {
        self.cache_pending = true;
        self.storage = self.cache.storage().await;
        Step::to(State::GetBackendComplete)
    }

    /// Pick the mode from the load flags and the method.
    pub(super) fn get_backend_complete(&mut self) -> Step {
        self.cache_pending = false;
        self.mode = Mode::None;
        let flags = self.effective_load_flags;

        if !self.should_pass_through() {
            let conf = self.cache.conf();
            self.cache_key = Some(CacheKey::from_request(
                &self.request,
                conf.split_cache,
                self.use_single_keyed,
            ));

            if flags.contains(LoadFlags::ONLY_FROM_CACHE) {
                if flags.contains(LoadFlags::BYPASS_CACHE) {
                    return Step::fail(
                        State::FinishHeaders,
                        CacheMiss,
                        "the cache can't be both required and bypassed",
                    );
                }
                self.mode = Mode::Read;
            } else if flags.contains(LoadFlags::BYPASS_CACHE) {
                self.mode = Mode::Write;
            } else {
                self.mode = Mode::ReadWrite;
            }

            if self.external_validation.initialized {
                self.mode = if self.mode.can_write() {
                    Mode::Update
                } else {
                    Mode::None
                };
            }
        }

        // write methods only ever invalidate
        if self.request.is_write_method() && !matches!(self.mode, Mode::ReadWrite | Mode::Write) {
            self.mode = Mode::None;
        }
        // nothing to store for a HEAD without an entry to update
        if self.method == Method::HEAD && self.mode == Mode::Write {
            self.mode = Mode::None;
        }
        if !self.mode.can_read() && flags.contains(LoadFlags::ONLY_FROM_CACHE) {
            return Step::fail(State::FinishHeaders, CacheMiss, "the cache can't be used");
        }

        debug!(
            "txn {} {} {} mode {}",
            self.id,
            self.method,
            self.key_str(),
            self.mode.as_str()
        );
        let next = if self.mode == Mode::None {
            self.restore_partial_headers();
            self.partial = None;
            State::SendRequest
        } else {
            State::InitEntry
        };
        self.range_requested = self.partial.is_some();
        Step::to(next)
    }

    pub(super) fn init_entry(&mut self) -> Step {
        if self.mode == Mode::Write {
            Step::to(State::DoomEntry)
        } else {
            Step::to(State::OpenOrCreateEntry)
        }
    }

    /// Write methods and HEADs only use an entry that exists.
    pub(super) fn should_open_only(&self) -> bool {
        self.request.is_write_method()
            || (self.method == Method::HEAD && self.mode == Mode::ReadWrite)
    }

    fn maybe_reject_based_on_entry_in_memory_data(&self, hints: u8) -> bool {
        if self.partial.is_some() || self.mode != Mode::ReadWrite {
            return false;
        }
        if self
            .effective_load_flags
            .intersects(LoadFlags::SKIP_CACHE_VALIDATION | LoadFlags::ONLY_FROM_CACHE)
        {
            return false;
        }
        hints & HINT_UNUSABLE_PER_CACHING_HEADERS == HINT_UNUSABLE_PER_CACHING_HEADERS
    }

    pub(super) async fn open_or_create_entry(&mut self) -> Step {
        let Some(key) = self.cache_key.clone() else {
            return Step::fail(State::FinishHeaders, InternalError, "no cache key");
        };
        self.cache_pending = true;

        let mut not_suitable = false;
        let active = self.cache.arena.lock().find_active(&key);
        if active.is_none() {
            if let Some(storage) = self.storage.clone() {
                let hints = storage.get_entry_in_memory_data(&key);
                if self.maybe_reject_based_on_entry_in_memory_data(hints) {
                    // the stored response would be replaced anyway
                    debug!("entry {key} can't be validated, dooming it");
                    if let Err(e) = storage.doom_entry(&key).await {
                        debug!("failed to doom {key}: {e}");
                    }
                    not_suitable = true;
                    self.couldnt_conditionalize = true;
                    self.update_cache_entry_status(CacheEntryStatus::CantConditionalize);
                }
            }
        }

        let kind = if self.mode != Mode::ReadWrite || self.should_open_only() {
            if not_suitable {
                return Step::fail(
                    State::OpenOrCreateEntryComplete,
                    CacheEntryNotSuitable,
                    "entry not suitable",
                );
            }
            OpKind::Open
        } else {
            OpKind::OpenOrCreate
        };

        let rv = match self.cache.entry_op(&key, self.id, kind).await {
            Ok(Some((id, created))) => {
                self.new_entry = Some(id);
                self.new_entry_created = created;
                Ok(0)
            }
            Ok(None) => Error::e_explain(CacheRace, "entry was doomed"),
            Err(e) => Err(e),
        };
        Step::new(State::OpenOrCreateEntryComplete, rv)
    }

    pub(super) fn open_or_create_entry_complete(&mut self, rv: Rv) -> Step {
        self.cache_pending = false;
        let e = match rv {
            Ok(_) => {
                if self.new_entry_created {
                    self.mode = Mode::Write;
                }
                return Step::to(State::AddToEntry);
            }
            Err(e) => e,
        };
        if e.etype() == &CacheRace {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        debug!("unable to open or create {}: {e}", self.key_str());

        if self.should_open_only() {
            self.mode = Mode::None;
            return Step::to(State::SendRequest);
        }
        match self.mode {
            Mode::Read => Step::fail(State::FinishHeaders, CacheMiss, "no entry to read"),
            Mode::ReadWrite => {
                self.mode = Mode::None;
                self.restore_partial_headers();
                Step::to(State::SendRequest)
            }
            Mode::Update => {
                self.mode = Mode::None;
                Step::to(State::SendRequest)
            }
            _ => Step::new(State::FinishHeaders, Err(e)),
        }
    }

    pub(super) async fn doom_entry(&mut self) -> Step {
        let Some(key) = self.cache_key.clone() else {
            return Step::fail(State::FinishHeaders, InternalError, "no cache key");
        };
        self.cache_pending = true;
        let rv = self
            .cache
            .entry_op(&key, self.id, OpKind::Doom)
            .await
            .map(|_| 0);
        Step::new(State::DoomEntryComplete, rv)
    }

    pub(super) fn doom_entry_complete(&mut self, rv: Rv) -> Step {
        self.cache_pending = false;
        if rv_is(&rv, &CacheRace) {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        Step::to(State::CreateEntry)
    }

    pub(super) async fn create_entry(&mut self) -> Step {
        let Some(key) = self.cache_key.clone() else {
            return Step::fail(State::FinishHeaders, InternalError, "no cache key");
        };
        self.cache_pending = true;
        let rv = match self.cache.entry_op(&key, self.id, OpKind::Create).await {
            Ok(Some((id, _))) => {
                self.new_entry = Some(id);
                Ok(0)
            }
            Ok(None) => Error::e_explain(CacheRace, "entry was doomed"),
            Err(e) => Err(e),
        };
        Step::new(State::CreateEntryComplete, rv)
    }

    pub(super) fn create_entry_complete(&mut self, rv: Rv) -> Step {
        self.cache_pending = false;
        let e = match rv {
            Ok(_) => return Step::to(State::AddToEntry),
            Err(e) => e,
        };
        if e.etype() == &CacheRace {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        warn!("unable to create {}: {e}", self.key_str());
        self.mode = Mode::None;
        if !self.done_headers_create_new_entry {
            self.restore_partial_headers();
            return Step::to(State::SendRequest);
        }
        // the response is handed out without being stored
        self.done_headers_create_new_entry = false;
        Step::to(State::CacheWriteResponse)
    }

    /// Wait for the turn of the transaction on `wait`.
    async fn wait_for_entry(&mut self, wait: &mut LockWait, timeout: Option<Duration>) -> Rv {
        match wait.wait(timeout).await {
            Ok(LockStatus::Granted) => Ok(0),
            Err(LockStatus::Timeout) => {
                self.cache
                    .observer
                    .record_event(EventKind::LockTimeout, self.key_str());
                Error::e_explain(
                    CacheLockTimeout,
                    format!("waited {:?} for {}", wait.elapsed(), self.key_str()),
                )
            }
            Ok(status) | Err(status) => {
                debug!("txn {} lost entry {}: {status:?}", self.id, self.key_str());
                Error::e_explain(CacheRace, "entry changed while waiting")
            }
        }
    }

    pub(super) async fn add_to_entry(&mut self) -> Step {
        let Some(new_entry) = self.new_entry else {
            return Step::fail(State::FinishHeaders, InternalError, "no entry to join");
        };
        self.cache_pending = true;
        let added = self
            .cache
            .arena
            .lock()
            .add_to_entry(new_entry, self.txn_info());

        let next = if self.done_headers_create_new_entry {
            State::DoneHeadersAddToEntryComplete
        } else {
            State::AddToEntryComplete
        };
        let (mut wait, partial_timeout) = match added {
            Ok(added) => added,
            Err(e) => return Step::new(next, Err(e)),
        };
        // the response is already here, it only needs the new entry
        let timeout = if self.done_headers_create_new_entry {
            None
        } else if partial_timeout && self.partial.is_some() {
            Some(self.cache.conf().partial_lock_timeout())
        } else {
            Some(self.cache.conf().lock_timeout())
        };
        let rv = self.wait_for_entry(&mut wait, timeout).await;
        Step::new(next, rv)
    }

    pub(super) fn add_to_entry_complete(&mut self, rv: Rv) -> Step {
        self.cache_pending = false;
        let new_entry = self.new_entry.take();

        if rv_is(&rv, &CacheRace) {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        if rv_is(&rv, &CacheLockTimeout) {
            if let Some(key) = self.cache_key.as_ref() {
                self.cache
                    .arena
                    .lock()
                    .remove_pending_transaction(new_entry, key, self.id);
            }
            if self.mode == Mode::Read {
                return Step::fail(State::FinishHeaders, CacheMiss, "timed out waiting for entry");
            }
            // go to the network without the cache
            self.mode = Mode::None;
            self.restore_partial_headers();
            self.partial = None;
            return Step::to(State::SendRequest);
        }
        if let Err(e) = rv {
            return Step::new(State::FinishHeaders, Err(e));
        }

        self.entry = new_entry;
        if self.mode == Mode::Write {
            self.restore_partial_headers();
            return Step::to(State::SendRequest);
        }
        Step::to(State::CacheReadResponse)
    }

    pub(super) fn done_headers_add_to_entry_complete(&mut self, rv: Rv) -> Step {
        self.cache_pending = false;
        self.done_headers_create_new_entry = false;
        let new_entry = self.new_entry.take();
        if rv.is_err() {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        self.entry = new_entry;
        Step::to(State::CacheWriteResponse)
    }

    /// The entry went away under the transaction: start the headers phase over.
    pub(super) async fn headers_phase_cannot_proceed(&mut self, rv: Rv) -> Step {
        debug!("txn {} restarts its headers phase", self.id);
        self.network = None;
        self.new_response = None;
        self.new_entry = None;
        if self.entry.is_some() {
            self.release_entry(true).await;
        }
        // after a lock timeout, don't wait for the entry again
        if rv_is(&rv, &CacheLockTimeout) {
            self.effective_load_flags |= LoadFlags::DISABLE_CACHE;
        }
        Step::to(State::GetBackend)
    }

    /// Leave the headers phase and queue up to read or write the body.
    pub(super) async fn finish_headers(&mut self, rv: Rv) -> Step {
        let Some(entry) = self.entry else {
            return Step::done(rv);
        };
        if rv.is_err() {
            return Step::done(rv);
        }
        if self.auth_response.headers.is_some() {
            // the caller decides about the challenge first
            return Step::new(State::FinishHeadersComplete, Ok(0));
        }

        let (added, partial_timeout) = {
            let mut arena = self.cache.arena.lock();
            let partial_timeout = self.partial.is_some()
                && arena
                    .writers_mut(entry)
                    .map_or(false, |w| !w.is_empty() && w.is_exclusive());
            (
                arena.done_with_response_headers(entry, self.writer_info()),
                partial_timeout,
            )
        };
        let rv = match added {
            Ok(None) => Ok(0),
            Ok(Some(mut wait)) => {
                self.cache
                    .observer
                    .record_event(EventKind::LockWait, self.key_str());
                let timeout = if partial_timeout {
                    self.cache.conf().partial_lock_timeout()
                } else {
                    self.cache.conf().lock_timeout()
                };
                self.wait_for_entry(&mut wait, Some(timeout)).await
            }
            Err(e) => Err(e),
        };
        Step::new(State::FinishHeadersComplete, rv)
    }

    pub(super) async fn finish_headers_complete(&mut self, rv: Rv) -> Step {
        if rv_is(&rv, &CacheLockTimeout) {
            self.done_with_entry(false).await;
            return Step::new(State::HeadersPhaseCannotProceed, rv);
        }
        if rv_is(&rv, &CacheRace) {
            // the arena let go of the transaction already
            self.entry = None;
            return Step::new(State::HeadersPhaseCannotProceed, rv);
        }
        if rv.is_err() {
            return Step::done(rv);
        }

        if let Some(entry) = self.entry {
            if self.network.is_some() && self.in_writers() {
                if let Some(network) = self.network.take() {
                    let checksum = match (self.checksum.take(), self.request.checksum.clone()) {
                        (Some(checksum), Some(expected)) => Some((checksum, expected)),
                        _ => None,
                    };
                    writers::set_network_transaction(
                        &self.cache,
                        entry,
                        self.id,
                        network,
                        checksum,
                    )
                    .await;
                }
            }
        }

        if !self.reading {
            return Step::done(rv);
        }
        match self.transition_to_reading_state() {
            Ok(State::None) => Step::done(Ok(0)),
            Ok(next) => Step::to(next),
            Err(e) => Step::done(Err(e)),
        }
    }
}
