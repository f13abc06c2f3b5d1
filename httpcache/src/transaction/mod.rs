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

//! Cache transactions
//!
//! A [Transaction] carries one request through the cache. It is a state machine: each state does
//! one step (open the entry, read the stored response, send the request...) and names the next
//! one. [Transaction::start()] runs the states until the response headers are known and
//! [Transaction::read()] runs them until some body bytes are.
//!
//! The states are split by phase:
//! - `headers`: finding the entry and waiting for a turn on it
//! - `validate`: deciding what to do with the stored response
//! - `send`: talking to the server and storing what it said
//! - `read`: moving body bytes

mod headers;
mod read;
mod send;
mod state;
mod validate;

use super::*;
use crate::checksum::ResponseChecksum;
use crate::entry::{Notice, TxnInfo};
use crate::network::NetworkTransaction;
use crate::observer::EventKind;
use crate::partial::PartialData;
use crate::record::CachedResponseRecord;
use crate::request::{AuthCredentials, LoadFlags};
use crate::storage::{EntryRef, BODY_INDEX, RESPONSE_INFO_INDEX};
use crate::validation::compute_unusable_per_caching_headers;
use crate::vary::VaryData;
use crate::writers::WriterInfo;
use http::header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use state::{rv_is, Rv, State, Step};

/// How a transaction uses the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum Mode {
    /// The cache is not involved
    None,
    /// Serve from the cache only
    Read,
    /// Replace the entry with a network response
    Write,
    /// Use the entry, validating or replacing it as needed
    ReadWrite,
    /// The caller validates its own copy. Only the stored headers can change.
    Update,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Whether the stored response is looked at
    pub fn can_read(&self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite | Mode::Update)
    }

    /// Whether the entry can be changed
    pub fn can_write(&self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite | Mode::Update)
    }
}

/// The request validators of the caller and the response headers they are compared to
const VALIDATION_HEADERS: [(http::HeaderName, http::HeaderName); 2] = [
    (IF_MODIFIED_SINCE, LAST_MODIFIED),
    (IF_NONE_MATCH, ETAG),
];

#[derive(Debug, Default)]
struct ExternalValidation {
    values: [Option<String>; 2],
    initialized: bool,
}

/// One request through the [HttpCache]
pub struct Transaction {
    cache: Arc<HttpCache>,
    id: TxnId,
    priority: RequestPriority,
    /// The request as the caller sent it
    initial_request: RequestInfo,
    /// The request sent to the server, its headers change with validation and ranges
    request: RequestInfo,
    method: Method,
    effective_load_flags: LoadFlags,
    cache_key: Option<CacheKey>,
    storage: Option<Arc<dyn Storage>>,
    external_validation: ExternalValidation,

    mode: Mode,
    entry: Option<EntryId>,
    /// The entry being opened or joined, before the transaction is admitted to it
    new_entry: Option<EntryId>,
    new_entry_created: bool,
    /// Waiting for a storage operation or for a turn on an entry
    cache_pending: bool,

    network: Option<Box<dyn NetworkTransaction>>,
    /// The response received from the network, until it is merged or stored
    new_response: Option<ResponseInfo>,
    response: ResponseInfo,
    auth_response: ResponseInfo,
    updated_prefetch_response: Option<ResponseInfo>,
    /// The serialized record while it is read
    record_buf: Vec<u8>,

    partial: Option<PartialData>,
    range_requested: bool,
    is_sparse: bool,
    truncated: bool,
    invalid_range: bool,
    handling_206: bool,

    couldnt_conditionalize: bool,
    vary_mismatch: bool,
    reading: bool,
    done_headers_create_new_entry: bool,
    use_single_keyed: bool,
    mark_unusable: bool,

    read_offset: u64,
    checksum: Option<ResponseChecksum>,
    shared_writing_error: Option<ErrorType>,
    read_error_restarts: u8,
    cache_entry_status: CacheEntryStatus,
}

impl Transaction {
    pub(crate) fn new(cache: Arc<HttpCache>, id: TxnId, priority: RequestPriority) -> Self {
        Transaction {
            cache,
            id,
            priority,
            initial_request: RequestInfo::default(),
            request: RequestInfo::default(),
            method: Method::GET,
            effective_load_flags: LoadFlags::NORMAL,
            cache_key: None,
            storage: None,
            external_validation: ExternalValidation::default(),
            mode: Mode::None,
            entry: None,
            new_entry: None,
            new_entry_created: false,
            cache_pending: false,
            network: None,
            new_response: None,
            response: ResponseInfo::default(),
            auth_response: ResponseInfo::default(),
            updated_prefetch_response: None,
            record_buf: vec![],
            partial: None,
            range_requested: false,
            is_sparse: false,
            truncated: false,
            invalid_range: false,
            handling_206: false,
            couldnt_conditionalize: false,
            vary_mismatch: false,
            reading: false,
            done_headers_create_new_entry: false,
            use_single_keyed: false,
            mark_unusable: false,
            read_offset: 0,
            checksum: None,
            shared_writing_error: None,
            read_error_restarts: 0,
            cache_entry_status: CacheEntryStatus::Undefined,
        }
    }

    /// Run `request` until its response headers are available from [Self::response_info()].
    pub async fn start(&mut self, request: &RequestInfo) -> Result<()> {
        self.initial_request = request.clone();
        self.set_request();
        self.do_loop(State::GetBackend, Ok(0), &mut []).await?;
        Ok(())
    }

    /// Read body bytes into `buf`. 0 means the body is done.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Error::e_explain(InternalError, "read with an empty buffer");
        }
        if self.auth_response.headers.is_some() && self.mode != Mode::None {
            // the caller reads the body of the 401, it won't make it into the entry
            self.update_cache_entry_status(CacheEntryStatus::Other);
            let keep_entry = self.mode == Mode::ReadWrite;
            self.stop_caching_impl(keep_entry).await;
        }
        self.reading = true;
        self.drain_notices();
        match self.transition_to_reading_state()? {
            State::None => Ok(0),
            next => self.do_loop(next, Ok(0), buf).await,
        }
    }

    /// Send the request again with `credentials` after a 401 or 407.
    pub async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<()> {
        self.auth_response = ResponseInfo::default();
        let rv = match self.network.as_mut() {
            Some(network) => network.restart_with_auth(credentials).await.map(|_| 0),
            None => Error::e_explain(InternalError, "no network transaction to restart"),
        };
        self.do_loop(State::SendRequestComplete, rv, &mut [])
            .await?;
        Ok(())
    }

    /// Send the request again, ignoring the error the last attempt ended with.
    pub async fn restart_ignoring_last_error(&mut self) -> Result<()> {
        let rv = match self.network.as_mut() {
            Some(network) => network.restart_ignoring_last_error().await.map(|_| 0),
            None => Error::e_explain(InternalError, "no network transaction to restart"),
        };
        self.do_loop(State::SendRequestComplete, rv, &mut [])
            .await?;
        Ok(())
    }

    /// The response. An authentication challenge shadows the response while it is pending.
    pub fn response_info(&self) -> &ResponseInfo {
        if self.auth_response.headers.is_some() {
            &self.auth_response
        } else {
            &self.response
        }
    }

    /// Whether [Self::restart_with_auth()] can go on without asking for credentials
    pub fn is_ready_to_restart_for_auth(&self) -> bool {
        self.network
            .as_ref()
            .map_or(false, |n| n.is_ready_to_restart_for_auth())
    }

    /// The caller read everything it wanted, the entry is complete as far as it is concerned.
    pub fn done_reading(&mut self) {
        if self.entry.is_some() {
            self.release_entry_detached(true);
            self.mode = Mode::None;
        }
    }

    /// Keep reading from the network but stop writing to the cache.
    pub fn stop_caching(&mut self) {
        let Some(entry) = self.entry else {
            return;
        };
        if !self.mode.can_write() || self.is_sparse || self.range_requested {
            return;
        }
        let in_writers = self.in_writers();
        let has_network = self.network.is_some()
            || (in_writers
                && self
                    .cache
                    .arena
                    .lock()
                    .writers_mut(entry)
                    .map_or(false, |w| w.has_network()));
        if !has_network {
            return;
        }
        if in_writers {
            let stopped = self.cache.arena.lock().writers_stop_caching(entry, false);
            if stopped {
                self.mode = Mode::None;
            }
        } else {
            self.release_entry_detached(false);
            self.mode = Mode::None;
        }
    }

    pub fn set_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
        if let Some(network) = self.network.as_mut() {
            network.set_priority(priority);
        }
        if let Some(entry) = self.entry {
            if self.in_writers() {
                writers::set_priority(&self.cache, entry, self.id, priority);
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cache_entry_status(&self) -> CacheEntryStatus {
        self.cache_entry_status
    }

    pub fn load_flags(&self) -> LoadFlags {
        self.effective_load_flags
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    async fn do_loop(&mut self, mut state: State, mut rv: Rv, buf: &mut [u8]) -> Rv {
        loop {
            if self.drain_notices() {
                state = State::HeadersPhaseCannotProceed;
            }
            trace!("txn {} state {}", self.id, state.as_str());
            let step = self.handle(state, rv, buf).await;
            state = step.next;
            rv = step.rv;
            if state == State::None {
                self.drain_notices();
                return rv;
            }
        }
    }

    async fn handle(&mut self, state: State, rv: Rv, buf: &mut [u8]) -> Step {
        match state {
            State::None => Step::done(rv),
            State::GetBackend => self.get_backend().await,
            State::GetBackendComplete => self.get_backend_complete(),
            State::InitEntry => self.init_entry(),
            State::OpenOrCreateEntry => self.open_or_create_entry().await,
            State::OpenOrCreateEntryComplete => self.open_or_create_entry_complete(rv),
            State::DoomEntry => self.doom_entry().await,
            State::DoomEntryComplete => self.doom_entry_complete(rv),
            State::CreateEntry => self.create_entry().await,
            State::CreateEntryComplete => self.create_entry_complete(rv),
            State::AddToEntry => self.add_to_entry().await,
            State::AddToEntryComplete => self.add_to_entry_complete(rv),
            State::DoneHeadersAddToEntryComplete => self.done_headers_add_to_entry_complete(rv),
            State::CacheReadResponse => self.cache_read_response().await,
            State::CacheReadResponseComplete => self.cache_read_response_complete(rv).await,
            State::WriteUpdatedPrefetchResponse => self.write_updated_prefetch_response().await,
            State::WriteUpdatedPrefetchResponseComplete => {
                self.on_write_response_info_to_entry_complete(rv).await;
                Step::to(State::CacheDispatchValidation)
            }
            State::CacheDispatchValidation => self.cache_dispatch_validation().await,
            State::CacheQueryData => self.cache_query_data().await,
            State::CacheQueryDataComplete => self.cache_query_data_complete(rv).await,
            State::StartPartialCacheValidation => self.start_partial_cache_validation().await,
            State::CompletePartialCacheValidation => {
                self.complete_partial_cache_validation(rv).await
            }
            State::CacheUpdateStaleWhileRevalidateTimeout => {
                self.cache_update_stale_while_revalidate_timeout().await
            }
            State::CacheUpdateStaleWhileRevalidateTimeoutComplete => {
                self.on_write_response_info_to_entry_complete(rv).await;
                Step::to(State::ConnectedCallback)
            }
            State::ConnectedCallback => self.connected_callback(),
            State::ConnectedCallbackComplete => self.connected_callback_complete(rv).await,
            State::SetupEntryForRead => self.setup_entry_for_read(),
            State::SendRequest => self.send_request().await,
            State::SendRequestComplete => self.send_request_complete(rv).await,
            State::SuccessfulSendRequest => self.successful_send_request().await,
            State::UpdateCachedResponse => self.update_cached_response(),
            State::CacheWriteUpdatedResponse => self.cache_write_updated_response().await,
            State::CacheWriteUpdatedResponseComplete => {
                self.on_write_response_info_to_entry_complete(rv).await;
                Step::to(State::UpdateCachedResponseComplete)
            }
            State::UpdateCachedResponseComplete => self.update_cached_response_complete().await,
            State::OverwriteCachedResponse => self.overwrite_cached_response().await,
            State::CacheWriteResponse => self.cache_write_response().await,
            State::CacheWriteResponseComplete => {
                self.on_write_response_info_to_entry_complete(rv).await;
                Step::to(State::TruncateCachedData)
            }
            State::TruncateCachedData => self.truncate_cached_data().await,
            State::TruncateCachedDataComplete => {
                if let Err(e) = rv {
                    warn!("failed to truncate the body of {}: {e}", self.key_str());
                }
                Step::to(State::PartialHeadersReceived)
            }
            State::PartialHeadersReceived => self.partial_headers_received(),
            State::HeadersPhaseCannotProceed => self.headers_phase_cannot_proceed(rv).await,
            State::FinishHeaders => self.finish_headers(rv).await,
            State::FinishHeadersComplete => self.finish_headers_complete(rv).await,
            State::NetworkReadCacheWrite => self.network_read_cache_write(buf).await,
            State::NetworkReadCacheWriteComplete => self.network_read_cache_write_complete(rv).await,
            State::CacheReadData => self.cache_read_data(buf).await,
            State::CacheReadDataComplete => self.cache_read_data_complete(rv, buf).await,
            State::NetworkRead => self.network_read(buf).await,
            State::NetworkReadComplete => self.network_read_complete(rv).await,
            State::MarkSingleKeyedCacheEntryUnusable => {
                self.mark_single_keyed_cache_entry_unusable().await
            }
            State::MarkSingleKeyedCacheEntryUnusableComplete => {
                self.mark_single_keyed_cache_entry_unusable_complete(rv)
                    .await
            }
        }
    }

    /// Apply what the arena decided about this transaction meanwhile.
    ///
    /// Return true when the headers phase has to start over.
    fn drain_notices(&mut self) -> bool {
        let notices = self.cache.arena.lock().take_notices(self.id);
        let mut cannot_proceed = false;
        for notice in notices {
            debug!("txn {} notice {notice:?}", self.id);
            match notice {
                Notice::LeaveWriters(err) => {
                    self.entry = None;
                    self.mode = Mode::None;
                    if err.is_some() {
                        self.shared_writing_error = err;
                    }
                }
                Notice::PromoteToReader => self.mode = Mode::Read,
                Notice::CannotProceed => {
                    self.entry = None;
                    cannot_proceed = !self.reading;
                }
            }
        }
        cannot_proceed
    }

    /// Where [Self::read()] starts
    fn transition_to_reading_state(&self) -> Result<State> {
        let Some(entry) = self.entry else {
            if self.network.is_some() {
                return Ok(State::NetworkRead);
            }
            return match &self.shared_writing_error {
                Some(etype) => Error::e_explain(etype.clone(), "writing the shared entry failed"),
                None => Ok(State::None),
            };
        };

        let arena = self.cache.arena.lock();
        let Some(active) = arena.get(entry) else {
            return Ok(State::CacheReadData);
        };
        let Some(writers) = active.writers.as_ref().filter(|w| w.contains(self.id)) else {
            return Ok(State::CacheReadData);
        };
        if self.partial.is_some() {
            return Ok(if writers.has_network() {
                State::NetworkReadCacheWrite
            } else {
                State::CacheReadData
            });
        }
        // a writer that fell behind catches up from the entry first
        if self.read_offset == active.storage.data_size(BODY_INDEX) || writers.network_read_only()
        {
            Ok(State::NetworkReadCacheWrite)
        } else {
            Ok(State::CacheReadData)
        }
    }

    /* Entry bookkeeping */

    fn txn_info(&self) -> TxnInfo {
        TxnInfo {
            id: self.id,
            mode: self.mode,
            is_partial: self.partial.is_some(),
            is_get: self.method == Method::GET,
            content_length: self
                .response
                .headers
                .as_ref()
                .and_then(|h| h.content_length()),
            priority: self.priority,
        }
    }

    fn writer_info(&self) -> WriterInfo {
        WriterInfo {
            txn: self.txn_info(),
            truncated: self.truncated,
            response: self.response.clone(),
        }
    }

    fn in_writers(&self) -> bool {
        self.entry
            .map_or(false, |e| self.cache.arena.lock().in_writers(e, self.id))
    }

    fn is_writing_in_progress(&self) -> bool {
        self.entry
            .map_or(false, |e| self.cache.arena.lock().is_writing_in_progress(e))
    }

    fn entry_storage(&self) -> Option<EntryRef> {
        let entry = self.entry?;
        self.cache
            .arena
            .lock()
            .get(entry)
            .map(|e| e.storage.clone())
    }

    fn entry_doomed(&self) -> bool {
        self.entry.map_or(false, |e| {
            self.cache.arena.lock().get(e).map_or(true, |e| e.doomed)
        })
    }

    fn doom_key(&self) {
        if let Some(key) = self.cache_key.as_ref() {
            self.cache.arena.lock().doom_key(key);
        }
    }

    fn key_str(&self) -> &str {
        self.cache_key.as_ref().map_or("-", |k| k.as_str())
    }

    /// Leave the entry, keeping the mode.
    async fn release_entry(&mut self, complete: bool) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let truncation = self.cache.arena.lock().done_with_entry(
            entry,
            self.id,
            self.mode,
            complete,
            self.partial.is_some(),
        );
        if let Some(truncation) = truncation {
            truncation.run(&self.cache).await;
        }
    }

    fn release_entry_detached(&mut self, complete: bool) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let truncation = self.cache.arena.lock().done_with_entry(
            entry,
            self.id,
            self.mode,
            complete,
            self.partial.is_some(),
        );
        if let Some(truncation) = truncation {
            self.cache.finish_truncation(truncation);
        }
    }

    /// Leave the entry and the cache for good.
    async fn done_with_entry(&mut self, complete: bool) {
        if self.entry.is_none() {
            return;
        }
        self.release_entry(complete).await;
        self.mode = Mode::None;
    }

    /// Stop writing the entry. Return false if other writers keep it going.
    async fn stop_caching_impl(&mut self, success: bool) -> bool {
        let Some(entry) = self.entry else {
            return false;
        };
        if self.in_writers() {
            let stopped = self.cache.arena.lock().writers_stop_caching(entry, success);
            if stopped {
                self.mode = Mode::None;
            }
            return stopped;
        }
        self.done_with_entry(success).await;
        true
    }

    /* Response bookkeeping */

    fn set_response(&mut self, mut response: ResponseInfo) {
        if let Some(headers) = response.headers.as_ref() {
            response.vary_data = VaryData::init(&self.request.header, headers);
        }
        self.response = response;
        self.response.cache_entry_status = self.cache_entry_status;
    }

    fn update_cache_entry_status(&mut self, status: CacheEntryStatus) {
        self.cache_entry_status.update(status);
        self.response.cache_entry_status = self.cache_entry_status;
        self.auth_response.cache_entry_status = self.cache_entry_status;
    }

    /// The response of the network transaction, as the cache records it
    fn network_response_info(&self) -> Option<ResponseInfo> {
        let net = self.network.as_ref()?.response_info()?;
        Some(ResponseInfo {
            headers: Some(net.header.clone()),
            request_time: net.request_time,
            response_time: net.response_time,
            network_accessed: true,
            unused_since_prefetch: self.effective_load_flags.contains(LoadFlags::PREFETCH),
            restricted_prefetch: self
                .effective_load_flags
                .contains(LoadFlags::RESTRICTED_PREFETCH),
            ..Default::default()
        })
    }

    /// Start the body checksum over the headers of the response
    fn checksum_headers(&mut self) {
        self.checksum = self.response.headers.as_ref().map(ResponseChecksum::for_headers);
    }

    /// Whether the whole body matched the checksum of the request
    fn finish_and_check_checksum(&mut self) -> bool {
        let Some(checksum) = self.checksum.take() else {
            return true;
        };
        let Some(expected) = self.request.checksum.as_deref() else {
            return true;
        };
        if checksum.finish_and_check(expected) {
            return true;
        }
        self.cache
            .observer
            .record_event(EventKind::ChecksumMismatch, self.key_str());
        false
    }

    /// Put the headers of the pending range request back on the request.
    fn restore_partial_headers(&mut self) {
        if let Some(partial) = self.partial.as_ref() {
            let mut headers = HMap::new();
            partial.restore_headers(&mut headers);
            self.request.header.set_headers(headers);
        }
    }

    fn should_disable_caching(&self, headers: &ResponseHeader) -> bool {
        if headers.has_header_value(CACHE_CONTROL, "no-store") {
            return true;
        }
        let conf = self.cache.conf();
        if conf.disable_large_media_caching
            && headers.status != StatusCode::NOT_MODIFIED
            && headers
                .content_length()
                .map_or(false, |len| len > conf.large_media_threshold)
        {
            if let Some(mime) = headers.mime_type() {
                let mime = mime.to_ascii_lowercase();
                return mime.starts_with("video/") || mime.starts_with("audio/");
            }
        }
        false
    }

    /// Store `response` as the record of the entry.
    ///
    /// `Ok(0)` means nothing was written: there is no entry or the response is not to be stored.
    async fn write_response_info_to_entry(&mut self, response: &ResponseInfo, truncated: bool) -> Rv {
        let Some(entry) = self.entry else {
            return Ok(0);
        };
        let Some(headers) = response.headers.as_ref() else {
            return Error::e_explain(InternalError, "no response headers to store");
        };
        if self.should_disable_caching(headers) {
            debug!("not storing response of {}", self.key_str());
            if let (Some(partial), Some(headers)) =
                (self.partial.as_ref(), self.response.headers.as_mut())
            {
                if let Err(e) = partial.fix_response_headers(headers, true) {
                    warn!("failed to fix range response headers: {e}");
                }
            }
            self.stop_caching_impl(false).await;
            return Ok(0);
        }

        let record = CachedResponseRecord::new(response.clone(), truncated).serialize()?;
        let Some((storage, doomed)) = self
            .cache
            .arena
            .lock()
            .get(entry)
            .map(|e| (e.storage.clone(), e.doomed))
        else {
            return Error::e_explain(CacheRace, "entry is gone");
        };
        if !doomed {
            if let (Some(backend), Some(key)) = (self.storage.as_ref(), self.cache_key.as_ref()) {
                let hints = if compute_unusable_per_caching_headers(&self.response) {
                    HINT_UNUSABLE_PER_CACHING_HEADERS
                } else {
                    0
                };
                backend.set_entry_in_memory_data(key, hints);
            }
        }
        let n = storage
            .write_data(RESPONSE_INFO_INDEX, 0, &record, true)
            .await?;
        if n != record.len() {
            return Error::e_explain(CacheWriteFailure, "short write of the response record");
        }
        Ok(n)
    }

    async fn on_write_response_info_to_entry_complete(&mut self, rv: Rv) {
        if self.entry.is_none() {
            return;
        }
        if let Err(e) = rv {
            warn!("failed to store the response of {}: {e}", self.key_str());
            self.done_with_entry(false).await;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cache
            .observer
            .record_event(EventKind::CacheEntryStatus, self.cache_entry_status.as_str());
        if self.entry.is_some() {
            self.release_entry_detached(false);
        } else if self.cache_pending {
            // admitted or queued for an entry that the transaction never got to use
            if let Some(entry) = self.new_entry.take() {
                self.entry = Some(entry);
                self.release_entry_detached(false);
            }
            if let Some(key) = self.cache_key.as_ref() {
                self.cache
                    .arena
                    .lock()
                    .remove_pending_transaction(None, key, self.id);
            }
        }
        self.cache.arena.lock().take_notices(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mode() {
        assert!(Mode::Update.can_read());
        assert!(Mode::Update.can_write());
        assert!(!Mode::Read.can_write());
        assert!(!Mode::Write.can_read());
        assert!(!Mode::None.can_read() && !Mode::None.can_write());
        assert_eq!(Mode::ReadWrite.as_str(), "ReadWrite");
    }
}
