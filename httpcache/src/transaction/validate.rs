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

//! What to do with the stored response: use it, validate it or replace it

use super::*;
use crate::freshness::ValidationType;
use crate::request::FirstPartySetsFilter;
use crate::validation::{conditionalize, RangeValidation, Validation, ValidationInput};
use http::header::CONTENT_RANGE;

/// Entries written before the filter was last cleared can't be used
fn should_bypass_for_first_party_sets(
    filter: &FirstPartySetsFilter,
    browser_run_id: Option<i64>,
) -> bool {
    match (filter.clear_at_run_id, browser_run_id) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(clear_at), Some(run_id)) => run_id < clear_at,
    }
}

impl Transaction {
    pub(super) async fn cache_read_response(&mut self) -> Step {
        let Some(storage) = self.entry_storage() else {
            return Step::to(State::HeadersPhaseCannotProceed);
        };
        let len = storage.data_size(RESPONSE_INFO_INDEX) as usize;
        self.record_buf = vec![0; len];
        let rv = match storage
            .read_data(RESPONSE_INFO_INDEX, 0, &mut self.record_buf)
            .await
        {
            Ok(n) if n == len => Ok(n),
            Ok(n) => Error::e_explain(
                CacheReadFailure,
                format!("short read of the response record: {n} of {len}"),
            ),
            Err(e) => Err(e),
        };
        Step::new(State::CacheReadResponseComplete, rv)
    }

    pub(super) async fn cache_read_response_complete(&mut self, rv: Rv) -> Step {
        let buf = std::mem::take(&mut self.record_buf);
        let record = match rv.and_then(|_| CachedResponseRecord::deserialize(&buf)) {
            Ok(record) => record,
            Err(e) => return self.on_cache_read_error(e, true).await,
        };
        self.response = record.info;
        self.response.was_cached = true;
        self.response.cache_entry_status = self.cache_entry_status;
        self.truncated = record.truncated;

        if should_bypass_for_first_party_sets(
            &self.initial_request.fps_cache_filter,
            self.response.browser_run_id,
        ) {
            self.cache
                .observer
                .record_event(EventKind::FirstPartySetsBypass, self.key_str());
            let e = Error::explain(CacheEntryNotSuitable, "entry predates the first party sets");
            return self.on_cache_read_error(e, true).await;
        }

        if self.response.single_keyed_cache_entry_unusable {
            self.cache
                .observer
                .record_event(EventKind::SingleKeyedUnusable, self.key_str());
            if self.use_single_keyed {
                // try again with a key of its own
                self.use_single_keyed = false;
                self.release_entry(true).await;
                self.new_entry = None;
                return Step::to(State::GetBackend);
            }
            warn!("unusable mark on {} outside the single-keyed cache", self.key_str());
        }

        if !self.is_writing_in_progress() {
            let Some(storage) = self.entry_storage() else {
                return Step::to(State::HeadersPhaseCannotProceed);
            };
            let current_size = storage.data_size(BODY_INDEX);
            let full_len = self.response.headers.as_ref().and_then(|h| h.content_length());
            if full_len == Some(current_size) {
                self.truncated = false;
            }
            // too big to be resumed
            if (self.truncated || self.response.status_u16() == 206)
                && !self.range_requested
                && full_len.map_or(false, |len| len > i32::MAX as u64)
            {
                self.done_with_entry(false).await;
                return Step::to(State::SendRequest);
            }
        }

        let load_flags = self.request.load_flags;
        if self.response.restricted_prefetch
            && !load_flags.contains(LoadFlags::CAN_USE_RESTRICTED_PREFETCH)
        {
            return Step::to(State::SendRequest);
        }

        if self.response.unused_since_prefetch != load_flags.contains(LoadFlags::PREFETCH) {
            // the first use of a prefetch, or a prefetch of something already stored
            let mut updated = self.response.clone();
            updated.unused_since_prefetch = !self.response.unused_since_prefetch;
            if self.response.restricted_prefetch
                && load_flags.contains(LoadFlags::CAN_USE_RESTRICTED_PREFETCH)
            {
                updated.restricted_prefetch = false;
                self.cache
                    .observer
                    .record_event(EventKind::RestrictedPrefetchReuse, self.key_str());
            } else {
                self.cache
                    .observer
                    .record_event(EventKind::PrefetchReuse, self.key_str());
            }
            self.updated_prefetch_response = Some(updated);
            return Step::to(State::WriteUpdatedPrefetchResponse);
        }
        Step::to(State::CacheDispatchValidation)
    }

    pub(super) async fn write_updated_prefetch_response(&mut self) -> Step {
        let Some(updated) = self.updated_prefetch_response.take() else {
            return Step::to(State::CacheDispatchValidation);
        };
        let rv = self.write_response_info_to_entry(&updated, self.truncated).await;
        Step::new(State::WriteUpdatedPrefetchResponseComplete, rv)
    }

    pub(super) async fn cache_dispatch_validation(&mut self) -> Step {
        if self.entry.is_none() {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        match self.mode {
            Mode::Read => {
                self.update_cache_entry_status(CacheEntryStatus::Used);
                self.begin_cache_read()
            }
            Mode::ReadWrite => self.begin_partial_cache_validation().await,
            Mode::Update => self.begin_externally_conditionalized_request().await,
            _ => Step::fail(State::FinishHeaders, InternalError, "unexpected mode"),
        }
    }

    /// Evaluate the stored response against the request.
    fn requires_validation(&mut self) -> Validation {
        let validation = self.cache.validation.requires_validation(&ValidationInput {
            method: &self.method,
            request: &self.request.header,
            load_flags: self.effective_load_flags,
            response: &self.response,
            now: self.cache.now(),
        });
        self.vary_mismatch = validation.vary_mismatch;
        if let Some(cause) = validation.cause {
            let name: &str = cause.into();
            self.cache
                .observer
                .record_event(EventKind::ValidationCause, name);
        }
        validation
    }

    fn begin_cache_read(&mut self) -> Step {
        if self.response.status_u16() == 206 || self.partial.is_some() {
            return Step::fail(State::FinishHeaders, CacheMiss, "range entry in read mode");
        }
        if self.truncated {
            return Step::fail(State::FinishHeaders, CacheMiss, "truncated entry in read mode");
        }
        if self.requires_validation().kind != ValidationType::None {
            return Step::fail(State::FinishHeaders, CacheMiss, "stale entry in read mode");
        }
        if self.method == Method::HEAD {
            self.fix_headers_for_head();
        }
        Step::to(State::FinishHeaders)
    }

    pub(super) async fn begin_cache_validation(&mut self) -> Step {
        let required = self.requires_validation().kind;
        let mut skip_validation = required == ValidationType::None;
        let mut needs_stale_while_revalidate_update = false;

        if self
            .effective_load_flags
            .contains(LoadFlags::SUPPORT_ASYNC_REVALIDATION)
            && required == ValidationType::Asynchronous
        {
            // serve it now, the caller revalidates in the background
            skip_validation = true;
            self.response.async_revalidation_requested = true;
            needs_stale_while_revalidate_update = self.response.stale_revalidate_timeout.is_none();
        }

        if self.method == Method::HEAD
            && (self.truncated || self.response.status_u16() == 206)
        {
            if skip_validation {
                return Step::to(State::ConnectedCallback);
            }
            // a HEAD can't revalidate a range entry
            self.mode = Mode::None;
            return Step::to(State::SendRequest);
        }

        if self.truncated {
            self.update_cache_entry_status(CacheEntryStatus::Other);
            // only the one byte check is sent, a range request tells whether to resume
            skip_validation = !self
                .partial
                .as_ref()
                .map_or(false, |p| p.initial_validation());
        }

        if let Some(partial) = self.partial.as_ref() {
            let first_read_of_full_from_partial = self.is_sparse
                && !self.reading
                && !partial.range_requested()
                && !partial.is_last_range();
            if (self.is_sparse || self.truncated)
                && (!partial.is_current_range_cached()
                    || self.invalid_range
                    || first_read_of_full_from_partial)
            {
                skip_validation = false;
            }
        }

        if skip_validation {
            self.update_cache_entry_status(CacheEntryStatus::Used);
            return if needs_stale_while_revalidate_update {
                Step::to(State::CacheUpdateStaleWhileRevalidateTimeout)
            } else {
                Step::to(State::ConnectedCallback)
            };
        }

        if !self.conditionalize_request() {
            self.couldnt_conditionalize = true;
            self.update_cache_entry_status(CacheEntryStatus::CantConditionalize);
            if self.partial.is_some() {
                return self.restart_partial_request().await;
            }
        }
        Step::to(State::SendRequest)
    }

    /// Add the validators of the stored response to the request.
    fn conditionalize_request(&mut self) -> bool {
        let range = self.partial.as_ref().map(|p| RangeValidation {
            current_range_cached: p.is_current_range_cached(),
            invalid_range: self.invalid_range,
        });
        let mut headers = self.request.headers().clone();
        if !conditionalize(
            &self.response,
            &self.method,
            self.vary_mismatch,
            range,
            &mut headers,
        ) {
            return false;
        }
        self.request.header.set_headers(headers);
        true
    }

    async fn begin_partial_cache_validation(&mut self) -> Step {
        if self.response.status_u16() != 206 && self.partial.is_none() && !self.truncated {
            return self.begin_cache_validation().await;
        }
        self.update_cache_entry_status(CacheEntryStatus::Other);
        if self.method == Method::HEAD {
            return self.begin_cache_validation().await;
        }
        if !self.range_requested {
            // the whole resource out of a range entry, one sub range at a time
            let mut partial = PartialData::new();
            partial.set_headers(self.request.headers().clone());
            self.partial = Some(partial);
        }
        Step::to(State::CacheQueryData)
    }

    pub(super) async fn cache_query_data(&mut self) -> Step {
        let rv = match self.entry_storage() {
            Some(storage) => storage.ready_for_sparse_io().await.map(|_| 0),
            None => Ok(0),
        };
        Step::new(State::CacheQueryDataComplete, rv)
    }

    pub(super) async fn cache_query_data_complete(&mut self, rv: Rv) -> Step {
        if let Err(e) = rv {
            warn!("entry {} is not ready for range reads: {e}", self.key_str());
        }
        self.validate_entry_headers_and_continue().await
    }

    async fn validate_entry_headers_and_continue(&mut self) -> Step {
        let Some(storage) = self.entry_storage() else {
            return Step::to(State::HeadersPhaseCannotProceed);
        };
        let writing_in_progress = self.is_writing_in_progress();
        let usable = match (self.partial.as_mut(), self.response.headers.as_ref()) {
            (Some(partial), Some(headers)) => partial.update_from_stored_headers(
                headers,
                storage.as_ref(),
                self.truncated,
                writing_in_progress,
            ),
            _ => false,
        };
        if !usable {
            return self.restart_partial_request().await;
        }
        if self.response.status_u16() == 206 {
            self.is_sparse = true;
        }
        if !self
            .partial
            .as_mut()
            .map_or(false, |p| p.is_requested_range_ok())
        {
            self.invalid_range = true;
        }
        Step::to(State::StartPartialCacheValidation)
    }

    /// Look up the next sub range in the entry.
    pub(super) async fn start_partial_cache_validation(&mut self) -> Step {
        if self.mode == Mode::None {
            return Step::to(State::FinishHeaders);
        }
        let Some(storage) = self.entry_storage() else {
            return Step::to(State::FinishHeaders);
        };
        let rv = match self.partial.as_mut() {
            Some(partial) => partial.should_validate_cache(storage.as_ref()).await,
            None => Error::e_explain(InternalError, "no range to validate"),
        };
        Step::new(State::CompletePartialCacheValidation, rv)
    }

    pub(super) async fn complete_partial_cache_validation(&mut self, rv: Rv) -> Step {
        match rv {
            Ok(0) => {
                // every sub range is served
                self.done_with_entry(true).await;
                if self.reading {
                    return Step::done(Ok(0));
                }
                Step::to(State::FinishHeaders)
            }
            Err(e) => Step::new(State::FinishHeaders, Err(e)),
            Ok(_) => {
                if let Some(partial) = self.partial.as_mut() {
                    let mut headers = self.request.headers().clone();
                    partial.prepare_cache_validation(&mut headers);
                    self.request.header.set_headers(headers);
                }
                let current_range_cached = self
                    .partial
                    .as_ref()
                    .map_or(false, |p| p.is_current_range_cached());
                if self.reading && current_range_cached {
                    return Step::to(State::ConnectedCallback);
                }
                self.begin_cache_validation().await
            }
        }
    }

    pub(super) async fn cache_update_stale_while_revalidate_timeout(&mut self) -> Step {
        self.response.stale_revalidate_timeout =
            Some(self.cache.now() + self.cache.conf().stale_revalidate_timeout());
        let response = self.response.clone();
        let rv = self.write_response_info_to_entry(&response, false).await;
        Step::new(State::CacheUpdateStaleWhileRevalidateTimeoutComplete, rv)
    }

    pub(super) fn connected_callback(&mut self) -> Step {
        let rv = match self.cache.connected_hook.as_ref() {
            Some(hook) => hook
                .on_connected(&self.request.url(), &self.response)
                .map(|_| 0),
            None => Ok(0),
        };
        Step::new(State::ConnectedCallbackComplete, rv)
    }

    pub(super) async fn connected_callback_complete(&mut self, rv: Rv) -> Step {
        let e = match rv {
            Ok(_) => {
                return if self.reading {
                    Step::to(State::CacheReadData)
                } else {
                    Step::to(State::SetupEntryForRead)
                };
            }
            Err(e) => e,
        };
        let etype = e.etype().clone();
        match etype {
            CachedIpAddressSpaceBlocked => {
                // the stored response can't be used from here, the network one may
                self.doom_inconsistent_entry().await;
                self.update_cache_entry_status(CacheEntryStatus::Other);
                if self.reading {
                    Step::to(State::SendRequest)
                } else {
                    Step::to(State::HeadersPhaseCannotProceed)
                }
            }
            InconsistentIpAddressSpace => {
                self.doom_inconsistent_entry().await;
                Step::done(Err(e))
            }
            _ => {
                self.done_with_entry(true).await;
                Step::done(Err(e))
            }
        }
    }

    /// The entry was stored from a different address space than the one in use now.
    pub(super) async fn doom_inconsistent_entry(&mut self) {
        self.doom_key();
        self.done_with_entry(false).await;
    }

    pub(super) fn setup_entry_for_read(&mut self) -> Step {
        self.network = None;
        if self.entry.is_none() {
            return Step::to(State::HeadersPhaseCannotProceed);
        }
        if self.partial.is_some() {
            let status = self.response.status_u16();
            if self.truncated
                || self.is_sparse
                || (!self.invalid_range && (status == 200 || status == 206))
            {
                return Step::to(State::PartialHeadersReceived);
            }
            self.partial = None;
        }
        if !self.is_writing_in_progress() {
            self.mode = Mode::Read;
        }
        if self.method == Method::HEAD {
            self.fix_headers_for_head();
        }
        Step::to(State::FinishHeaders)
    }

    async fn begin_externally_conditionalized_request(&mut self) -> Step {
        let matches = self.external_validation_matches_entry();
        if self.response.status_u16() != 200 || self.truncated || !matches {
            // the caller has a different copy, forward its request as is
            self.update_cache_entry_status(CacheEntryStatus::Other);
            self.done_with_entry(true).await;
        }
        Step::to(State::SendRequest)
    }

    fn external_validation_matches_entry(&self) -> bool {
        VALIDATION_HEADERS
            .iter()
            .zip(self.external_validation.values.iter())
            .all(|((_, response_name), value)| match value {
                Some(value) => {
                    self.response.header_str(response_name.clone()) == Some(value.as_str())
                }
                None => true,
            })
    }

    /// A 206 of the stored response becomes the 200 of the whole resource.
    fn fix_headers_for_head(&mut self) {
        if self.response.status_u16() != 206 {
            return;
        }
        if let Some(headers) = self.response.headers.as_mut() {
            headers.remove_header(&CONTENT_RANGE);
            headers.replace_status(StatusCode::OK);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_party_sets_bypass() {
        let mut filter = FirstPartySetsFilter::default();
        assert!(!should_bypass_for_first_party_sets(&filter, None));
        assert!(!should_bypass_for_first_party_sets(&filter, Some(3)));

        filter.clear_at_run_id = Some(5);
        assert!(should_bypass_for_first_party_sets(&filter, None));
        assert!(should_bypass_for_first_party_sets(&filter, Some(4)));
        assert!(!should_bypass_for_first_party_sets(&filter, Some(5)));
        assert!(!should_bypass_for_first_party_sets(&filter, Some(6)));
    }
}
