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

//! Talking to the server and storing what it answered

use super::*;
use http::header::{ACCEPT_RANGES, RANGE};

const CROSS_ORIGIN_RESOURCE_POLICY: &str = "cross-origin-resource-policy";

fn is_non_error(status: u16) -> bool {
    (200..400).contains(&status)
}

impl Transaction {
    pub(super) async fn send_request(&mut self) -> Step {
        let network = match self.cache.network_layer.create_transaction(self.priority) {
            Ok(network) => network,
            Err(e) => return Step::new(State::FinishHeaders, Err(e)),
        };
        debug!("txn {} sends {} {}", self.id, self.method, self.request.url());
        let network = self.network.insert(network);
        let rv = network.start(&self.request).await.map(|_| 0);
        Step::new(State::SendRequestComplete, rv)
    }

    pub(super) async fn send_request_complete(&mut self, rv: Rv) -> Step {
        if self.couldnt_conditionalize {
            // whatever comes back replaces the entry
            self.mode = Mode::Write;
        }
        let e = match rv {
            Ok(_) => return Step::to(State::SuccessfulSendRequest),
            Err(e) => e,
        };

        if let Some(network) = self.network.as_ref() {
            self.response.network_accessed = network.response_info().is_some();
        }
        self.response.restricted_prefetch = self
            .effective_load_flags
            .contains(LoadFlags::RESTRICTED_PREFETCH);
        self.update_cache_entry_status(CacheEntryStatus::Other);

        if e.etype() == &InconsistentIpAddressSpace {
            self.doom_inconsistent_entry().await;
        } else if self.response.was_cached {
            self.done_with_entry(true).await;
        }
        Step::new(State::FinishHeaders, Err(e))
    }

    pub(super) async fn successful_send_request(&mut self) -> Step {
        let Some(new_response) = self.network_response_info() else {
            return Step::fail(
                State::FinishHeaders,
                InternalError,
                "network transaction has no response",
            );
        };
        let status = new_response.status_u16();

        if status == 401 || status == 407 {
            self.auth_response = new_response;
            self.auth_response.cache_entry_status = self.cache_entry_status;
            if !self.reading {
                return Step::to(State::FinishHeaders);
            }
            // the body was partly served from the entry already
            if self.is_ready_to_restart_for_auth() {
                let rv = match self.network.as_mut() {
                    Some(network) => network
                        .restart_with_auth(&AuthCredentials::default())
                        .await
                        .map(|_| 0),
                    None => Error::e_explain(InternalError, "no network transaction"),
                };
                return Step::new(State::SendRequestComplete, rv);
            }
            if self.entry.is_some() {
                self.doom_partial_entry(false).await;
            }
            self.mode = Mode::None;
            self.partial = None;
            self.network = None;
            return Step::fail(
                State::FinishHeaders,
                CacheAuthFailureAfterRead,
                "authentication required after the body was read",
            );
        }

        if self.use_single_keyed && !(status == 200 || status == 304) {
            self.mark_unusable = true;
        }

        self.new_response = Some(new_response);
        if !self.validate_partial_response().await && self.auth_response.headers.is_none() {
            // the range request has to be sent again
            self.cache
                .observer
                .record_event(EventKind::RangeRestart, self.key_str());
            self.update_cache_entry_status(CacheEntryStatus::Other);
            self.set_response(ResponseInfo::default());
            self.network = None;
            self.new_response = None;
            return Step::to(State::SendRequest);
        }

        if self.handling_206 && self.mode == Mode::ReadWrite && !self.truncated && !self.is_sparse
        {
            // a 206 to a request for the whole resource can't update a complete entry
            self.update_cache_entry_status(CacheEntryStatus::Other);
            self.done_with_entry(false).await;
        }

        if self.mode == Mode::Write
            && self.cache_entry_status != CacheEntryStatus::CantConditionalize
        {
            self.update_cache_entry_status(CacheEntryStatus::NotInCache);
        }

        if self.mode == Mode::Write && self.request.is_write_method() {
            if is_non_error(status) && self.entry.is_some() && !self.entry_doomed() {
                self.doom_key();
            }
            self.done_with_entry(true).await;
        }

        // a successful POST changes the resource
        if !self
            .effective_load_flags
            .contains(LoadFlags::DISABLE_CACHE)
            && self.method == Method::POST
            && is_non_error(status)
            && (!self.cache.conf().split_cache || self.request.isolation_key.is_some())
        {
            self.cache.doom_main_entry_for_url(&self.request).await;
        }

        if status == 416 && (self.method == Method::GET || self.method == Method::POST) {
            if let Some(new_response) = self.new_response.clone() {
                self.set_response(new_response);
            }
            return Step::to(State::FinishHeaders);
        }

        if matches!(self.mode, Mode::ReadWrite | Mode::Update) {
            if status == 304 || self.handling_206 {
                self.update_cache_entry_status(CacheEntryStatus::Validated);
                return Step::to(State::UpdateCachedResponse);
            }
            self.update_cache_entry_status(CacheEntryStatus::Updated);
            self.mode = Mode::Write;
        }
        Step::to(State::OverwriteCachedResponse)
    }

    /// Check the answer to a range request against the entry.
    ///
    /// Return false when the request has to be sent again.
    async fn validate_partial_response(&mut self) -> bool {
        let Some(headers) = self
            .new_response
            .as_ref()
            .and_then(|r| r.headers.clone())
        else {
            return true;
        };
        let status = headers.status.as_u16();
        let partial_response = status == 206;
        self.handling_206 = false;

        if self.entry.is_none() || self.method != Method::GET {
            return true;
        }

        if self.invalid_range {
            // the server decides what to do with a range past the end
            if partial_response || status == 200 {
                self.doom_partial_entry(true).await;
                self.mode = Mode::None;
            } else {
                if status == 304 {
                    if let Some(new_response) = self.new_response.clone() {
                        self.set_response(new_response);
                    }
                    if let (Some(partial), Some(headers)) =
                        (self.partial.as_ref(), self.response.headers.as_mut())
                    {
                        if let Err(e) = partial.fix_response_headers(headers, false) {
                            warn!("failed to fix range response headers: {e}");
                        }
                    }
                }
                self.ignore_range_request().await;
            }
            return true;
        }

        let Some(partial) = self.partial.as_mut() else {
            // the server sent a range we didn't ask for
            if partial_response {
                self.ignore_range_request().await;
            }
            return true;
        };

        let mut failure = status == 200 || status == 416;
        if partial.is_current_range_cached() {
            // only a validation was sent
            if partial_response {
                failure = true;
            }
            if status == 304 && partial.response_headers_ok(&headers) {
                return true;
            }
        } else {
            if partial_response {
                if partial.response_headers_ok(&headers) {
                    self.handling_206 = true;
                    return true;
                }
                failure = true;
            }
            if !self.reading && !self.is_sparse && !partial_response {
                // the response is usable as it is, the range is no longer handled here
                if status == 200 || (!self.truncated && status != 304 && status != 416) {
                    self.partial = None;
                    self.truncated = false;
                    return true;
                }
            }
            if self.truncated {
                failure = true;
            }
        }

        if failure {
            self.update_cache_entry_status(CacheEntryStatus::Other);
            self.mode = Mode::None;
            if self.is_sparse || self.truncated {
                let last_range = self.partial.as_ref().map_or(false, |p| p.is_last_range());
                if !self.reading && !last_range {
                    // start over with a request for the whole range
                    self.reset_partial_state(true).await;
                    return false;
                }
                warn!("failed to revalidate range entry {}", self.key_str());
            }
            self.doom_partial_entry(true).await;
            return true;
        }

        self.ignore_range_request().await;
        true
    }

    /// Serve the response without treating it as a range.
    async fn ignore_range_request(&mut self) {
        self.update_cache_entry_status(CacheEntryStatus::Other);
        let complete = self.mode != Mode::Write;
        self.done_with_entry(complete).await;
        self.partial = None;
    }

    /// Merge the headers of a 304 or a 206 into the stored response.
    pub(super) fn update_cached_response(&mut self) -> Step {
        let Some(new_response) = self.new_response.clone() else {
            return Step::fail(State::FinishHeaders, InternalError, "no response to merge");
        };
        if let (Some(headers), Some(new_headers)) =
            (self.response.headers.as_mut(), new_response.headers.as_ref())
        {
            headers.update(new_headers);
        }
        self.response.stale_revalidate_timeout = None;
        self.response.response_time = new_response.response_time;
        self.response.request_time = new_response.request_time;
        self.response.network_accessed = new_response.network_accessed;
        self.response.unused_since_prefetch = new_response.unused_since_prefetch;
        self.response.restricted_prefetch = new_response.restricted_prefetch;
        if self.mark_unusable {
            self.response.single_keyed_cache_entry_unusable = true;
        }
        if let Some(headers) = self.response.headers.as_ref() {
            self.response.vary_data = VaryData::init(&self.request.header, headers);
        }

        let disable = self
            .response
            .headers
            .as_ref()
            .map_or(false, |h| self.should_disable_caching(h));
        if disable {
            if self.entry.is_some() && !self.entry_doomed() {
                self.doom_key();
            }
            return Step::to(State::UpdateCachedResponseComplete);
        }
        if self.use_single_keyed {
            self.checksum_headers();
        }
        // a range transaction reading sub ranges only refreshes its own view
        if !self.reading {
            Step::to(State::CacheWriteUpdatedResponse)
        } else {
            Step::to(State::UpdateCachedResponseComplete)
        }
    }

    pub(super) async fn cache_write_updated_response(&mut self) -> Step {
        let response = self.response.clone();
        let rv = self.write_response_info_to_entry(&response, false).await;
        Step::new(State::CacheWriteUpdatedResponseComplete, rv)
    }

    pub(super) async fn update_cached_response_complete(&mut self) -> Step {
        if self.mode == Mode::Update {
            // the caller keeps its own copy, the 304 goes back to it
            self.update_security_headers_before_forwarding();
            self.done_with_entry(true).await;
        } else if self.entry.is_some() && !self.handling_206 {
            let last_range = self.partial.as_ref().map_or(false, |p| p.is_last_range());
            if (self.partial.is_none() && !self.is_writing_in_progress()) || last_range {
                self.mode = Mode::Read;
            }
            self.network = None;
        } else if self.entry.is_some()
            && self.handling_206
            && self.truncated
            && self
                .partial
                .as_ref()
                .map_or(false, |p| p.initial_validation())
        {
            // the one byte check validated the entry, resume where it stopped
            self.network = None;
            self.new_response = None;
            if let Some(partial) = self.partial.as_mut() {
                partial.set_range_to_start_download();
            }
            return Step::to(State::StartPartialCacheValidation);
        }
        Step::to(State::OverwriteCachedResponse)
    }

    fn update_security_headers_before_forwarding(&mut self) {
        let Some(corp) = self
            .response
            .headers
            .as_ref()
            .and_then(|h| h.headers.get(CROSS_ORIGIN_RESOURCE_POLICY))
            .cloned()
        else {
            return;
        };
        if let Some(headers) = self
            .new_response
            .as_mut()
            .and_then(|r| r.headers.as_mut())
        {
            if let Err(e) = headers.insert_header(CROSS_ORIGIN_RESOURCE_POLICY, corp) {
                warn!("failed to forward {CROSS_ORIGIN_RESOURCE_POLICY}: {e}");
            }
        }
    }

    pub(super) async fn overwrite_cached_response(&mut self) -> Step {
        if self.mode.can_read() {
            return Step::to(State::PartialHeadersReceived);
        }
        let Some(mut new_response) = self.new_response.clone() else {
            return Step::fail(State::FinishHeaders, InternalError, "no response to store");
        };
        if self.handling_206 {
            if let (Some(partial), Some(headers)) =
                (self.partial.as_ref(), new_response.headers.as_mut())
            {
                if let Err(e) = partial.fix_content_length(headers) {
                    warn!("failed to fix the length of a range response: {e}");
                }
            }
        }
        self.set_response(new_response);
        if self.use_single_keyed {
            self.checksum_headers();
        }

        if self.method == Method::HEAD {
            // nothing to store for a HEAD
            self.done_with_entry(false).await;
            self.new_response = None;
            return Step::to(State::FinishHeaders);
        }

        if self.handling_206 && !self.can_resume() {
            // the range response can't be completed later, don't store it
            self.done_with_entry(false).await;
            if let (Some(partial), Some(headers)) =
                (self.partial.as_ref(), self.response.headers.as_mut())
            {
                if let Err(e) = partial.fix_response_headers(headers, true) {
                    warn!("failed to fix range response headers: {e}");
                }
            }
            return Step::to(State::PartialHeadersReceived);
        }

        if let Some(run_id) = self.initial_request.fps_cache_filter.browser_run_id {
            self.response.browser_run_id = Some(run_id);
        }
        Step::to(State::CacheWriteResponse)
    }

    pub(super) async fn cache_write_response(&mut self) -> Step {
        let is_match = self.response.status_u16() == 304;
        if let Some(entry) = self.entry {
            let can_write = self.cache.arena.lock().can_transaction_write_response_headers(
                entry,
                self.id,
                self.mode,
                is_match,
            );
            if !can_write {
                // others depend on the stored response, store this one in a new entry
                debug!("txn {} moves to a new entry for {}", self.id, self.key_str());
                self.done_headers_create_new_entry = true;
                self.mode = Mode::Write;
                self.cache.arena.lock().doom_entry_validation_no_match(entry);
                self.entry = None;
                return Step::to(State::InitEntry);
            }
        }

        if self.mark_unusable {
            self.response.single_keyed_cache_entry_unusable = true;
        }
        let response = self.response.clone();
        let rv = self
            .write_response_info_to_entry(&response, self.truncated)
            .await;
        Step::new(State::CacheWriteResponseComplete, rv)
    }

    /// Drop the stored body, the new one is written from the start.
    pub(super) async fn truncate_cached_data(&mut self) -> Step {
        let rv = match self.entry_storage() {
            Some(storage) => storage.write_data(BODY_INDEX, 0, &[], true).await,
            None => Ok(0),
        };
        Step::new(State::TruncateCachedDataComplete, rv)
    }

    pub(super) fn partial_headers_received(&mut self) -> Step {
        self.new_response = None;
        if self.mode != Mode::None && !self.reading {
            if let (Some(partial), Some(headers)) =
                (self.partial.as_ref(), self.response.headers.as_mut())
            {
                if let Err(e) = partial.fix_response_headers(headers, true) {
                    warn!("failed to fix range response headers: {e}");
                }
            }
        }
        Step::to(State::FinishHeaders)
    }

    /// Whether a download of the response could be resumed with a range request.
    fn can_resume(&self) -> bool {
        if self.method != Method::GET {
            return false;
        }
        let Some(headers) = self.response.headers.as_ref() else {
            return false;
        };
        if headers.content_length().map_or(true, |len| len == 0) {
            return false;
        }
        if headers.has_header_value(ACCEPT_RANGES, "none") {
            return false;
        }
        headers.has_strong_validators()
    }

    /// Drop the entry of a range request.
    ///
    /// `delete_object` drops the range tracking as well.
    pub(super) async fn doom_partial_entry(&mut self, delete_object: bool) {
        if self.entry.is_some() && !self.entry_doomed() {
            self.doom_key();
        }
        self.release_entry(false).await;
        self.is_sparse = false;
        self.truncated = false;
        if delete_object {
            self.partial = None;
        }
    }

    pub(super) async fn reset_partial_state(&mut self, delete_object: bool) {
        self.restore_partial_headers();
        self.doom_partial_entry(delete_object).await;
        if delete_object {
            return;
        }
        // a fresh tracker for the range of the caller
        let mut headers = self.request.headers().clone();
        headers.remove(RANGE);
        let mut partial = PartialData::new();
        if partial.init(self.initial_request.headers()) {
            partial.set_headers(headers.clone());
            self.partial = Some(partial);
        } else {
            self.partial = None;
        }
        self.request.header.set_headers(headers);
    }

    /// The range entry can't be used: replace it with a new one.
    pub(super) async fn restart_partial_request(&mut self) -> Step {
        debug!("txn {} restarts range request for {}", self.id, self.key_str());
        self.cache
            .observer
            .record_event(EventKind::RangeRestart, self.key_str());
        let delete_object = !self.range_requested;
        self.reset_partial_state(delete_object).await;
        self.mode = Mode::Write;
        Step::to(State::CreateEntry)
    }
}
