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

//! Reading the body: from the entry, from the network while writing the entry, or from the
//! network alone

use super::*;
use crate::writers::WriterRead;
use httpcache_error::BError;

impl Transaction {
    /// What a transaction without an entry returns at the end of the body
    fn shared_writing_rv(&self) -> Rv {
        match &self.shared_writing_error {
            Some(etype) => Error::e_explain(etype.clone(), "writing the shared entry failed"),
            None => Ok(0),
        }
    }

    pub(super) async fn network_read_cache_write(&mut self, buf: &mut [u8]) -> Step {
        let Some(entry) = self.entry else {
            return Step::done(self.shared_writing_rv());
        };
        let target = self.partial.as_ref().map(|p| p.cache_write_target());
        let read = writers::read(&self.cache, entry, self.id, self.read_offset, target, buf).await;
        match read {
            Ok(WriterRead::Data(n)) => Step::new(State::NetworkReadCacheWriteComplete, Ok(n)),
            Ok(WriterRead::Behind) => Step::to(State::CacheReadData),
            Ok(WriterRead::Left) => {
                self.drain_notices();
                if self.entry.is_some() {
                    // the body is complete, read the rest from the entry
                    Step::to(State::CacheReadData)
                } else {
                    Step::done(self.shared_writing_rv())
                }
            }
            Err(e) => Step::new(State::NetworkReadCacheWriteComplete, Err(e)),
        }
    }

    pub(super) async fn network_read_cache_write_complete(&mut self, rv: Rv) -> Step {
        let n = match rv {
            Ok(n) => n,
            Err(e) => return Step::done(Err(e)),
        };
        if self.partial.is_some() {
            return self.partial_network_read_completed(n).await;
        }
        self.read_offset += n as u64;
        Step::done(Ok(n))
    }

    /// The network part of the current sub range was read.
    async fn partial_network_read_completed(&mut self, n: usize) -> Step {
        if let Some(partial) = self.partial.as_mut() {
            partial.on_network_read_completed(n);
        }
        if n != 0 {
            return Step::done(Ok(n));
        }
        // move on to the next sub range
        if self.network.is_some() {
            self.network = None;
        } else if self.in_writers() {
            if let Some(entry) = self.entry {
                writers::reset_network_transaction(&self.cache, entry).await;
            }
        }
        Step::to(State::StartPartialCacheValidation)
    }

    pub(super) async fn network_read(&mut self, buf: &mut [u8]) -> Step {
        let rv = match self.network.as_mut() {
            Some(network) => network.read(buf).await,
            None => Error::e_explain(InternalError, "no network transaction"),
        };
        Step::new(State::NetworkReadComplete, rv)
    }

    pub(super) async fn network_read_complete(&mut self, rv: Rv) -> Step {
        match rv {
            Ok(n) if self.partial.is_some() => self.partial_network_read_completed(n).await,
            rv => Step::done(rv),
        }
    }

    pub(super) async fn cache_read_data(&mut self, buf: &mut [u8]) -> Step {
        if self.method == Method::HEAD {
            return Step::done(Ok(0));
        }
        let Some(storage) = self.entry_storage() else {
            return Step::done(self.shared_writing_rv());
        };
        let rv = match self.partial.as_ref() {
            Some(partial) => partial.cache_read(storage.as_ref(), buf).await,
            None => storage.read_data(BODY_INDEX, self.read_offset, buf).await,
        };
        Step::new(State::CacheReadDataComplete, rv)
    }

    pub(super) async fn cache_read_data_complete(&mut self, rv: Rv, buf: &[u8]) -> Step {
        if self.partial.is_some() {
            // sub ranges mix cached and network bytes
            self.update_cache_entry_status(CacheEntryStatus::Other);
            return self.partial_cache_read_completed(rv).await;
        }
        match rv {
            Ok(0) => {
                if self.in_writers() {
                    // caught up with the stored body
                    return Step::to(State::NetworkReadCacheWrite);
                }
                if !self.finish_and_check_checksum() {
                    return Step::to(State::MarkSingleKeyedCacheEntryUnusable);
                }
                self.done_with_entry(true).await;
                Step::done(Ok(0))
            }
            Ok(n) => {
                self.read_offset += n as u64;
                if let Some(checksum) = self.checksum.as_mut() {
                    checksum.update(&buf[..n]);
                }
                Step::done(Ok(n))
            }
            Err(e) => self.on_cache_read_error(e, false).await,
        }
    }

    async fn partial_cache_read_completed(&mut self, rv: Rv) -> Step {
        let n = match rv {
            Ok(n) => n,
            Err(e) => return self.on_cache_read_error(e, false).await,
        };
        if let Some(partial) = self.partial.as_mut() {
            partial.on_cache_read_completed(n);
        }
        if n == 0 && self.mode == Mode::ReadWrite {
            // the cached run is over
            return Step::to(State::StartPartialCacheValidation);
        }
        Step::done(Ok(n))
    }

    /// Handle a failed read of the entry.
    ///
    /// The entry is doomed. Before any body byte reached the caller the transaction starts over
    /// without it, once.
    pub(super) async fn on_cache_read_error(&mut self, e: BError, restart: bool) -> Step {
        warn!("txn {} failed to read {}: {e}", self.id, self.key_str());
        let restart = restart && self.read_error_restarts == 0;
        let kind = if restart {
            EventKind::ReadErrorRestart
        } else {
            EventKind::ReadErrorFatal
        };
        self.cache.observer.record_event(kind, self.key_str());
        self.doom_key();

        if !restart {
            return Step::fail(State::None, CacheReadFailure, "failed to read the cache entry");
        }
        self.read_error_restarts += 1;
        self.release_entry(true).await;
        self.is_sparse = false;
        self.restore_partial_headers();
        self.partial = None;
        Step::to(State::GetBackend)
    }

    pub(super) async fn mark_single_keyed_cache_entry_unusable(&mut self) -> Step {
        self.response.single_keyed_cache_entry_unusable = true;
        let response = self.response.clone();
        let rv = self.write_response_info_to_entry(&response, false).await;
        Step::new(State::MarkSingleKeyedCacheEntryUnusableComplete, rv)
    }

    pub(super) async fn mark_single_keyed_cache_entry_unusable_complete(&mut self, rv: Rv) -> Step {
        if let Err(e) = rv {
            warn!("failed to mark {} unusable: {e}", self.key_str());
        }
        self.done_with_entry(true).await;
        Step::done(Ok(0))
    }
}
