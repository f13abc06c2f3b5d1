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

//! The states of a [super::Transaction]

use super::*;

/// The result a state hands to the next one: a byte count or an error.
pub(crate) type Rv = Result<usize>;

/// Every state a transaction goes through.
///
/// `*Complete` states take the outcome of the I/O their predecessor started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum State {
    None,
    GetBackend,
    GetBackendComplete,
    InitEntry,
    OpenOrCreateEntry,
    OpenOrCreateEntryComplete,
    DoomEntry,
    DoomEntryComplete,
    CreateEntry,
    CreateEntryComplete,
    AddToEntry,
    AddToEntryComplete,
    DoneHeadersAddToEntryComplete,
    CacheReadResponse,
    CacheReadResponseComplete,
    WriteUpdatedPrefetchResponse,
    WriteUpdatedPrefetchResponseComplete,
    CacheDispatchValidation,
    CacheQueryData,
    CacheQueryDataComplete,
    StartPartialCacheValidation,
    CompletePartialCacheValidation,
    CacheUpdateStaleWhileRevalidateTimeout,
    CacheUpdateStaleWhileRevalidateTimeoutComplete,
    ConnectedCallback,
    ConnectedCallbackComplete,
    SetupEntryForRead,
    SendRequest,
    SendRequestComplete,
    SuccessfulSendRequest,
    UpdateCachedResponse,
    CacheWriteUpdatedResponse,
    CacheWriteUpdatedResponseComplete,
    UpdateCachedResponseComplete,
    OverwriteCachedResponse,
    CacheWriteResponse,
    CacheWriteResponseComplete,
    TruncateCachedData,
    TruncateCachedDataComplete,
    PartialHeadersReceived,
    HeadersPhaseCannotProceed,
    FinishHeaders,
    FinishHeadersComplete,
    NetworkReadCacheWrite,
    NetworkReadCacheWriteComplete,
    CacheReadData,
    CacheReadDataComplete,
    NetworkRead,
    NetworkReadComplete,
    MarkSingleKeyedCacheEntryUnusable,
    MarkSingleKeyedCacheEntryUnusableComplete,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// What a state handler decided: where to go and with which result.
#[derive(Debug)]
pub(crate) struct Step {
    pub next: State,
    pub rv: Rv,
}

impl Step {
    pub fn new(next: State, rv: Rv) -> Self {
        Step { next, rv }
    }

    /// Go to `next` with an OK result
    pub fn to(next: State) -> Self {
        Step { next, rv: Ok(0) }
    }

    /// Stop the loop with `rv`
    pub fn done(rv: Rv) -> Self {
        Step {
            next: State::None,
            rv,
        }
    }

    /// Go to `next` with an error of `etype`
    pub fn fail(next: State, etype: ErrorType, context: &'static str) -> Self {
        Step {
            next,
            rv: Err(Error::explain(etype, context)),
        }
    }
}

/// The error type of `rv`, if it is an error
pub(crate) fn rv_etype(rv: &Rv) -> Option<&ErrorType> {
    rv.as_ref().err().map(|e| e.etype())
}

pub(crate) fn rv_is(rv: &Rv, etype: &ErrorType) -> bool {
    rv_etype(rv) == Some(etype)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_step() {
        let step = Step::to(State::InitEntry);
        assert_eq!(step.next, State::InitEntry);
        assert_eq!(step.rv.unwrap(), 0);

        let step = Step::fail(State::FinishHeaders, CacheMiss, "no entry");
        assert!(rv_is(&step.rv, &CacheMiss));
        assert!(!rv_is(&step.rv, &CacheRace));
        assert_eq!(State::FinishHeaders.as_str(), "FinishHeaders");
        assert!(rv_etype(&Step::done(Ok(3)).rv).is_none());
    }
}
