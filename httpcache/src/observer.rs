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

//! Hooks to observe cache decisions, e.g. to export them as metrics

use super::*;
use parking_lot::Mutex;

/// The kinds of events a transaction reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum EventKind {
    /// The final [crate::response::CacheEntryStatus] of a transaction
    CacheEntryStatus,
    /// Why a stored response was validated
    ValidationCause,
    /// A cache read failed and the transaction restarted without the entry
    ReadErrorRestart,
    /// A cache read failed and the transaction can't recover
    ReadErrorFatal,
    PrefetchReuse,
    RestrictedPrefetchReuse,
    ChecksumMismatch,
    SingleKeyedUnusable,
    FirstPartySetsBypass,
    /// A transaction started waiting for an entry held by others
    LockWait,
    LockTimeout,
    /// The server answer to a range request made the transaction start over
    RangeRestart,
    /// The caller sent its own validators
    ExternallyConditionalized,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Receives the events of every transaction of a cache.
pub trait Observer: Send + Sync {
    fn record_event(&self, _kind: EventKind, _detail: &str) {}
}

/// The default [Observer] that drops everything
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// An [Observer] that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(EventKind, String)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All the events so far, oldest first
    pub fn events(&self) -> Vec<(EventKind, String)> {
        self.events.lock().clone()
    }

    /// The details of the events of `kind`
    pub fn details(&self, kind: EventKind) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, detail)| detail.clone())
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl Observer for RecordingObserver {
    fn record_event(&self, kind: EventKind, detail: &str) {
        trace!("event {}: {detail}", kind.as_str());
        self.events.lock().push((kind, detail.to_string()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recording() {
        let observer = RecordingObserver::new();
        observer.record_event(EventKind::LockWait, "a");
        observer.record_event(EventKind::LockTimeout, "a");
        observer.record_event(EventKind::LockWait, "b");
        assert_eq!(observer.count(EventKind::LockWait), 2);
        assert_eq!(observer.details(EventKind::LockWait), vec!["a", "b"]);
        assert_eq!(observer.events().len(), 3);
        assert_eq!(EventKind::RangeRestart.as_str(), "RangeRestart");

        // nothing to check, it must just not panic
        NoopObserver.record_event(EventKind::ChecksumMismatch, "");
    }
}
