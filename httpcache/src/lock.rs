// Copyright 2025 Cloudflare, Inc.
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

//! Cache lock
//!
//! Transactions that can't use an entry right away park a [WaitSlot] in the entry arena and wait
//! on the matching [LockWait]. The arena signals the slot when the transaction's turn comes. A
//! slot whose waiter is gone (timed out or dropped) can't be signaled, which is how the arena
//! learns that it has to hand the turn to the next waiter.

use super::*;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Status which the waiters could possibly see.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum LockStatus {
    /// Waiting for the holders of the entry
    Waiting,
    /// The transaction can go on with the entry
    Granted,
    /// The entry was doomed or failed under the transaction, it has to start over
    Race,
    /// The wait took too long
    Timeout,
    /// The arena dropped the slot without an answer
    Cancelled,
}

/// The arena side of a wait
#[derive(Debug)]
pub(crate) struct WaitSlot<T = LockStatus> {
    tx: oneshot::Sender<T>,
}

impl<T> WaitSlot<T> {
    /// Hand `value` to the waiter.
    ///
    /// The value is given back when the waiter is gone.
    pub fn signal(self, value: T) -> Result<(), T> {
        self.tx.send(value)
    }

    /// Whether the waiter stopped waiting
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The transaction side of a wait
#[derive(Debug)]
pub(crate) struct LockWait<T = LockStatus> {
    rx: oneshot::Receiver<T>,
    lock_start: Instant,
    status: LockStatus,
}

/// Create a connected [WaitSlot] and [LockWait] pair
pub(crate) fn wait_pair<T>() -> (WaitSlot<T>, LockWait<T>) {
    let (tx, rx) = oneshot::channel();
    (
        WaitSlot { tx },
        LockWait {
            rx,
            lock_start: Instant::now(),
            status: LockStatus::Waiting,
        },
    )
}

impl<T> LockWait<T> {
    /// Wait for the arena to signal, for at most `wait_timeout` when set.
    ///
    /// A value signaled right when the timeout fires is still returned, so a grant is never lost.
    pub async fn wait(&mut self, wait_timeout: Option<Duration>) -> Result<T, LockStatus> {
        let res = match wait_timeout {
            Some(duration) => match timeout(duration, &mut self.rx).await {
                Ok(res) => res,
                Err(_) => {
                    // no more values after this, a later signal fails and the arena notices
                    self.rx.close();
                    match self.rx.try_recv() {
                        Ok(value) => Ok(value),
                        Err(_) => {
                            self.status = LockStatus::Timeout;
                            return Err(LockStatus::Timeout);
                        }
                    }
                }
            },
            None => (&mut self.rx).await,
        };
        match res {
            Ok(value) => {
                self.status = LockStatus::Granted;
                Ok(value)
            }
            Err(_) => {
                self.status = LockStatus::Cancelled;
                Err(LockStatus::Cancelled)
            }
        }
    }

    /// How long the wait has lasted so far
    pub fn elapsed(&self) -> Duration {
        self.lock_start.elapsed()
    }

    /// [LockStatus::Waiting] until [Self::wait()] returns, then how it ended
    pub fn lock_status(&self) -> LockStatus {
        self.status
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_signal() {
        let (slot, mut wait) = wait_pair();
        assert_eq!(wait.lock_status(), LockStatus::Waiting);
        let handle = tokio::spawn(async move {
            let status = wait.wait(Some(Duration::from_secs(1000))).await.unwrap();
            assert_eq!(status, LockStatus::Race);
            assert_eq!(wait.lock_status(), LockStatus::Granted);
        });
        assert!(slot.signal(LockStatus::Race).is_ok());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let (slot, mut wait) = wait_pair::<LockStatus>();
        let res = wait.wait(Some(Duration::from_millis(10))).await;
        assert_eq!(res, Err(LockStatus::Timeout));
        assert!(wait.elapsed() >= Duration::from_millis(10));
        // the arena finds out the waiter is gone
        assert!(slot.is_cancelled());
        assert_eq!(slot.signal(LockStatus::Granted), Err(LockStatus::Granted));
    }

    #[tokio::test]
    async fn test_signal_before_wait() {
        let (slot, mut wait) = wait_pair();
        slot.signal(7u32).unwrap();
        // already resolved, the timeout doesn't matter
        assert_eq!(wait.wait(Some(Duration::ZERO)).await, Ok(7));
    }

    #[tokio::test]
    async fn test_dropped_slot() {
        let (slot, mut wait) = wait_pair::<LockStatus>();
        drop(slot);
        assert_eq!(wait.wait(None).await, Err(LockStatus::Cancelled));

        let (slot, wait) = wait_pair::<LockStatus>();
        drop(wait);
        assert!(slot.is_cancelled());
        let name: &'static str = LockStatus::Cancelled.into();
        assert_eq!(name, "Cancelled");
    }
}
