// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-slot overwrite channel between the watch task and the agent loop.
//!
//! The producer never blocks and never queues: a new value replaces whatever
//! the consumer has not taken yet.

use crate::common::credential::Credential;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Most recent not-yet-applied credential.
pub type PendingRotation = PendingSlot<Arc<Credential>>;

struct Inner<T> {
    value: Option<T>,
    closed: bool,
}

pub struct PendingSlot<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for PendingSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `value`, replacing any unconsumed one.
    ///
    /// Returns `true` when an unconsumed value was overwritten. Offers after
    /// `close` are discarded.
    pub fn offer(&self, value: T) -> bool {
        let replaced = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.value.replace(value).is_some()
        };
        self.notify.notify_one();
        replaced
    }

    /// Takes the pending value without waiting.
    pub fn take(&self) -> Option<T> {
        self.lock().value.take()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Waits for the next value. Returns `None` once closed and drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(v) = inner.value.take() {
                    return Some(v);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting values and wakes the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_overwrite_reports_replacement() {
        let slot = PendingSlot::new();
        assert!(!slot.offer(1));
        assert!(slot.offer(2));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }

    #[tokio::test]
    async fn test_next_wakes_on_offer() {
        let slot = Arc::new(PendingSlot::new());
        let consumer = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.offer("fresh");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some("fresh"));
    }

    #[tokio::test]
    async fn test_close_releases_waiter() {
        let slot: Arc<PendingSlot<u8>> = Arc::new(PendingSlot::new());
        let consumer = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.close();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
        assert!(!slot.offer(9));
        assert!(slot.is_closed());
    }

    #[tokio::test]
    async fn test_value_pending_at_close_is_drained() {
        let slot = PendingSlot::new();
        slot.offer(5u8);
        slot.close();
        assert_eq!(slot.next().await, Some(5));
        assert_eq!(slot.next().await, None);
    }

    proptest! {
        #[test]
        fn prop_only_last_offer_survives(values in proptest::collection::vec(any::<u32>(), 1..64)) {
            let slot = PendingSlot::new();
            let mut overwrites = 0;
            for v in &values {
                if slot.offer(*v) {
                    overwrites += 1;
                }
            }
            prop_assert_eq!(overwrites, values.len() - 1);
            prop_assert_eq!(slot.take(), values.last().copied());
            prop_assert!(!slot.has_pending());
        }

        #[test]
        fn prop_interleaved_takes_see_latest(ops in proptest::collection::vec(proptest::option::of(any::<u16>()), 1..64)) {
            // Some(v) offers v, None takes.
            let slot = PendingSlot::new();
            let mut model: Option<u16> = None;
            for op in ops {
                match op {
                    Some(v) => {
                        prop_assert_eq!(slot.offer(v), model.is_some());
                        model = Some(v);
                    }
                    None => prop_assert_eq!(slot.take(), model.take()),
                }
            }
        }
    }
}
