// Trawler is an open source large-scale web crawler.
// Copyright (C) 2024 Trawler ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Priority set of domains ordered by earliest-fetchable time. A domain is
//! in the set iff it has unread urls and is not claimed by a fetcher.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tokio::sync::Notify;

use crate::fabric::Domain;
use crate::unix_ts_now;

#[derive(PartialEq, Eq)]
struct QueueEntry {
    ts: u64,
    tie: u64,
    domain: Domain,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ts, self.tie, &self.domain).cmp(&(other.ts, other.tie, &other.domain))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    // authoritative next_fetch_eligible_ts; heap entries not matching it are stale
    scheduled: HashMap<Domain, u64>,
    claimed: HashSet<Domain>,
    // upserts that arrived while the domain was claimed
    pending: HashMap<Domain, u64>,
}

pub struct ReadyQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert the domain or move its eligibility to `max(existing, ts)`.
    pub fn upsert(&self, domain: &Domain, ts: u64) {
        let mut inner = self.lock();

        if inner.claimed.contains(domain) {
            let pending = inner.pending.entry(domain.clone()).or_insert(ts);
            *pending = (*pending).max(ts);
            return;
        }

        let ts = inner
            .scheduled
            .get(domain)
            .copied()
            .unwrap_or(ts)
            .max(ts);

        inner.scheduled.insert(domain.clone(), ts);
        inner.heap.push(Reverse(QueueEntry {
            ts,
            tie: domain.hash(),
            domain: domain.clone(),
        }));

        drop(inner);
        self.notify.notify_one();
    }

    /// Pop the domain with the smallest due timestamp, blocking until one is
    /// eligible. The domain is claimed until `release` is called for it.
    pub async fn pop(&self) -> Domain {
        loop {
            let wait = {
                let mut inner = self.lock();
                let now = unix_ts_now();

                loop {
                    let Some(Reverse(top)) = inner.heap.peek() else {
                        break None;
                    };

                    let current = inner.scheduled.get(&top.domain);
                    if current != Some(&top.ts) {
                        // stale entry from an earlier upsert
                        inner.heap.pop();
                        continue;
                    }

                    if top.ts <= now {
                        let Reverse(entry) = inner.heap.pop().unwrap();
                        inner.scheduled.remove(&entry.domain);
                        inner.claimed.insert(entry.domain.clone());
                        return entry.domain;
                    }

                    break Some(Duration::from_secs(top.ts - now));
                }
            };

            // capped so a missed notification cannot stall a worker for long
            let wait = wait
                .unwrap_or(Duration::from_secs(1))
                .min(Duration::from_secs(1));

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Unclaim the domain. `next_ts` re-enqueues it; `None` drops it from the
    /// set (no unread urls left). Upserts that raced with the claim win over
    /// `None` and take part in the max.
    pub fn release(&self, domain: &Domain, next_ts: Option<u64>) {
        let mut inner = self.lock();

        inner.claimed.remove(domain);
        let pending = inner.pending.remove(domain);

        let ts = match (next_ts, pending) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        if let Some(ts) = ts {
            inner.scheduled.insert(domain.clone(), ts);
            inner.heap.push(Reverse(QueueEntry {
                ts,
                tie: domain.hash(),
                domain: domain.clone(),
            }));

            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.scheduled.len() + inner.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_claimed(&self, domain: &Domain) -> bool {
        self.lock().claimed.contains(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> Domain {
        Domain::from(name.to_string())
    }

    #[tokio::test]
    async fn pops_in_timestamp_order() {
        let queue = ReadyQueue::new();
        let now = unix_ts_now();

        queue.upsert(&domain("late.com"), now.saturating_sub(1));
        queue.upsert(&domain("early.com"), now.saturating_sub(100));

        assert_eq!(queue.pop().await, domain("early.com"));
        assert_eq!(queue.pop().await, domain("late.com"));
    }

    #[tokio::test]
    async fn claimed_domain_is_not_popped_twice() {
        let queue = ReadyQueue::new();
        let d = domain("a.com");

        queue.upsert(&d, 0);
        assert_eq!(queue.pop().await, d);
        assert!(queue.is_claimed(&d));

        // a second upsert while claimed must not make it poppable
        queue.upsert(&d, 0);
        let res = tokio::time::timeout(Duration::from_millis(100), queue.pop()).await;
        assert!(res.is_err());

        // release applies the pending upsert
        queue.release(&d, None);
        assert_eq!(queue.pop().await, d);
    }

    #[tokio::test]
    async fn upsert_takes_max_of_existing() {
        let queue = ReadyQueue::new();
        let d = domain("a.com");
        let future_ts = unix_ts_now() + 3_600;

        queue.upsert(&d, future_ts);
        queue.upsert(&d, 0);

        // still cooling; the earlier ts must not win
        let res = tokio::time::timeout(Duration::from_millis(100), queue.pop()).await;
        assert!(res.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn release_none_removes_domain() {
        let queue = ReadyQueue::new();
        let d = domain("a.com");

        queue.upsert(&d, 0);
        queue.pop().await;
        queue.release(&d, None);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn blocks_until_cooldown_expires() {
        let queue = ReadyQueue::new();
        let d = domain("a.com");

        queue.upsert(&d, unix_ts_now() + 2);

        let start = std::time::Instant::now();
        let popped = queue.pop().await;
        assert_eq!(popped, d);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ties_break_by_domain_hash() {
        let queue = ReadyQueue::new();
        let a = domain("a.com");
        let b = domain("b.com");

        queue.upsert(&a, 5);
        queue.upsert(&b, 5);

        let first = queue.pop().await;
        let expected = if a.hash() < b.hash() { &a } else { &b };
        assert_eq!(&first, expected);
    }
}
