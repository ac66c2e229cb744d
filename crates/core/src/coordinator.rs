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

//! Process-wide coordination: monotonic counters, the stop flag and the
//! seen-set. All of it lives with the designated coordinator pod.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::metrics::Counter;
use crate::pod_store::PodStore;
use crate::visited::VisitedStore;
use crate::Result;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlLimits {
    pub max_pages: Option<u64>,
    pub max_duration: Option<Duration>,
}

pub struct GlobalCoordinator {
    seen: Arc<bloom::U64BloomFilter>,
    store: Arc<PodStore>,
    pages_crawled: Counter,
    bytes_fetched: Counter,
    pages_in_interval: Counter,
    stop: watch::Sender<bool>,
    fatal: AtomicBool,
    limits: CrawlLimits,
    started: Instant,
    seen_path: PathBuf,
    persist_interval: Duration,
}

impl GlobalCoordinator {
    pub fn new(
        seen: Arc<bloom::U64BloomFilter>,
        store: Arc<PodStore>,
        limits: CrawlLimits,
        seen_path: PathBuf,
        persist_interval: Duration,
    ) -> Result<Self> {
        let pages_crawled = Counter::default();
        let bytes_fetched = Counter::default();

        // counters survive restarts; the stop flag does not
        pages_crawled.store(store.counter("pages_crawled_total")?);
        bytes_fetched.store(store.counter("bytes_fetched_total")?);
        store.set_stop_flag(false)?;
        store.put_raw("seen:handle", seen_path.display().to_string().as_bytes())?;

        let (stop, _) = watch::channel(false);

        Ok(Self {
            seen,
            store,
            pages_crawled,
            bytes_fetched,
            pages_in_interval: Counter::default(),
            stop,
            fatal: AtomicBool::new(false),
            limits,
            started: Instant::now(),
            seen_path,
            persist_interval,
        })
    }

    pub fn seen(&self) -> &Arc<bloom::U64BloomFilter> {
        &self.seen
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self, reason: &str) {
        if !self.is_stopped() {
            tracing::info!("stopping crawl: {reason}");
        }
        self.stop.send_replace(true);
    }

    /// Unrecoverable failure: stop everything and make `run` exit non-zero.
    pub fn fatal_stop(&self, reason: &str) {
        tracing::error!("fatal: {reason}");
        self.fatal.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);
    }

    pub fn record_page(&self) {
        self.pages_crawled.inc();

        if let Some(max_pages) = self.limits.max_pages {
            if self.pages_crawled.get() >= max_pages {
                self.request_stop("max_pages reached");
            }
        }
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_fetched.add(bytes);
    }

    pub fn pages_crawled(&self) -> u64 {
        self.pages_crawled.get()
    }

    pub fn counters(&self) -> (Counter, Counter, Counter) {
        (
            self.pages_crawled.clone(),
            self.bytes_fetched.clone(),
            self.pages_in_interval.clone(),
        )
    }

    /// Coordinator tick loop: flush counters to the pod store, evaluate the
    /// stop criteria, persist the seen-set periodically and once at the end.
    pub async fn run(self: Arc<Self>) {
        let mut last_pages = self.pages_crawled.get();
        let mut last_persist = Instant::now();
        let mut stop_rx = self.stop_rx();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                _ = stop_rx.changed() => {}
            }

            let pages = self.pages_crawled.get();
            self.pages_in_interval.store(pages - last_pages);
            last_pages = pages;

            if let Err(e) = self.flush_counters() {
                tracing::warn!("failed to flush coordinator counters: {e}");
            }

            if let Some(max_pages) = self.limits.max_pages {
                if pages >= max_pages {
                    self.request_stop("max_pages reached");
                }
            }

            if let Some(max_duration) = self.limits.max_duration {
                if self.started.elapsed() >= max_duration {
                    self.request_stop("max_duration reached");
                }
            }

            if self.is_stopped() {
                break;
            }

            if last_persist.elapsed() >= self.persist_interval {
                self.persist_seen().await;
                last_persist = Instant::now();
            }
        }

        self.persist_seen().await;
        if let Err(e) = self.flush_counters() {
            tracing::warn!("final counter flush failed: {e}");
        }
    }

    fn flush_counters(&self) -> Result<()> {
        self.store
            .set_counter("pages_crawled_total", self.pages_crawled.get())?;
        self.store
            .set_counter("bytes_fetched_total", self.bytes_fetched.get())?;
        self.store
            .set_counter("pages_in_interval", self.pages_in_interval.get())?;
        self.store.set_stop_flag(self.is_stopped())?;

        Ok(())
    }

    async fn persist_seen(&self) {
        let seen = Arc::clone(&self.seen);
        let path = self.seen_path.clone();

        let res = tokio::task::spawn_blocking(move || seen.save(&path)).await;

        match res {
            Ok(Ok(())) => tracing::debug!("seen-set persisted"),
            Ok(Err(e)) => tracing::warn!("failed to persist seen-set: {e}"),
            Err(e) => tracing::warn!("seen-set persist task panicked: {e}"),
        }
    }
}

/// Open the seen-set: snapshot if present, otherwise a fresh filter,
/// rebuilt from the visited shards when resuming after a lost snapshot.
pub fn open_seen(
    path: &PathBuf,
    capacity: u64,
    error_rate: f64,
    resume: bool,
    visited: &VisitedStore,
) -> Result<Arc<bloom::U64BloomFilter>> {
    if path.exists() {
        match bloom::U64BloomFilter::open(path) {
            Ok(filter) => {
                tracing::info!("seen-set snapshot loaded from {}", path.display());
                return Ok(Arc::new(filter));
            }
            Err(e) => tracing::warn!("seen-set snapshot unreadable ({e}), rebuilding"),
        }
    }

    let filter = bloom::U64BloomFilter::new(capacity, error_rate);

    if resume {
        let mut restored = 0u64;
        visited.for_each_fp(|fp| {
            filter.insert(fp);
            restored += 1;
        })?;
        tracing::info!("seen-set rebuilt from {restored} visited records");
    }

    Ok(Arc::new(filter))
}
