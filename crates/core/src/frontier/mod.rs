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

//! Per-pod frontier: admits urls behind the seen-set, persists them to
//! per-domain append-only files and hands out one domain at a time so a
//! domain never has two fetches in flight.

pub mod file;
mod ready_queue;

pub use ready_queue::ReadyQueue;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use url::Url;

use crate::fabric::Domain;
use crate::fingerprint::UrlFp;
use crate::pod_store::PodStore;
use crate::url_ext::UrlExt;
use crate::{unix_ts_now, Result, MAX_URLS_FOR_DOMAIN_PER_INSERT, MAX_URL_LEN_BYTES};

const IGNORED_EXTENSIONS: [&str; 27] = [
    ".pdf", ".jpg", ".zip", ".png", ".css", ".js", ".json", ".jsonp", ".woff2", ".woff", ".ttf",
    ".svg", ".gif", ".jpeg", ".ico", ".mp4", ".mp3", ".avi", ".mov", ".mpeg", ".webm", ".wav",
    ".flac", ".aac", ".ogg", ".m4a", ".m4v",
];

const ADD_RETRIES: usize = 3;
const AVG_LINE_LEN: u64 = 64;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub admitted: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct NextUrl {
    pub url: Url,
    pub domain: Domain,
    pub depth: u32,
}

pub struct Frontier {
    pod: usize,
    store: Arc<PodStore>,
    seen: Arc<bloom::U64BloomFilter>,
    ready: ReadyQueue,
    root: PathBuf,
    min_delay: Duration,
    append_locks: DashMap<Domain, Arc<Mutex<()>>>,
    files: DashMap<Domain, PathBuf>,
    unreconciled: PathBuf,
}

impl Frontier {
    pub fn new(
        pod: usize,
        store: Arc<PodStore>,
        seen: Arc<bloom::U64BloomFilter>,
        frontier_dir: PathBuf,
        log_dir: PathBuf,
        min_delay: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&frontier_dir)?;
        std::fs::create_dir_all(&log_dir)?;

        Ok(Self {
            pod,
            store,
            seen,
            ready: ReadyQueue::new(),
            root: frontier_dir,
            min_delay,
            append_locks: DashMap::new(),
            files: DashMap::new(),
            unreconciled: log_dir.join("unreconciled.log"),
        })
    }

    pub fn pod(&self) -> usize {
        self.pod
    }

    fn admissible(url: &Url) -> bool {
        url.is_fetchable()
            && url.as_str().len() <= MAX_URL_LEN_BYTES
            && IGNORED_EXTENSIONS
                .iter()
                .all(|ext| !url.path().ends_with(ext))
    }

    /// Admit a batch of urls for domains owned by this pod.
    ///
    /// Urls are canonicalized, filtered, deduplicated through the seen-set
    /// and appended to their domain's file. The seen-set insert comes first:
    /// if the append then fails irrecoverably the url is written to the
    /// unreconciled log and lost rather than risking a duplicate fetch.
    pub async fn add_urls(
        &self,
        urls: Vec<(Url, u32)>,
        bypass_seen_check: bool,
    ) -> Result<AddOutcome> {
        let mut outcome = AddOutcome::default();
        let mut per_domain: hashbrown::HashMap<Domain, usize> = hashbrown::HashMap::new();
        let mut touched: hashbrown::HashSet<Domain> = hashbrown::HashSet::new();
        let mut failure = None;

        for (mut url, depth) in urls {
            url.canonicalize_in_place();

            if !Self::admissible(&url) {
                outcome.dropped += 1;
                continue;
            }

            let Some(domain) = Domain::from_url(&url) else {
                outcome.dropped += 1;
                continue;
            };

            let count = per_domain.entry(domain.clone()).or_insert(0);
            if *count >= MAX_URLS_FOR_DOMAIN_PER_INSERT {
                outcome.dropped += 1;
                continue;
            }

            let was_new = self.seen.insert(UrlFp::of(&url).as_u64());
            if !was_new && !bypass_seen_check {
                outcome.dropped += 1;
                continue;
            }

            if let Err(e) = self.append_with_retry(&domain, &url, depth).await {
                self.log_unreconciled(&url);
                failure = Some(e);
                break;
            }

            *count += 1;
            outcome.admitted += 1;
            touched.insert(domain);
        }

        // even on failure, everything already appended must become visible
        for domain in touched {
            let record = self
                .store
                .update_domain(&domain, |r| r.is_seeded |= bypass_seen_check)?;

            self.ready.upsert(
                &domain,
                record.last_scheduled_fetch_ts + self.min_delay.as_secs(),
            );
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    async fn append_with_retry(&self, domain: &Domain, url: &Url, depth: u32) -> Result<()> {
        let path = self.file_of(domain);

        let mut attempt = 0;
        loop {
            let res = {
                let lock = self
                    .append_locks
                    .entry(domain.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

                file::append(&path, url, depth)
            };

            match res {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < ADD_RETRIES => {
                    let backoff = Duration::from_millis(100 * (1 << attempt));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                    tracing::debug!("frontier append failed, retrying: {e}");
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn log_unreconciled(&self, url: &Url) {
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.unreconciled)
            .and_then(|mut f| writeln!(f, "{url}"));

        if let Err(e) = res {
            tracing::error!("failed to record unreconciled url {url}: {e}");
        }
    }

    fn file_of(&self, domain: &Domain) -> PathBuf {
        self.files
            .entry(domain.clone())
            .or_insert_with(|| file::file_path(&self.root, domain))
            .clone()
    }

    /// Block until a domain is eligible and claim it. The caller must hand
    /// the claim back through `take`/`defer`/`finish`.
    pub async fn claim_next_domain(&self) -> Domain {
        self.ready.pop().await
    }

    /// Read the next unread url of a claimed domain and advance the offset.
    /// Returns `None` when nothing (or only a partial line) is left.
    pub fn take_next(&self, domain: &Domain) -> Result<Option<(Url, u32)>> {
        let path = self.file_of(domain);

        loop {
            let offset = self
                .store
                .domain_record(domain)?
                .map(|r| r.frontier_offset)
                .unwrap_or(0);

            match file::read_at(&path, offset)? {
                file::ReadOutcome::End => return Ok(None),
                file::ReadOutcome::Skip(next) => {
                    self.store
                        .update_domain(domain, |r| r.frontier_offset = next)?;
                }
                file::ReadOutcome::Entry(url, depth, next) => {
                    let now = unix_ts_now();
                    self.store.update_domain(domain, |r| {
                        r.frontier_offset = next;
                        r.last_scheduled_fetch_ts = now;
                    })?;

                    return Ok(Some((url, depth)));
                }
            }
        }
    }

    /// Unclaim a domain without consuming anything, e.g. when politeness
    /// says its cooldown has not expired yet.
    pub fn defer(&self, domain: &Domain, eligible_ts: u64) {
        self.ready.release(domain, Some(eligible_ts));
    }

    /// Unclaim a domain after a fetch was dispatched. Re-enqueues it after
    /// `cooldown` when unread urls remain, otherwise drops it to idle.
    pub fn finish(&self, domain: &Domain, cooldown: Duration) -> Result<()> {
        let offset = self
            .store
            .domain_record(domain)?
            .map(|r| r.frontier_offset)
            .unwrap_or(0);

        let next = if file::len(&self.file_of(domain)) > offset {
            Some(unix_ts_now() + cooldown.as_secs())
        } else {
            None
        };

        self.ready.release(domain, next);

        Ok(())
    }

    /// Composed pop: claim a domain, take its next url, reschedule. Skips
    /// drained domains.
    pub async fn next_url(&self) -> Result<NextUrl> {
        loop {
            let domain = self.claim_next_domain().await;

            match self.take_next(&domain) {
                Ok(Some((url, depth))) => {
                    self.finish(&domain, self.min_delay)?;
                    return Ok(NextUrl { url, domain, depth });
                }
                Ok(None) => {
                    self.finish(&domain, self.min_delay)?;
                }
                Err(e) => {
                    self.defer(&domain, unix_ts_now() + self.min_delay.as_secs());
                    return Err(e);
                }
            }
        }
    }

    /// Approximate number of unread frontier entries across all domains.
    pub fn count(&self) -> u64 {
        self.files
            .iter()
            .map(|entry| {
                let unread = file::len(entry.value()).saturating_sub(
                    self.store
                        .domain_record(entry.key())
                        .ok()
                        .flatten()
                        .map(|r| r.frontier_offset)
                        .unwrap_or(0),
                );

                unread / AVG_LINE_LEN + u64::from(unread % AVG_LINE_LEN != 0)
            })
            .sum()
    }

    /// Rebuild the ready queue from the frontier directory and persisted
    /// offsets. Domains without a record are treated as never scheduled.
    pub fn resume(&self) -> Result<usize> {
        let mut restored = 0;

        for bucket in std::fs::read_dir(&self.root)? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }

            for entry in std::fs::read_dir(bucket.path())? {
                let path = entry?.path();

                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(domain) = name.strip_suffix(".frontier") else {
                    continue;
                };

                let domain = Domain::from(domain.to_string());
                let record = self.store.domain_record(&domain)?.unwrap_or_default();

                self.files.insert(domain.clone(), path.clone());

                if file::len(&path) > record.frontier_offset {
                    self.ready.upsert(
                        &domain,
                        record.last_scheduled_fetch_ts + self.min_delay.as_secs(),
                    );
                    restored += 1;
                }
            }
        }

        Ok(restored)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}
