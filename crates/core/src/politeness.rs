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

//! Per-pod politeness decisions: manual exclusions, seeded-only mode,
//! robots verdicts and minimum fetch spacing per domain.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use url::Url;

use crate::fabric::Domain;
use crate::pod_store::PodStore;
use crate::robots::RobotsTxtManager;
use crate::{unix_ts_now, Result};

const EXCLUSION_CACHE_ENTRIES: usize = 100_000;

/// Crawl-delay directives above this multiple of the minimum delay are
/// clamped; some sites ask for hours.
const MAX_CRAWL_DELAY_FACTOR: u32 = 5;

pub struct Politeness {
    store: Arc<PodStore>,
    robots: RobotsTxtManager,
    exclusions: Mutex<LruCache<Domain, bool>>,
    seeded: Mutex<LruCache<Domain, bool>>,
    seeded_urls_only: bool,
    min_delay: Duration,
}

impl Politeness {
    pub fn new(
        store: Arc<PodStore>,
        robots: RobotsTxtManager,
        seeded_urls_only: bool,
        min_delay: Duration,
    ) -> Self {
        Self {
            store,
            robots,
            exclusions: Mutex::new(LruCache::new(
                NonZeroUsize::new(EXCLUSION_CACHE_ENTRIES).unwrap(),
            )),
            seeded: Mutex::new(LruCache::new(
                NonZeroUsize::new(EXCLUSION_CACHE_ENTRIES).unwrap(),
            )),
            seeded_urls_only,
            min_delay,
        }
    }

    /// Policy verdict for one url: manual exclusion, seeded-only mode,
    /// then robots. Rejections are silent drops upstream.
    pub async fn is_url_allowed(&self, url: &Url) -> Result<bool> {
        let Some(domain) = Domain::from_url(url) else {
            return Ok(false);
        };

        if self.is_excluded(&domain)? {
            return Ok(false);
        }

        if self.seeded_urls_only && !self.is_seeded(&domain)? {
            return Ok(false);
        }

        Ok(self.robots.is_allowed(url).await)
    }

    fn is_excluded(&self, domain: &Domain) -> Result<bool> {
        {
            let mut cache = self.exclusions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&hit) = cache.get(domain) {
                return Ok(hit);
            }
        }

        let excluded = self
            .store
            .domain_record(domain)?
            .map(|r| r.is_manually_excluded)
            .unwrap_or(false);

        self.exclusions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(domain.clone(), excluded);

        Ok(excluded)
    }

    fn is_seeded(&self, domain: &Domain) -> Result<bool> {
        {
            let mut cache = self.seeded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&hit) = cache.get(domain) {
                return Ok(hit);
            }
        }

        let seeded = self
            .store
            .domain_record(domain)?
            .map(|r| r.is_seeded)
            .unwrap_or(false);

        // only positive verdicts are sticky: a domain can become seeded later
        if seeded {
            self.seeded
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(domain.clone(), true);
        }

        Ok(seeded)
    }

    /// `None` when the domain may be fetched now, otherwise the timestamp
    /// at which it becomes eligible.
    pub async fn must_wait_until(&self, domain: &Domain) -> Result<Option<u64>> {
        let last = self
            .store
            .domain_record(domain)?
            .map(|r| r.last_scheduled_fetch_ts)
            .unwrap_or(0);

        let eligible = last + self.politeness_delay(domain).await.as_secs();

        if unix_ts_now() >= eligible {
            Ok(None)
        } else {
            Ok(Some(eligible))
        }
    }

    pub async fn record_fetch_attempt(&self, domain: &Domain) -> Result<()> {
        let now = unix_ts_now();
        self.store
            .update_domain(domain, |r| r.last_scheduled_fetch_ts = now)?;

        Ok(())
    }

    /// `max(robots crawl-delay, MIN_DELAY)`, with the robots value clamped.
    pub async fn politeness_delay(&self, domain: &Domain) -> Duration {
        let robots_delay = self
            .robots
            .crawl_delay(domain)
            .await
            .unwrap_or(Duration::ZERO)
            .min(self.min_delay * MAX_CRAWL_DELAY_FACTOR);

        robots_delay.max(self.min_delay)
    }

    /// Bulk upsert of exclusion flags, one domain per line. Called once at
    /// pod startup.
    pub fn load_manual_exclusions<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let mut loaded = 0;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let domain = Domain::from(line.to_string());
            self.store
                .update_domain(&domain, |r| r.is_manually_excluded = true)?;
            self.exclusions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(domain, true);
            loaded += 1;
        }

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robots::tests::FixedHttpClient;

    fn politeness(robots_body: Option<&str>, seeded_only: bool) -> (Politeness, Arc<PodStore>) {
        let store = Arc::new(PodStore::open(0, crate::gen_temp_path().join("pod.redb")).unwrap());
        let robots = RobotsTxtManager::new(
            Arc::clone(&store),
            Arc::new(FixedHttpClient::new(robots_body)),
            Duration::from_secs(3600),
            "TrawlerBot".to_string(),
            Duration::from_secs(5),
        );

        (
            Politeness::new(
                Arc::clone(&store),
                robots,
                seeded_only,
                Duration::from_secs(70),
            ),
            store,
        )
    }

    fn domain(name: &str) -> Domain {
        Domain::from(name.to_string())
    }

    #[tokio::test]
    async fn manual_exclusion_wins() {
        let (politeness, store) = politeness(None, false);

        store
            .update_domain(&domain("bad.com"), |r| r.is_manually_excluded = true)
            .unwrap();

        assert!(
            !politeness
                .is_url_allowed(&Url::parse("http://bad.com/x").unwrap())
                .await
                .unwrap()
        );
        assert!(
            politeness
                .is_url_allowed(&Url::parse("http://good.com/x").unwrap())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn seeded_only_mode_blocks_unseeded() {
        let (politeness, store) = politeness(None, true);

        store
            .update_domain(&domain("seeded.com"), |r| r.is_seeded = true)
            .unwrap();

        assert!(
            politeness
                .is_url_allowed(&Url::parse("http://seeded.com/x").unwrap())
                .await
                .unwrap()
        );
        assert!(
            !politeness
                .is_url_allowed(&Url::parse("http://random.com/x").unwrap())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn fetch_spacing_respects_min_delay() {
        let (politeness, _store) = politeness(None, false);
        let d = domain("a.com");

        assert_eq!(politeness.must_wait_until(&d).await.unwrap(), None);

        politeness.record_fetch_attempt(&d).await.unwrap();

        let eligible = politeness.must_wait_until(&d).await.unwrap();
        let expected_min = unix_ts_now() + 68;
        assert!(eligible.is_some());
        assert!(eligible.unwrap() >= expected_min);
    }

    #[tokio::test]
    async fn crawl_delay_is_clamped() {
        let (politeness, _store) =
            politeness(Some("User-agent: *\nCrawl-delay: 100000"), false);

        let delay = politeness.politeness_delay(&domain("a.com")).await;
        assert_eq!(delay, Duration::from_secs(70 * 5));
    }

    #[tokio::test]
    async fn default_delay_without_robots() {
        let (politeness, _store) = politeness(None, false);

        let delay = politeness.politeness_delay(&domain("a.com")).await;
        assert_eq!(delay, Duration::from_secs(70));
    }

    #[tokio::test]
    async fn load_exclusions_from_file() {
        let (politeness, store) = politeness(None, false);

        let path = crate::gen_temp_path();
        std::fs::create_dir_all(&path).unwrap();
        let file = path.join("exclusions.txt");
        std::fs::write(&file, "# comment\nbad.com\nworse.com\n\n").unwrap();

        assert_eq!(politeness.load_manual_exclusions(&file).unwrap(), 2);
        assert!(
            store
                .domain_record(&domain("bad.com"))
                .unwrap()
                .unwrap()
                .is_manually_excluded
        );
    }
}
