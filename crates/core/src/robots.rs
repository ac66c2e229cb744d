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

//! Robots verdicts with a three-level lookup: in-memory lru, pod store
//! (ttl respected), network. An absent robots.txt or any fetch/parse
//! failure caches as allow-all for the standard ttl.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use texting_robots::Robot;
use url::Url;

use crate::fabric::Domain;
use crate::fetch::{FetchOpts, HttpClient};
use crate::pod_store::PodStore;
use crate::{unix_ts_now, Result};

const CACHE_ENTRIES: usize = 100_000;

pub struct CachedRobots {
    robot: Option<Robot>,
    expires_ts: u64,
}

impl CachedRobots {
    pub fn is_allowed(&self, url: &Url) -> bool {
        match &self.robot {
            Some(robot) => robot.allowed(url.as_str()),
            None => true,
        }
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.robot
            .as_ref()
            .and_then(|robot| robot.delay)
            .map(|secs| Duration::from_secs_f32(secs.max(0.0)))
    }

    fn is_expired(&self) -> bool {
        self.expires_ts <= unix_ts_now()
    }
}

pub struct RobotsTxtManager {
    cache: Mutex<LruCache<Domain, Arc<CachedRobots>>>,
    store: Arc<PodStore>,
    http: Arc<dyn HttpClient>,
    fetch_guards: DashMap<Domain, Arc<tokio::sync::Mutex<()>>>,
    ttl: Duration,
    user_agent_token: String,
    fetch_timeout: Duration,
}

impl RobotsTxtManager {
    pub fn new(
        store: Arc<PodStore>,
        http: Arc<dyn HttpClient>,
        ttl: Duration,
        user_agent_token: String,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_ENTRIES).unwrap())),
            store,
            http,
            fetch_guards: DashMap::new(),
            ttl,
            user_agent_token,
            fetch_timeout,
        }
    }

    pub async fn is_allowed(&self, url: &Url) -> bool {
        let Some(domain) = Domain::from_url(url) else {
            return false;
        };

        match self.entry(&domain).await {
            Ok(robots) => robots.is_allowed(url),
            Err(e) => {
                tracing::debug!("robots lookup for {domain} failed: {e}");
                true
            }
        }
    }

    pub async fn crawl_delay(&self, domain: &Domain) -> Option<Duration> {
        self.entry(domain).await.ok().and_then(|r| r.crawl_delay())
    }

    async fn entry(&self, domain: &Domain) -> Result<Arc<CachedRobots>> {
        if let Some(hit) = self.cache_get(domain) {
            return Ok(hit);
        }

        // one network fetch per domain at a time
        let guard = self
            .fetch_guards
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let locked = guard.lock().await;

        let res = self.entry_slow(domain).await;

        drop(locked);
        self.fetch_guards.remove(domain);

        res
    }

    async fn entry_slow(&self, domain: &Domain) -> Result<Arc<CachedRobots>> {
        if let Some(hit) = self.cache_get(domain) {
            return Ok(hit);
        }

        if let Some(hit) = self.store_get(domain)? {
            let hit = Arc::new(hit);
            self.cache_put(domain, Arc::clone(&hit));
            return Ok(hit);
        }

        let content = self.fetch_robots_txt(domain).await;
        let now = unix_ts_now();
        let expires = now + self.ttl.as_secs();

        // single write-through upsert
        self.store.update_domain(domain, |r| {
            r.robots_cached_content = content.clone();
            r.robots_fetched_ts = now;
            r.robots_expires_ts = expires;
        })?;

        let robots = Arc::new(CachedRobots {
            robot: content.as_deref().and_then(|c| self.parse(c)),
            expires_ts: expires,
        });
        self.cache_put(domain, Arc::clone(&robots));

        Ok(robots)
    }

    fn cache_get(&self, domain: &Domain) -> Option<Arc<CachedRobots>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        match cache.get(domain).map(Arc::clone) {
            Some(hit) if !hit.is_expired() => Some(hit),
            Some(_) => {
                cache.pop(domain);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, domain: &Domain, robots: Arc<CachedRobots>) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(domain.clone(), robots);
    }

    fn store_get(&self, domain: &Domain) -> Result<Option<CachedRobots>> {
        let Some(record) = self.store.domain_record(domain)? else {
            return Ok(None);
        };

        if record.robots_fetched_ts == 0 || record.robots_expires_ts <= unix_ts_now() {
            return Ok(None);
        }

        Ok(Some(CachedRobots {
            robot: record
                .robots_cached_content
                .as_deref()
                .and_then(|c| self.parse(c)),
            expires_ts: record.robots_expires_ts,
        }))
    }

    fn parse(&self, content: &str) -> Option<Robot> {
        Robot::new(&self.user_agent_token, content.as_bytes()).ok()
    }

    /// `None` means allow-all: absent file, network failure, whatever.
    async fn fetch_robots_txt(&self, domain: &Domain) -> Option<String> {
        let opts = FetchOpts {
            timeout: self.fetch_timeout,
            max_redirects: 5,
            max_retries: 0,
            https_first: false,
        };

        for scheme in ["http", "https"] {
            let Ok(url) = Url::parse(&format!("{scheme}://{domain}/robots.txt")) else {
                continue;
            };

            match self.http.fetch(url, &opts).await {
                Ok(res) if res.status == 200 => {
                    return Some(String::from_utf8_lossy(&res.body).into_owned());
                }
                Ok(_) | Err(_) => {}
            }
        }

        None
    }
}
