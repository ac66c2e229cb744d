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

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};
use url::Url;

use crate::coordinator::GlobalCoordinator;
use crate::fabric::Domain;
use crate::frontier::Frontier;
use crate::politeness::Politeness;
use crate::{unix_ts_now, Error, Result, MAX_CONTENT_LENGTH};

/// One fetched response on its way to a parser.
#[derive(Debug, Clone)]
pub struct ParseTask {
    pub url: Url,
    pub final_url: Url,
    pub status: u16,
    pub domain: Domain,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub fetched_ts: u64,
    pub depth: u32,
}

#[derive(Debug, Clone)]
pub struct FetchOpts {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_retries: usize,
    /// Swap http for https on the first attempt, falling back to the
    /// original scheme.
    pub https_first: bool,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: Url,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub retry_after: Option<Duration>,
}

#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform one logical fetch: redirects followed up to the budget,
    /// transient failures retried. Non-2xx statuses are returned, not
    /// errors; an `Err` means the network never produced a response.
    async fn fetch(&self, url: Url, opts: &FetchOpts) -> Result<HttpResponse>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(user_agent_full: &str, contact_email: &str, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::default();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/html"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.9,*;q=0.8"),
        );

        let user_agent = format!("{user_agent_full} (+mailto:{contact_email})");

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .http2_keep_alive_interval(None)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }

    async fn fetch_once(&self, url: Url, opts: &FetchOpts) -> Result<HttpResponse> {
        let mut current = url;

        for _ in 0..=opts.max_redirects {
            let res = self
                .client
                .get(current.clone())
                .timeout(opts.timeout)
                .send()
                .await?;

            let status = res.status().as_u16();

            if matches!(status, 301 | 302 | 303 | 307 | 308) {
                let location = res
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .ok_or(Error::InvalidRedirect)?;

                current = Url::parse(location)
                    .or_else(|_| current.join(location))
                    .map_err(|_| Error::InvalidRedirect)?;
                continue;
            }

            let content_type = res
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());

            let retry_after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            let final_url = res.url().clone();
            let (body, truncated) = read_capped(res).await?;

            return Ok(HttpResponse {
                status,
                final_url,
                content_type,
                body,
                truncated,
                retry_after,
            });
        }

        Err(Error::InvalidRedirect.into())
    }
}

async fn read_capped(mut res: reqwest::Response) -> Result<(Vec<u8>, bool)> {
    let mut body = Vec::new();

    while let Some(chunk) = res.chunk().await? {
        if body.len() + chunk.len() > MAX_CONTENT_LENGTH {
            body.extend_from_slice(&chunk[..MAX_CONTENT_LENGTH - body.len()]);
            return Ok((body, true));
        }

        body.extend_from_slice(&chunk);
    }

    Ok((body, false))
}

#[async_trait::async_trait]
impl HttpClient for ReqwestClient {
    async fn fetch(&self, url: Url, opts: &FetchOpts) -> Result<HttpResponse> {
        let mut attempt = 0;

        loop {
            let res = if opts.https_first && url.scheme() == "http" {
                let mut https = url.clone();
                match https.set_scheme("https") {
                    Ok(()) => match self.fetch_once(https, opts).await {
                        Ok(res) => Ok(res),
                        Err(_) => self.fetch_once(url.clone(), opts).await,
                    },
                    Err(()) => self.fetch_once(url.clone(), opts).await,
                }
            } else {
                self.fetch_once(url.clone(), opts).await
            };

            let retryable = match &res {
                Ok(res) => res.status >= 500,
                // connection reset / timeout; redirect budget exhaustion is not
                Err(e) => e.downcast_ref::<Error>().is_none(),
            };

            if !retryable || attempt >= opts.max_retries {
                return res;
            }

            attempt += 1;
            let backoff = Duration::from_millis(500 * (1 << attempt));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            tokio::time::sleep(backoff + jitter).await;
        }
    }
}

/// Parse-queue depth gate. The bounded channel enforces the hard limit;
/// fetchers additionally park before their next pop while the queue sits
/// above the soft limit.
pub struct Backpressure<T> {
    sender: async_channel::Sender<T>,
    soft_limit: usize,
    drained: Notify,
}

impl<T> Backpressure<T> {
    pub fn new(sender: async_channel::Sender<T>, soft_limit: usize) -> Self {
        Self {
            sender,
            soft_limit,
            drained: Notify::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.sender.len()
    }

    pub async fn wait_below_soft(&self) {
        while self.sender.len() >= self.soft_limit {
            let notified = self.drained.notified();

            if self.sender.len() < self.soft_limit {
                return;
            }

            notified.await;
        }
    }

    /// Called by parsers after draining an item.
    pub fn signal(&self) {
        if self.sender.len() < self.soft_limit {
            self.drained.notify_waiters();
        }
    }
}

pub struct Fetcher {
    frontier: Arc<Frontier>,
    politeness: Arc<Politeness>,
    client: Arc<dyn HttpClient>,
    coordinator: Arc<GlobalCoordinator>,
    parse_queue: async_channel::Sender<ParseTask>,
    backpressure: Arc<Backpressure<ParseTask>>,
    stop: watch::Receiver<bool>,
    opts: FetchOpts,
    grace_shutdown: Duration,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontier: Arc<Frontier>,
        politeness: Arc<Politeness>,
        client: Arc<dyn HttpClient>,
        coordinator: Arc<GlobalCoordinator>,
        parse_queue: async_channel::Sender<ParseTask>,
        backpressure: Arc<Backpressure<ParseTask>>,
        stop: watch::Receiver<bool>,
        opts: FetchOpts,
        grace_shutdown: Duration,
    ) -> Self {
        Self {
            frontier,
            politeness,
            client,
            coordinator,
            parse_queue,
            backpressure,
            stop,
            opts,
            grace_shutdown,
        }
    }

    pub async fn run(mut self) {
        // storage failures are cooldowns until they look permanent
        const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 10;
        let mut storage_failures = 0u32;

        loop {
            if *self.stop.borrow() {
                break;
            }

            self.backpressure.wait_below_soft().await;

            let domain = tokio::select! {
                domain = self.frontier.claim_next_domain() => domain,
                _ = self.stop.changed() => continue,
            };

            match self.service_domain(&domain).await {
                Ok(()) => storage_failures = 0,
                Err(e) => {
                    tracing::warn!("fetch on {domain} failed: {e}");
                    // short penalty, then let another worker pick it up
                    self.frontier
                        .defer(&domain, unix_ts_now() + self.grace_shutdown.as_secs());

                    let storage_related = matches!(
                        e.downcast_ref::<Error>(),
                        Some(Error::ShardUnavailable(_) | Error::StorageUnavailable(_))
                    );

                    if storage_related {
                        storage_failures += 1;
                        if storage_failures >= MAX_CONSECUTIVE_STORAGE_FAILURES {
                            self.coordinator
                                .fatal_stop("pod store unreachable, aborting crawl");
                            break;
                        }
                    } else {
                        storage_failures = 0;
                    }
                }
            }
        }
    }

    async fn service_domain(&self, domain: &Domain) -> Result<()> {
        if let Some(eligible_ts) = self.politeness.must_wait_until(domain).await? {
            self.frontier.defer(domain, eligible_ts);
            return Ok(());
        }

        // skip disallowed urls without re-paying the politeness delay
        let (url, depth) = loop {
            match self.frontier.take_next(domain)? {
                None => {
                    self.frontier.finish(domain, Duration::ZERO)?;
                    return Ok(());
                }
                Some((url, depth)) => {
                    if self.politeness.is_url_allowed(&url).await? {
                        break (url, depth);
                    }
                    tracing::debug!("skipping disallowed url: {url}");
                }
            }
        };

        self.politeness.record_fetch_attempt(domain).await?;

        match self.fetch_with_grace(url.clone()).await {
            Ok(res) if res.status == 429 => {
                // rate limited: back off well past the normal cooldown
                let base = self.politeness.politeness_delay(domain).await;
                let cooldown = res.retry_after.map(|ra| ra.max(base)).unwrap_or(base * 2);

                tracing::debug!("{domain} rate limited, cooling for {cooldown:?}");
                self.frontier.finish(domain, cooldown)?;
                return Ok(());
            }
            Ok(res) => {
                self.coordinator.record_bytes(res.body.len() as u64);

                let task = ParseTask {
                    url,
                    final_url: res.final_url,
                    status: res.status,
                    domain: domain.clone(),
                    content_type: res.content_type,
                    body: res.body,
                    truncated: res.truncated,
                    fetched_ts: unix_ts_now(),
                    depth,
                };

                // blocks at the hard limit
                if self.parse_queue.send(task).await.is_err() {
                    tracing::debug!("parse queue closed, dropping fetched page");
                }
            }
            Err(e) => {
                tracing::debug!("fetch failed for {url}: {e}");
            }
        }

        let cooldown = self.politeness.politeness_delay(domain).await;
        self.frontier.finish(domain, cooldown)?;

        Ok(())
    }

    async fn fetch_with_grace(&self, url: Url) -> Result<HttpResponse> {
        let mut stop = self.stop.clone();
        let grace = self.grace_shutdown;

        let cancelled = async move {
            if !*stop.borrow() {
                let _ = stop.changed().await;
            }
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            res = self.client.fetch(url, &self.opts) => res,
            _ = cancelled => Err(anyhow::anyhow!("fetch cancelled by shutdown")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backpressure_blocks_above_soft_limit() {
        let (tx, rx) = async_channel::bounded::<u32>(8);
        let gate = Arc::new(Backpressure::new(tx.clone(), 2));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.wait_below_soft().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        rx.recv().await.unwrap();
        gate.signal();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after drain")
            .unwrap();
    }

    #[tokio::test]
    async fn backpressure_passes_below_soft_limit() {
        let (tx, _rx) = async_channel::bounded::<u32>(8);
        let gate = Backpressure::new(tx.clone(), 2);

        tx.send(1).await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), gate.wait_below_soft())
            .await
            .expect("should not block below the soft limit");
    }
}
