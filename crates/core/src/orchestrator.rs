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

//! Process lifecycle: builds the fabric and stores, spawns per-pod fetcher
//! and parser pools on pinned runtimes, supervises shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CrawlConfig;
use crate::content_store::ContentStore;
use crate::coordinator::{open_seen, CrawlLimits, GlobalCoordinator};
use crate::extract::HtmlTextExtractor;
use crate::fabric::ShardFabric;
use crate::fetch::{Backpressure, FetchOpts, Fetcher, HttpClient, ParseTask, ReqwestClient};
use crate::frontier::Frontier;
use crate::metrics::{self, PrometheusRegistry};
use crate::parse::Parser;
use crate::politeness::Politeness;
use crate::robots::RobotsTxtManager;
use crate::router::FrontierRouter;
use crate::visited::VisitedStore;
use crate::Result;

use url::Url;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub contact_email: String,
    pub resume: bool,
    pub seeded_urls_only: bool,
    pub limits: CrawlLimits,
}

struct PodWorkers {
    fetch_rt: tokio::runtime::Runtime,
    parse_rt: tokio::runtime::Runtime,
}

pub struct Crawler {
    coordinator: Arc<GlobalCoordinator>,
    router: Arc<FrontierRouter>,
    control: tokio::runtime::Runtime,
    pods: Vec<PodWorkers>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    coordinator_handle: tokio::task::JoinHandle<()>,
    grace_shutdown: Duration,
}

impl Crawler {
    pub fn new(config: CrawlConfig, options: RunOptions) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.log_dir)?;

        let fabric = Arc::new(ShardFabric::open(&config)?);
        let content = Arc::new(ContentStore::open(&config.data_dirs)?);
        let visited = Arc::new(VisitedStore::open(&config.data_dirs)?);

        let seen_path = config.log_dir.join("seen.bloom");
        let seen = open_seen(
            &seen_path,
            config.seen_capacity,
            config.seen_error_rate,
            options.resume,
            &visited,
        )?;

        let coordinator = Arc::new(GlobalCoordinator::new(
            Arc::clone(&seen),
            fabric.store(config.global_coordination_pod)?,
            options.limits,
            seen_path,
            Duration::from_secs(config.seen_persist_interval_seconds),
        )?);

        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(
            &config.user_agent.full,
            &options.contact_email,
            Duration::from_secs(config.http_timeout_seconds),
        )?);

        let min_delay = Duration::from_secs(config.politeness_delay_seconds);
        let grace_shutdown = Duration::from_secs(config.grace_shutdown_seconds);

        let mut frontiers = Vec::with_capacity(fabric.num_pods());
        let mut politenesses = Vec::with_capacity(fabric.num_pods());

        for pod in 0..fabric.num_pods() {
            let store = fabric.store(pod)?;

            let frontier = Arc::new(Frontier::new(
                pod,
                Arc::clone(&store),
                Arc::clone(&seen),
                config.frontier_dir.clone(),
                config.log_dir.join(format!("pod-{pod}")),
                min_delay,
            )?);

            if options.resume {
                let restored = frontier.resume()?;
                tracing::info!("pod {pod}: restored {restored} ready domains");
            }

            let robots = RobotsTxtManager::new(
                Arc::clone(&store),
                Arc::clone(&http),
                Duration::from_secs(config.robots_cache_ttl_seconds),
                config.user_agent.token.clone(),
                Duration::from_secs(config.http_timeout_seconds),
            );

            let politeness = Arc::new(Politeness::new(
                store,
                robots,
                options.seeded_urls_only,
                min_delay,
            ));

            if let Some(path) = &config.manual_exclusions_file {
                let loaded = politeness.load_manual_exclusions(path)?;
                tracing::info!("pod {pod}: loaded {loaded} manual exclusions");
            }

            frontiers.push(frontier);
            politenesses.push(politeness);
        }

        let router = Arc::new(FrontierRouter::new(frontiers, Arc::clone(&fabric)));
        let extractor: Arc<dyn crate::extract::TextExtractor> =
            Arc::new(HtmlTextExtractor::default());

        let plan = core_plan(&config);
        let mut pods = Vec::with_capacity(fabric.num_pods());
        let mut worker_handles = Vec::new();

        let fetch_opts = FetchOpts {
            timeout: Duration::from_secs(config.http_timeout_seconds),
            max_redirects: 5,
            max_retries: config.http_max_retries,
            https_first: true,
        };

        for pod in 0..fabric.num_pods() {
            let (fetch_cores, parse_cores) = plan[pod].clone();

            let fetch_rt = pod_runtime(pod, "fetch", config.fetcher_workers, fetch_cores)?;
            let parse_rt = pod_runtime(pod, "parse", config.parser_workers, parse_cores)?;

            let (parse_tx, parse_rx) =
                async_channel::bounded::<ParseTask>(config.parse_queue_hard_limit);
            let backpressure = Arc::new(Backpressure::new(
                parse_tx.clone(),
                config.parse_queue_soft_limit,
            ));

            for _ in 0..config.fetchers_per_pod {
                let fetcher = Fetcher::new(
                    Arc::clone(router.frontier(pod)),
                    Arc::clone(&politenesses[pod]),
                    Arc::clone(&http),
                    Arc::clone(&coordinator),
                    parse_tx.clone(),
                    Arc::clone(&backpressure),
                    coordinator.stop_rx(),
                    fetch_opts.clone(),
                    grace_shutdown,
                );

                worker_handles.push(fetch_rt.spawn(fetcher.run()));
            }

            for _ in 0..config.parsers_per_pod {
                let parser = Parser::new(
                    parse_rx.clone(),
                    Arc::clone(&backpressure),
                    Arc::clone(&extractor),
                    Arc::clone(&content),
                    Arc::clone(&visited),
                    Arc::clone(&router),
                    Arc::clone(&coordinator),
                    coordinator.stop_rx(),
                );

                worker_handles.push(parse_rt.spawn(parser.run()));
            }

            pods.push(PodWorkers { fetch_rt, parse_rt });
        }

        let control = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("control")
            .enable_all()
            .build()?;

        let coordinator_handle = control.spawn(Arc::clone(&coordinator).run());

        if config.enable_prometheus {
            let registry = build_registry(&coordinator, &router, &control)?;
            let port = config.prometheus_port;
            control.spawn(async move {
                if let Err(e) = metrics::serve(registry, port).await {
                    tracing::warn!("metrics endpoint failed: {e}");
                }
            });
        }

        Ok(Self {
            coordinator,
            router,
            control,
            pods,
            worker_handles,
            coordinator_handle,
            grace_shutdown,
        })
    }

    /// Admit the seed list. Seeds bypass the membership check but still
    /// populate the seen-set, and their domains are marked seeded.
    pub fn ingest_seeds(&self, seeds: Vec<Url>) -> crate::frontier::AddOutcome {
        let router = Arc::clone(&self.router);
        let urls = seeds.into_iter().map(|url| (url, 0)).collect();

        self.control.block_on(router.route(urls, true))
    }

    pub fn frontier_size(&self) -> u64 {
        self.router.frontiers().iter().map(|f| f.count()).sum()
    }

    /// Block until the crawl stops, then drain and tear everything down.
    pub fn run(self) -> Result<()> {
        let coordinator = Arc::clone(&self.coordinator);

        self.control.block_on(async {
            let mut stop_rx = coordinator.stop_rx();

            if !coordinator.is_stopped() {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        coordinator.request_stop("operator interrupt");
                    }
                    _ = stop_rx.changed() => {}
                }
            }
        });

        // parsers drain the queue within the grace period; fetchers notice
        // the flag at their next suspension point
        let drain_budget = self.grace_shutdown + Duration::from_secs(5);
        self.control.block_on(async {
            let drained = tokio::time::timeout(
                drain_budget,
                futures::future::join_all(self.worker_handles),
            )
            .await;

            if drained.is_err() {
                tracing::warn!("workers did not drain within {drain_budget:?}");
            }

            if let Err(e) = tokio::time::timeout(Duration::from_secs(30), self.coordinator_handle)
                .await
            {
                tracing::warn!("coordinator did not flush in time: {e}");
            }
        });

        for pod in self.pods {
            pod.fetch_rt.shutdown_timeout(Duration::from_secs(1));
            pod.parse_rt.shutdown_timeout(Duration::from_secs(1));
        }

        tracing::info!(
            "crawl finished: {} pages crawled",
            self.coordinator.pages_crawled()
        );

        if self.coordinator.is_fatal() {
            anyhow::bail!("crawl aborted after unrecoverable failure");
        }

        Ok(())
    }
}

/// Static affinity plan: pod `p` owns cores `[p*C, (p+1)*C)`; the first
/// `fetcher_workers` of those go to the fetch runtime, the rest to parse.
fn core_plan(
    config: &CrawlConfig,
) -> Vec<(Vec<core_affinity::CoreId>, Vec<core_affinity::CoreId>)> {
    let num_pods = config.pods.len();

    if !config.enable_cpu_affinity {
        return vec![(Vec::new(), Vec::new()); num_pods];
    }

    let all = core_affinity::get_core_ids().unwrap_or_default();
    let per_pod = config.cores_per_pod;

    (0..num_pods)
        .map(|pod| {
            let start = pod * per_pod;
            let end = ((pod + 1) * per_pod).min(all.len());

            if start >= all.len() {
                tracing::warn!("pod {pod}: no cores left for affinity plan");
                return (Vec::new(), Vec::new());
            }

            let slice = &all[start..end];
            let split = config.fetcher_workers.min(slice.len());

            (slice[..split].to_vec(), slice[split..].to_vec())
        })
        .collect()
}

fn pod_runtime(
    pod: usize,
    kind: &str,
    workers: usize,
    cores: Vec<core_affinity::CoreId>,
) -> Result<tokio::runtime::Runtime> {
    let next = Arc::new(AtomicUsize::new(0));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name(format!("pod-{pod}-{kind}"))
        .on_thread_start(move || {
            if cores.is_empty() {
                return;
            }

            let core = cores[next.fetch_add(1, Ordering::Relaxed) % cores.len()];
            if !core_affinity::set_for_current(core) {
                tracing::warn!("failed to pin thread to core {}", core.id);
            }
        })
        .enable_all()
        .build()?;

    Ok(rt)
}

fn build_registry(
    coordinator: &Arc<GlobalCoordinator>,
    router: &Arc<FrontierRouter>,
    control: &tokio::runtime::Runtime,
) -> Result<Arc<PrometheusRegistry>> {
    let mut registry = PrometheusRegistry::default();
    let (pages, bytes, interval) = coordinator.counters();

    registry
        .new_group(
            "trawler_pages_crawled_total".to_string(),
            Some("Pages crawled since first start.".to_string()),
        )?
        .register(pages, vec![]);

    registry
        .new_group(
            "trawler_bytes_fetched_total".to_string(),
            Some("Response bytes fetched.".to_string()),
        )?
        .register(bytes, vec![]);

    registry
        .new_group(
            "trawler_pages_in_interval".to_string(),
            Some("Pages crawled in the last coordinator tick.".to_string()),
        )?
        .register(interval, vec![]);

    let frontier_group = registry.new_group(
        "trawler_frontier_size".to_string(),
        Some("Approximate unread frontier entries.".to_string()),
    )?;

    for (pod, frontier) in router.frontiers().iter().enumerate() {
        let gauge = metrics::Counter::default();
        frontier_group.register(
            gauge.clone(),
            vec![metrics::Label {
                key: "pod".to_string(),
                val: pod.to_string(),
            }],
        );

        let frontier = Arc::clone(frontier);
        control.spawn(async move {
            loop {
                gauge.store(frontier.count());
                tokio::time::sleep(Duration::from_secs(15)).await;
            }
        });
    }

    Ok(Arc::new(registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;

    #[test]
    fn builds_and_shuts_down_cleanly() {
        let root = crate::gen_temp_path();
        let mut config = CrawlConfig::single_pod(&root);
        config.fetchers_per_pod = 2;
        config.parsers_per_pod = 2;
        config.fetcher_workers = 1;
        config.parser_workers = 1;

        let crawler = Crawler::new(
            config,
            RunOptions {
                contact_email: "ops@example.com".to_string(),
                resume: false,
                seeded_urls_only: false,
                limits: CrawlLimits::default(),
            },
        )
        .unwrap();

        // stop before seeding so no worker attempts a network fetch
        crawler.coordinator.request_stop("test over");

        let outcome = crawler.ingest_seeds(vec![
            Url::parse("http://seed-a.com/").unwrap(),
            Url::parse("http://seed-b.com/").unwrap(),
        ]);
        assert_eq!(outcome.admitted, 2);
        assert!(crawler.frontier_size() >= 1);

        crawler.run().unwrap();
    }

    #[test]
    fn core_plan_respects_toggle() {
        let root = crate::gen_temp_path();
        let mut config = CrawlConfig::single_pod(&root);
        config.enable_cpu_affinity = false;

        let plan = core_plan(&config);
        assert_eq!(plan.len(), 1);
        assert!(plan[0].0.is_empty());
        assert!(plan[0].1.is_empty());
    }
}
