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

//! Routes url admissions to the owning pod's frontier. All cross-pod
//! writes go through here; the owning frontier performs every mutation.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use url::Url;

use crate::fabric::{Domain, ShardFabric};
use crate::frontier::{AddOutcome, Frontier};
use crate::url_ext::UrlExt;
use crate::Result;

const ROUTE_RETRIES: usize = 3;

pub struct FrontierRouter {
    frontiers: Vec<Arc<Frontier>>,
    fabric: Arc<ShardFabric>,
}

impl FrontierRouter {
    pub fn new(frontiers: Vec<Arc<Frontier>>, fabric: Arc<ShardFabric>) -> Self {
        assert_eq!(frontiers.len(), fabric.num_pods());

        Self { frontiers, fabric }
    }

    pub fn frontier(&self, pod: usize) -> &Arc<Frontier> {
        &self.frontiers[pod]
    }

    pub fn frontiers(&self) -> &[Arc<Frontier>] {
        &self.frontiers
    }

    /// Group urls by owning pod and admit each batch there. A pod that
    /// fails its add is retried with backoff; after the retry budget the
    /// batch is dropped (deferred to rediscovery), never misrouted.
    pub async fn route(&self, urls: Vec<(Url, u32)>, bypass_seen_check: bool) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        let mut batches: HashMap<usize, Vec<(Url, u32)>> = HashMap::new();

        for (mut url, depth) in urls {
            url.canonicalize_in_place();

            let Some(domain) = Domain::from_url(&url) else {
                outcome.dropped += 1;
                continue;
            };

            batches
                .entry(self.fabric.pod_of(&domain))
                .or_default()
                .push((url, depth));
        }

        for (pod, batch) in batches {
            let size = batch.len();

            match self.add_with_retry(pod, batch, bypass_seen_check).await {
                Ok(added) => {
                    outcome.admitted += added.admitted;
                    outcome.dropped += added.dropped;
                }
                Err(e) => {
                    tracing::warn!("dropping {size} urls for pod {pod}: {e}");
                    outcome.dropped += size;
                }
            }
        }

        outcome
    }

    async fn add_with_retry(
        &self,
        pod: usize,
        batch: Vec<(Url, u32)>,
        bypass_seen_check: bool,
    ) -> Result<AddOutcome> {
        let mut attempt = 0;

        loop {
            match self.frontiers[pod]
                .add_urls(batch.clone(), bypass_seen_check)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt + 1 < ROUTE_RETRIES => {
                    tracing::debug!("add to pod {pod} failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(200 * (1 << attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::pod_store::PodStore;

    fn router(num_pods: usize) -> (FrontierRouter, Arc<bloom::U64BloomFilter>) {
        let root = crate::gen_temp_path();
        let mut config = CrawlConfig::single_pod(&root);
        config.pods = (0..num_pods)
            .map(|i| crate::config::PodConfig {
                kv_url: root.join(format!("pod-{i}.redb")).display().to_string(),
            })
            .collect();

        let fabric = Arc::new(ShardFabric::open(&config).unwrap());
        let seen = Arc::new(bloom::U64BloomFilter::new(100_000, 0.001));

        let frontiers = (0..num_pods)
            .map(|pod| {
                Arc::new(
                    Frontier::new(
                        pod,
                        Arc::new(
                            PodStore::open(pod, root.join(format!("front-{pod}.redb"))).unwrap(),
                        ),
                        Arc::clone(&seen),
                        root.join(format!("frontiers-{pod}")),
                        root.join("logs"),
                        Duration::from_secs(70),
                    )
                    .unwrap(),
                )
            })
            .collect();

        (FrontierRouter::new(frontiers, fabric), seen)
    }

    #[tokio::test]
    async fn urls_land_on_their_owning_pod() {
        let (router, _seen) = router(4);

        let urls: Vec<_> = (0..20)
            .map(|i| (Url::parse(&format!("http://site-{i}.com/")).unwrap(), 0))
            .collect();

        let outcome = router.route(urls, false).await;
        assert_eq!(outcome.admitted, 20);

        let mut total_ready = 0;
        for (pod, frontier) in router.frontiers().iter().enumerate() {
            let ready = frontier.ready_len();
            total_ready += ready;

            // every domain this frontier accepted must hash to this pod
            for i in 0..20 {
                let domain = Domain::from(format!("site-{i}.com"));
                if router.fabric.pod_of(&domain) != pod {
                    continue;
                }
                assert!(ready > 0, "pod {pod} should own site-{i}.com");
            }
        }
        assert_eq!(total_ready, 20);
    }

    #[tokio::test]
    async fn cross_pod_duplicates_admit_once() {
        let (router, _seen) = router(4);

        // ten "parsers" discover the same url many times
        let mut handles = Vec::new();
        let router = Arc::new(router);

        for _ in 0..10 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..100 {
                    let urls = vec![(Url::parse("http://a.com/x").unwrap(), 1)];
                    admitted += router.route(urls, false).await.admitted;
                }
                admitted
            }));
        }

        let mut total_admitted = 0;
        for handle in handles {
            total_admitted += handle.await.unwrap();
        }

        assert_eq!(total_admitted, 1);
    }
}
