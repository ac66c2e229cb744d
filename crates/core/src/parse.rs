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

//! Parser workers: drain the parse queue, extract text, persist content,
//! record the visit and route discovered urls to their owning pods.

use std::sync::Arc;

use tokio::sync::watch;

use crate::content_store::ContentStore;
use crate::coordinator::GlobalCoordinator;
use crate::extract::{is_textual, TextExtractor};
use crate::fetch::{Backpressure, ParseTask};
use crate::fingerprint::{ContentFp, UrlFp};
use crate::router::FrontierRouter;
use crate::visited::{VisitedRecord, VisitedStore};
use crate::{Result, MAX_OUTGOING_URLS_PER_PAGE};

pub struct Parser {
    queue: async_channel::Receiver<ParseTask>,
    backpressure: Arc<Backpressure<ParseTask>>,
    extractor: Arc<dyn TextExtractor>,
    content: Arc<ContentStore>,
    visited: Arc<VisitedStore>,
    router: Arc<FrontierRouter>,
    coordinator: Arc<GlobalCoordinator>,
    stop: watch::Receiver<bool>,
}

impl Parser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: async_channel::Receiver<ParseTask>,
        backpressure: Arc<Backpressure<ParseTask>>,
        extractor: Arc<dyn TextExtractor>,
        content: Arc<ContentStore>,
        visited: Arc<VisitedStore>,
        router: Arc<FrontierRouter>,
        coordinator: Arc<GlobalCoordinator>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            backpressure,
            extractor,
            content,
            visited,
            router,
            coordinator,
            stop,
        }
    }

    pub async fn run(mut self) {
        loop {
            // after the stop flag: drain what is already queued, then exit
            let task = if *self.stop.borrow() {
                match self.queue.try_recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            } else {
                tokio::select! {
                    res = self.queue.recv() => match res {
                        Ok(task) => task,
                        Err(_) => break,
                    },
                    _ = self.stop.changed() => continue,
                }
            };

            self.backpressure.signal();

            if let Err(e) = self.process(task).await {
                tracing::warn!("parse failed: {e}");
            }
        }
    }

    /// Idempotent: replaying the same task produces the same content file,
    /// the same visited record (timestamps aside) and no new frontier
    /// entries.
    pub async fn process(&self, task: ParseTask) -> Result<()> {
        let fp = UrlFp::of(&task.url);
        let content_fp = ContentFp::of_url(&task.url);

        let textual = is_textual(task.content_type.as_deref());

        // oversize (truncated) responses are recorded without content
        let extraction = if textual && task.status == 200 && !task.body.is_empty() && !task.truncated
        {
            Some(self.extractor.extract(&task.body, &task.final_url))
        } else {
            None
        };

        // content write comes first: a missing content file must imply a
        // missing visited record, never the other way around
        let (content_path, content_hash) = match &extraction {
            Some(extraction) if !extraction.text.is_empty() => {
                let text_fp = ContentFp::of_text(&extraction.text);
                let store = Arc::clone(&self.content);
                let text = extraction.text.clone();
                let path =
                    tokio::task::spawn_blocking(move || store.store(&content_fp, &text)).await??;

                (
                    Some(path.display().to_string()),
                    Some(text_fp.hex()),
                )
            }
            _ => (None, None),
        };

        self.visited.upsert(
            &content_fp,
            fp,
            VisitedRecord {
                url: task.url.to_string(),
                domain: task.domain.as_str().to_string(),
                status_code: task.status,
                crawl_ts: task.fetched_ts,
                content_type: task.content_type.clone(),
                content_hash,
                content_path,
                final_url: task.final_url.to_string(),
            },
        )?;

        if task.status == 200 {
            self.coordinator.record_page();
        }

        if let Some(extraction) = extraction {
            let discovered: Vec<_> = extraction
                .outbound_urls
                .into_iter()
                .take(MAX_OUTGOING_URLS_PER_PAGE)
                .map(|url| (url, task.depth + 1))
                .collect();

            if !discovered.is_empty() {
                let outcome = self.router.route(discovered, false).await;
                tracing::trace!(
                    "discovered {} urls from {} ({} duplicates)",
                    outcome.admitted,
                    task.url,
                    outcome.dropped
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::coordinator::CrawlLimits;
    use crate::extract::HtmlTextExtractor;
    use crate::fabric::{Domain, ShardFabric};
    use crate::frontier::Frontier;
    use crate::pod_store::PodStore;
    use std::path::PathBuf;
    use std::time::Duration;
    use url::Url;

    struct Fixture {
        parser: Parser,
        visited: Arc<VisitedStore>,
        content: Arc<ContentStore>,
        coordinator: Arc<GlobalCoordinator>,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = crate::gen_temp_path();
        let config = CrawlConfig::single_pod(&root);

        let data_dirs = vec![root.join("data-0"), root.join("data-1")];
        let content = Arc::new(ContentStore::open(&data_dirs).unwrap());
        let visited = Arc::new(VisitedStore::open(&data_dirs).unwrap());

        let fabric = Arc::new(ShardFabric::open(&config).unwrap());
        let seen = Arc::new(bloom::U64BloomFilter::new(100_000, 0.001));

        let frontier = Arc::new(
            Frontier::new(
                0,
                Arc::new(PodStore::open(0, root.join("front.redb")).unwrap()),
                Arc::clone(&seen),
                root.join("frontiers"),
                root.join("logs"),
                Duration::from_secs(70),
            )
            .unwrap(),
        );
        let router = Arc::new(FrontierRouter::new(vec![frontier], Arc::clone(&fabric)));

        let coordinator = Arc::new(
            GlobalCoordinator::new(
                seen,
                Arc::new(PodStore::open(0, root.join("coord.redb")).unwrap()),
                CrawlLimits::default(),
                root.join("seen.bloom"),
                Duration::from_secs(300),
            )
            .unwrap(),
        );

        let (tx, rx) = async_channel::bounded(16);
        let backpressure = Arc::new(Backpressure::new(tx, 8));

        Fixture {
            parser: Parser::new(
                rx,
                backpressure,
                Arc::new(HtmlTextExtractor::default()),
                Arc::clone(&content),
                Arc::clone(&visited),
                router,
                Arc::clone(&coordinator),
                coordinator.stop_rx(),
            ),
            visited,
            content,
            coordinator,
            root,
        }
    }

    fn task(url: &str, body: &str) -> ParseTask {
        let url = Url::parse(url).unwrap();

        ParseTask {
            final_url: url.clone(),
            domain: Domain::from_url(&url).unwrap(),
            url,
            status: 200,
            content_type: Some("text/html".to_string()),
            body: body.as_bytes().to_vec(),
            truncated: false,
            fetched_ts: crate::unix_ts_now(),
            depth: 0,
        }
    }

    #[tokio::test]
    async fn stores_content_and_visited_record() {
        let fixture = fixture();
        let task = task(
            "http://a.com/x",
            "<html><body><p>words here</p><a href=\"/next\">n</a></body></html>",
        );

        fixture.parser.process(task.clone()).await.unwrap();

        let fp = UrlFp::of(&task.url);
        let content_fp = ContentFp::of_url(&task.url);

        let record = fixture.visited.get(&content_fp, fp).unwrap().unwrap();
        assert_eq!(record.status_code, 200);
        assert_eq!(record.domain, "a.com");

        let path = record.content_path.unwrap();
        let stored = std::fs::read_to_string(&path).unwrap();
        assert!(stored.contains("words here"));

        assert_eq!(
            PathBuf::from(&path),
            fixture.content.path_of(&content_fp)
        );
        assert_eq!(fixture.coordinator.pages_crawled(), 1);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let fixture = fixture();
        let task = task("http://a.com/x", "<p>hello</p><a href=\"/y\">y</a>");

        fixture.parser.process(task.clone()).await.unwrap();
        fixture.parser.process(task.clone()).await.unwrap();

        assert_eq!(fixture.visited.approx_len().unwrap(), 1);

        // frontier admitted /y exactly once
        assert_eq!(fixture.parser.router.frontier(0).count(), 1);
    }

    #[tokio::test]
    async fn empty_text_writes_no_content_file() {
        let fixture = fixture();
        let task = task("http://a.com/empty", "<html><body></body></html>");

        fixture.parser.process(task.clone()).await.unwrap();

        let content_fp = ContentFp::of_url(&task.url);
        let record = fixture
            .visited
            .get(&content_fp, UrlFp::of(&task.url))
            .unwrap()
            .unwrap();

        assert_eq!(record.content_path, None);
        assert!(!fixture.content.path_of(&content_fp).exists());
    }

    #[tokio::test]
    async fn binary_response_recorded_without_content() {
        let fixture = fixture();
        let mut task = task("http://a.com/bin", "not html");
        task.content_type = Some("application/octet-stream".to_string());

        fixture.parser.process(task.clone()).await.unwrap();

        let content_fp = ContentFp::of_url(&task.url);
        let record = fixture
            .visited
            .get(&content_fp, UrlFp::of(&task.url))
            .unwrap()
            .unwrap();

        assert_eq!(record.content_path, None);
        assert_eq!(
            record.content_type,
            Some("application/octet-stream".to_string())
        );
    }

    #[tokio::test]
    async fn truncated_response_recorded_without_content() {
        let fixture = fixture();
        let mut task = task("http://a.com/huge", "<p>cut off</p>");
        task.truncated = true;

        fixture.parser.process(task.clone()).await.unwrap();

        let content_fp = ContentFp::of_url(&task.url);
        let record = fixture
            .visited
            .get(&content_fp, UrlFp::of(&task.url))
            .unwrap()
            .unwrap();

        assert_eq!(record.content_path, None);
        assert!(!fixture.content.path_of(&content_fp).exists());
    }

    #[tokio::test]
    async fn server_error_recorded_with_status() {
        let fixture = fixture();
        let mut task = task("http://a.com/down", "");
        task.status = 503;
        task.body = Vec::new();

        fixture.parser.process(task.clone()).await.unwrap();

        let content_fp = ContentFp::of_url(&task.url);
        let record = fixture
            .visited
            .get(&content_fp, UrlFp::of(&task.url))
            .unwrap()
            .unwrap();

        assert_eq!(record.status_code, 503);
        assert_eq!(record.content_path, None);
        assert_eq!(fixture.coordinator.pages_crawled(), 0);
    }

    #[tokio::test]
    async fn content_sharding_scenario() {
        let fixture = fixture();

        let urls = [
            "http://u1.com/a",
            "http://u2.com/b",
            "http://u3.com/c",
            "http://u4.com/d",
        ];

        for url in urls {
            fixture
                .parser
                .process(task(url, "<p>content for the page</p>"))
                .await
                .unwrap();
        }

        for url in urls {
            let parsed = Url::parse(url).unwrap();
            let content_fp = ContentFp::of_url(&parsed);
            let expected_dir = (content_fp.first_u32() % 2) as usize;

            let record = fixture
                .visited
                .get(&content_fp, UrlFp::of(&parsed))
                .unwrap()
                .unwrap();
            let path = record.content_path.unwrap();

            assert!(
                path.contains(&format!("data-{expected_dir}")),
                "{path} not in data-{expected_dir}"
            );
        }

        // re-parsing produces no extra files or rows
        let count_files = |root: &PathBuf| {
            let mut n = 0;
            for dir in ["data-0", "data-1"] {
                n += std::fs::read_dir(root.join(dir).join("content"))
                    .map(|d| d.count())
                    .unwrap_or(0);
            }
            n
        };

        let before = count_files(&fixture.root);
        for url in urls {
            fixture
                .parser
                .process(task(url, "<p>content for the page</p>"))
                .await
                .unwrap();
        }

        assert_eq!(count_files(&fixture.root), before);
        assert_eq!(fixture.visited.approx_len().unwrap(), 4);
    }
}
