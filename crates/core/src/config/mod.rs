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

pub mod defaults;

use std::path::{Path, PathBuf};

use crate::Error;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PodConfig {
    /// `file://<path>` or a bare filesystem path for the pod's embedded store.
    pub kv_url: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UserAgent {
    #[serde(default = "defaults::UserAgent::full")]
    pub full: String,

    #[serde(default = "defaults::UserAgent::token")]
    pub token: String,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            full: defaults::UserAgent::full(),
            token: defaults::UserAgent::token(),
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CrawlConfig {
    pub pods: Vec<PodConfig>,
    pub data_dirs: Vec<PathBuf>,
    pub log_dir: PathBuf,
    pub frontier_dir: PathBuf,

    #[serde(default = "defaults::Crawl::fetchers_per_pod")]
    pub fetchers_per_pod: usize,

    #[serde(default = "defaults::Crawl::parsers_per_pod")]
    pub parsers_per_pod: usize,

    #[serde(default = "defaults::Crawl::fetcher_workers")]
    pub fetcher_workers: usize,

    #[serde(default = "defaults::Crawl::parser_workers")]
    pub parser_workers: usize,

    #[serde(default = "defaults::Crawl::enable_cpu_affinity")]
    pub enable_cpu_affinity: bool,

    #[serde(default = "defaults::Crawl::cores_per_pod")]
    pub cores_per_pod: usize,

    #[serde(default = "defaults::Crawl::politeness_delay_seconds")]
    pub politeness_delay_seconds: u64,

    #[serde(default = "defaults::Crawl::robots_cache_ttl_seconds")]
    pub robots_cache_ttl_seconds: u64,

    #[serde(default = "defaults::Crawl::http_timeout_seconds")]
    pub http_timeout_seconds: u64,

    #[serde(default = "defaults::Crawl::http_max_retries")]
    pub http_max_retries: usize,

    #[serde(default = "defaults::Crawl::grace_shutdown_seconds")]
    pub grace_shutdown_seconds: u64,

    #[serde(default = "defaults::Crawl::parse_queue_soft_limit")]
    pub parse_queue_soft_limit: usize,

    #[serde(default = "defaults::Crawl::parse_queue_hard_limit")]
    pub parse_queue_hard_limit: usize,

    #[serde(default = "defaults::Crawl::seen_capacity")]
    pub seen_capacity: u64,

    #[serde(default = "defaults::Crawl::seen_error_rate")]
    pub seen_error_rate: f64,

    #[serde(default = "defaults::Crawl::seen_persist_interval_seconds")]
    pub seen_persist_interval_seconds: u64,

    #[serde(default = "defaults::Crawl::global_coordination_pod")]
    pub global_coordination_pod: usize,

    #[serde(default = "defaults::Crawl::prometheus_port")]
    pub prometheus_port: u16,

    #[serde(default = "defaults::Crawl::enable_prometheus")]
    pub enable_prometheus: bool,

    #[serde(default)]
    pub user_agent: UserAgent,

    #[serde(default)]
    pub manual_exclusions_file: Option<PathBuf>,
}

impl CrawlConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            Error::Config(format!(
                "failed to parse config '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Single-pod layout rooted at `root`, for runs without a config file.
    pub fn single_pod<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();

        let config = Self {
            pods: vec![PodConfig {
                kv_url: root.join("pod-0.redb").display().to_string(),
            }],
            data_dirs: vec![root.join("data-0")],
            log_dir: root.join("logs"),
            frontier_dir: root.join("frontiers"),
            fetchers_per_pod: defaults::Crawl::fetchers_per_pod(),
            parsers_per_pod: defaults::Crawl::parsers_per_pod(),
            fetcher_workers: defaults::Crawl::fetcher_workers(),
            parser_workers: defaults::Crawl::parser_workers(),
            enable_cpu_affinity: defaults::Crawl::enable_cpu_affinity(),
            cores_per_pod: defaults::Crawl::cores_per_pod(),
            politeness_delay_seconds: defaults::Crawl::politeness_delay_seconds(),
            robots_cache_ttl_seconds: defaults::Crawl::robots_cache_ttl_seconds(),
            http_timeout_seconds: defaults::Crawl::http_timeout_seconds(),
            http_max_retries: defaults::Crawl::http_max_retries(),
            grace_shutdown_seconds: defaults::Crawl::grace_shutdown_seconds(),
            parse_queue_soft_limit: defaults::Crawl::parse_queue_soft_limit(),
            parse_queue_hard_limit: defaults::Crawl::parse_queue_hard_limit(),
            seen_capacity: 10_000_000,
            seen_error_rate: defaults::Crawl::seen_error_rate(),
            seen_persist_interval_seconds: defaults::Crawl::seen_persist_interval_seconds(),
            global_coordination_pod: defaults::Crawl::global_coordination_pod(),
            prometheus_port: defaults::Crawl::prometheus_port(),
            enable_prometheus: defaults::Crawl::enable_prometheus(),
            user_agent: UserAgent::default(),
            manual_exclusions_file: None,
        };

        debug_assert!(config.validate().is_ok());

        config
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pods.is_empty() {
            return Err(Error::Config("at least one pod is required".to_string()));
        }

        if self.data_dirs.is_empty() {
            return Err(Error::Config(
                "at least one data dir is required".to_string(),
            ));
        }

        if self.global_coordination_pod >= self.pods.len() {
            return Err(Error::Config(format!(
                "global_coordination_pod {} out of range (have {} pods)",
                self.global_coordination_pod,
                self.pods.len()
            )));
        }

        if self.parse_queue_soft_limit > self.parse_queue_hard_limit {
            return Err(Error::Config(
                "parse_queue_soft_limit must be <= parse_queue_hard_limit".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.seen_error_rate) || self.seen_error_rate == 0.0 {
            return Err(Error::Config(
                "seen_error_rate must be in (0, 1)".to_string(),
            ));
        }

        if self.fetchers_per_pod == 0 || self.parsers_per_pod == 0 {
            return Err(Error::Config(
                "fetchers_per_pod and parsers_per_pod must be positive".to_string(),
            ));
        }

        if self.fetcher_workers == 0 || self.parser_workers == 0 {
            return Err(Error::Config(
                "fetcher_workers and parser_workers must be positive".to_string(),
            ));
        }

        for pod in &self.pods {
            pod_store_path(&pod.kv_url)?;
        }

        Ok(())
    }
}

/// Resolve a pod `kv_url` to the filesystem path of its embedded store.
pub fn pod_store_path(kv_url: &str) -> Result<PathBuf, Error> {
    if let Some(rest) = kv_url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }

    if kv_url.contains("://") {
        return Err(Error::Config(format!(
            "unsupported kv_url scheme in '{kv_url}' (expected file:// or a path)"
        )));
    }

    Ok(PathBuf::from(kv_url))
}
