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

pub struct Crawl;

impl Crawl {
    pub fn fetchers_per_pod() -> usize {
        64
    }

    pub fn parsers_per_pod() -> usize {
        16
    }

    pub fn fetcher_workers() -> usize {
        4
    }

    pub fn parser_workers() -> usize {
        4
    }

    pub fn enable_cpu_affinity() -> bool {
        false
    }

    pub fn cores_per_pod() -> usize {
        12
    }

    pub fn politeness_delay_seconds() -> u64 {
        70
    }

    pub fn robots_cache_ttl_seconds() -> u64 {
        86_400
    }

    pub fn http_timeout_seconds() -> u64 {
        30
    }

    pub fn http_max_retries() -> usize {
        2
    }

    pub fn grace_shutdown_seconds() -> u64 {
        10
    }

    pub fn parse_queue_soft_limit() -> usize {
        1_024
    }

    pub fn parse_queue_hard_limit() -> usize {
        4_096
    }

    pub fn seen_capacity() -> u64 {
        10_000_000_000
    }

    pub fn seen_error_rate() -> f64 {
        0.001
    }

    pub fn seen_persist_interval_seconds() -> u64 {
        300
    }

    pub fn global_coordination_pod() -> usize {
        0
    }

    pub fn prometheus_port() -> u16 {
        9100
    }

    pub fn enable_prometheus() -> bool {
        false
    }
}

pub struct UserAgent;

impl UserAgent {
    pub fn full() -> String {
        "Mozilla/5.0 (compatible; TrawlerBot/0.1; +https://trawler.dev/bot)".to_string()
    }

    pub fn token() -> String {
        "TrawlerBot".to_string()
    }
}
