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

//! Single-host web crawler built around a sharded frontier.
//!
//! Domains are hashed onto a fixed set of pods. A pod owns all frontier and
//! politeness state for its domains; fetched content is sharded over the
//! content directories independently of the pod assignment.

use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod content_store;
pub mod coordinator;
pub mod extract;
pub mod fabric;
pub mod fetch;
pub mod fingerprint;
pub mod frontier;
pub mod metrics;
pub mod orchestrator;
pub mod parse;
pub mod pod_store;
pub mod politeness;
pub mod robots;
pub mod router;
pub mod url_ext;
pub mod visited;

pub const MAX_URL_LEN_BYTES: usize = 8192;
pub const MAX_URLS_FOR_DOMAIN_PER_INSERT: usize = 256;
pub const MAX_OUTGOING_URLS_PER_PAGE: usize = 200;
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shard unavailable: pod {0}")]
    ShardUnavailable(usize),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("fetch failed: {status}")]
    FetchFailed { status: u16 },

    #[error("content too large")]
    ContentTooLarge,

    #[error("invalid content type: {0}")]
    InvalidContentType(String),

    #[error("invalid redirect")]
    InvalidRedirect,

    #[error("url disallowed by politeness")]
    Disallowed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Seconds since the unix epoch.
pub fn unix_ts_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// taken from https://docs.rs/sled/0.34.7/src/sled/config.rs.html#445
pub fn gen_temp_path() -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    static SALT_COUNTER: AtomicUsize = AtomicUsize::new(0);

    let seed = SALT_COUNTER.fetch_add(1, Ordering::SeqCst) as u128;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        << 48;

    let pid = u128::from(std::process::id());

    let salt = (pid << 16) + now + seed;

    if cfg!(target_os = "linux") {
        // use shared memory for temporary linux files
        format!("/dev/shm/pagecache.tmp.{salt}").into()
    } else {
        std::env::temp_dir().join(format!("pagecache.tmp.{salt}"))
    }
}
