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

use url::Url;

use crate::config::{pod_store_path, CrawlConfig};
use crate::fingerprint::ContentFp;
use crate::pod_store::PodStore;
use crate::url_ext::UrlExt;
use crate::{Error, Result};

/// Registrable domain in canonical (lowercase) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    pub fn from_url(url: &Url) -> Option<Self> {
        url.registrable_domain().map(|d| Self(d.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable pseudorandom hash, also used to break ready-time ties.
    pub fn hash(&self) -> u64 {
        bloom::fast_stable_hash_64(self.0.as_bytes())
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed set of pods plus the content-dir mapping. Domains map to pods by
/// stable hash; content placement is independent of the pod assignment.
pub struct ShardFabric {
    stores: Vec<Arc<PodStore>>,
    num_content_dirs: usize,
}

impl ShardFabric {
    pub fn open(config: &CrawlConfig) -> Result<Self> {
        let mut stores = Vec::with_capacity(config.pods.len());

        for (pod, pod_config) in config.pods.iter().enumerate() {
            let path = pod_store_path(&pod_config.kv_url)?;
            stores.push(Arc::new(PodStore::open(pod, path)?));
        }

        Ok(Self {
            stores,
            num_content_dirs: config.data_dirs.len(),
        })
    }

    pub fn num_pods(&self) -> usize {
        self.stores.len()
    }

    pub fn num_content_dirs(&self) -> usize {
        self.num_content_dirs
    }

    pub fn pod_of(&self, domain: &Domain) -> usize {
        (domain.hash() % self.stores.len() as u64) as usize
    }

    pub fn content_dir_of(&self, fp: &ContentFp) -> usize {
        (fp.first_u32() % self.num_content_dirs as u32) as usize
    }

    /// Fails fast when the pod's store has been marked unreachable.
    pub fn store(&self, pod: usize) -> Result<Arc<PodStore>, Error> {
        let store = &self.stores[pod];

        if !store.is_available() {
            return Err(Error::ShardUnavailable(pod));
        }

        Ok(Arc::clone(store))
    }
}
