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

//! Authoritative record of fetched urls. Sharded over the data dirs the
//! same way as content artifacts, so a page's record and its text live on
//! the same disk. Writes are idempotent upserts; any parser may write.

use std::path::PathBuf;

use redb::{ReadableTable, ReadableTableMetadata};

use crate::fingerprint::{ContentFp, UrlFp};
use crate::Result;

const VISITED_TABLE: redb::TableDefinition<'static, u64, &[u8]> =
    redb::TableDefinition::new("visited");

#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct VisitedRecord {
    pub url: String,
    pub domain: String,
    pub status_code: u16,
    pub crawl_ts: u64,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    pub content_path: Option<String>,
    pub final_url: String,
}

pub struct VisitedStore {
    shards: Vec<redb::Database>,
}

impl VisitedStore {
    pub fn open(data_dirs: &[PathBuf]) -> Result<Self> {
        let mut shards = Vec::with_capacity(data_dirs.len());

        for dir in data_dirs {
            std::fs::create_dir_all(dir)?;
            let db = {
                let path = dir.join("visited.redb");
                if path.exists() {
                    redb::Database::open(&path)?
                } else {
                    redb::Database::create(&path)?
                }
            };

            let txn = db.begin_write()?;
            txn.open_table(VISITED_TABLE)?;
            txn.commit()?;

            shards.push(db);
        }

        Ok(Self { shards })
    }

    fn shard(&self, content_fp: &ContentFp) -> &redb::Database {
        &self.shards[(content_fp.first_u32() % self.shards.len() as u32) as usize]
    }

    /// Idempotent upsert; the stored crawl timestamp never decreases.
    pub fn upsert(
        &self,
        content_fp: &ContentFp,
        fp: UrlFp,
        mut record: VisitedRecord,
    ) -> Result<()> {
        let db = self.shard(content_fp);
        let txn = db.begin_write()?;

        {
            let mut table = txn.open_table(VISITED_TABLE)?;

            if let Some(existing) = table.get(fp.as_u64())? {
                let (existing, _): (VisitedRecord, _) =
                    bincode::decode_from_slice(existing.value(), bincode::config::standard())?;
                record.crawl_ts = record.crawl_ts.max(existing.crawl_ts);
            }

            let bytes = bincode::encode_to_vec(&record, bincode::config::standard())?;
            table.insert(fp.as_u64(), bytes.as_slice())?;
        }

        txn.commit()?;

        Ok(())
    }

    pub fn get(&self, content_fp: &ContentFp, fp: UrlFp) -> Result<Option<VisitedRecord>> {
        let db = self.shard(content_fp);
        let txn = db.begin_read()?;
        let table = txn.open_table(VISITED_TABLE)?;

        match table.get(fp.as_u64())? {
            Some(bytes) => {
                let (record, _) =
                    bincode::decode_from_slice(bytes.value(), bincode::config::standard())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Visit every stored url-fingerprint; used to rebuild the seen-set
    /// after a crash that lost the snapshot.
    pub fn for_each_fp<F: FnMut(u64)>(&self, mut f: F) -> Result<()> {
        for db in &self.shards {
            let txn = db.begin_read()?;
            let table = txn.open_table(VISITED_TABLE)?;

            for entry in table.iter()? {
                let (key, _) = entry?;
                f(key.value());
            }
        }

        Ok(())
    }

    pub fn approx_len(&self) -> Result<u64> {
        let mut total = 0;

        for db in &self.shards {
            let txn = db.begin_read()?;
            let table = txn.open_table(VISITED_TABLE)?;
            total += table.len()?;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn store(num_dirs: usize) -> VisitedStore {
        let root = crate::gen_temp_path();
        let dirs: Vec<_> = (0..num_dirs).map(|i| root.join(format!("data-{i}"))).collect();
        VisitedStore::open(&dirs).unwrap()
    }

    fn record(url: &str, ts: u64) -> (ContentFp, UrlFp, VisitedRecord) {
        let parsed = Url::parse(url).unwrap();

        (
            ContentFp::of_url(&parsed),
            UrlFp::of(&parsed),
            VisitedRecord {
                url: url.to_string(),
                domain: "a.com".to_string(),
                status_code: 200,
                crawl_ts: ts,
                content_type: Some("text/html".to_string()),
                content_hash: None,
                content_path: None,
                final_url: url.to_string(),
            },
        )
    }

    #[test]
    fn upsert_then_get() {
        let store = store(2);
        let (cfp, fp, rec) = record("http://a.com/x", 100);

        store.upsert(&cfp, fp, rec.clone()).unwrap();
        assert_eq!(store.get(&cfp, fp).unwrap().unwrap(), rec);
    }

    #[test]
    fn upsert_is_idempotent_with_monotone_ts() {
        let store = store(2);
        let (cfp, fp, rec) = record("http://a.com/x", 100);

        store.upsert(&cfp, fp, rec.clone()).unwrap();

        // replay with an older timestamp must not move time backwards
        let mut older = rec.clone();
        older.crawl_ts = 50;
        store.upsert(&cfp, fp, older).unwrap();

        assert_eq!(store.get(&cfp, fp).unwrap().unwrap().crawl_ts, 100);
        assert_eq!(store.approx_len().unwrap(), 1);
    }

    #[test]
    fn fps_iterate_across_shards() {
        let store = store(3);
        let mut expected = Vec::new();

        for i in 0..20 {
            let (cfp, fp, rec) = record(&format!("http://a.com/{i}"), i);
            store.upsert(&cfp, fp, rec).unwrap();
            expected.push(fp.as_u64());
        }

        let mut seen = Vec::new();
        store.for_each_fp(|fp| seen.push(fp)).unwrap();

        expected.sort_unstable();
        seen.sort_unstable();
        assert_eq!(seen, expected);
    }
}
