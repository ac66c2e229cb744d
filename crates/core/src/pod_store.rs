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

//! Per-pod embedded store. All per-domain state lives here under
//! `domain:<domain>`; the coordinator pod additionally holds `counter:*`
//! and `stop:flag`. Only the owning pod mutates its store.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use redb::ReadableTable;

use crate::fabric::Domain;
use crate::{Error, Result};

const KV_TABLE: redb::TableDefinition<'static, &str, &[u8]> = redb::TableDefinition::new("kv");

#[derive(Debug, Clone, Default, PartialEq, bincode::Encode, bincode::Decode)]
pub struct DomainRecord {
    pub last_scheduled_fetch_ts: u64,
    pub robots_cached_content: Option<String>,
    pub robots_fetched_ts: u64,
    pub robots_expires_ts: u64,
    pub is_manually_excluded: bool,
    pub is_seeded: bool,
    pub frontier_offset: u64,
}

pub struct PodStore {
    db: redb::Database,
    pod: usize,
    available: AtomicBool,
}

impl PodStore {
    pub fn open<P: AsRef<Path>>(pod: usize, path: P) -> Result<Self> {
        let path = path.as_ref();

        let db = if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            redb::Database::create(path)?
        } else {
            redb::Database::open(path)?
        };

        // make sure the table exists
        let txn = db.begin_write()?;
        txn.open_table(KV_TABLE)?;
        txn.commit()?;

        Ok(Self {
            db,
            pod,
            available: AtomicBool::new(true),
        })
    }

    pub fn pod(&self) -> usize {
        self.pod
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    fn storage_err(&self, e: impl std::fmt::Display) -> Error {
        Error::StorageUnavailable(format!("pod {}: {e}", self.pod))
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let txn = self.db.begin_read().map_err(|e| self.storage_err(e))?;
        let table = txn.open_table(KV_TABLE).map_err(|e| self.storage_err(e))?;

        let value = table
            .get(key)
            .map_err(|e| self.storage_err(e))?
            .map(|v| v.value().to_vec());

        Ok(value)
    }

    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let txn = self.db.begin_write().map_err(|e| self.storage_err(e))?;
        {
            let mut table = txn.open_table(KV_TABLE).map_err(|e| self.storage_err(e))?;
            table.insert(key, value).map_err(|e| self.storage_err(e))?;
        }
        txn.commit().map_err(|e| self.storage_err(e))?;

        Ok(())
    }

    fn domain_key(domain: &Domain) -> String {
        format!("domain:{domain}")
    }

    pub fn domain_record(&self, domain: &Domain) -> Result<Option<DomainRecord>, Error> {
        match self.get_raw(&Self::domain_key(domain))? {
            Some(bytes) => {
                let (record, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| self.storage_err(e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write of a domain record inside one transaction. The
    /// record is created with defaults when absent.
    pub fn update_domain<F>(&self, domain: &Domain, f: F) -> Result<DomainRecord, Error>
    where
        F: FnOnce(&mut DomainRecord),
    {
        let key = Self::domain_key(domain);
        let txn = self.db.begin_write().map_err(|e| self.storage_err(e))?;

        let record = {
            let mut table = txn.open_table(KV_TABLE).map_err(|e| self.storage_err(e))?;

            let mut record = match table.get(key.as_str()).map_err(|e| self.storage_err(e))? {
                Some(bytes) => {
                    let (record, _) =
                        bincode::decode_from_slice(bytes.value(), bincode::config::standard())
                            .map_err(|e| self.storage_err(e))?;
                    record
                }
                None => DomainRecord::default(),
            };

            f(&mut record);

            let bytes = bincode::encode_to_vec(&record, bincode::config::standard())
                .map_err(|e| self.storage_err(e))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| self.storage_err(e))?;

            record
        };

        txn.commit().map_err(|e| self.storage_err(e))?;

        Ok(record)
    }

    pub fn counter(&self, name: &str) -> Result<u64, Error> {
        let value = self
            .get_raw(&format!("counter:{name}"))?
            .map(|bytes| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(buf)
            })
            .unwrap_or(0);

        Ok(value)
    }

    pub fn set_counter(&self, name: &str, value: u64) -> Result<(), Error> {
        self.put_raw(&format!("counter:{name}"), &value.to_le_bytes())
    }

    pub fn stop_flag(&self) -> Result<bool, Error> {
        Ok(self
            .get_raw("stop:flag")?
            .map(|bytes| bytes.first() == Some(&1))
            .unwrap_or(false))
    }

    pub fn set_stop_flag(&self, stopped: bool) -> Result<(), Error> {
        self.put_raw("stop:flag", &[u8::from(stopped)])
    }
}
