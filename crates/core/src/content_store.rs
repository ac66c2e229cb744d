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

//! Write-once text store spread over the content directories. Writes go
//! through a salted temp file and a rename, so a reader never sees a
//! partial artifact under the canonical name.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fingerprint::ContentFp;
use crate::Result;

static TMP_SALT: AtomicU64 = AtomicU64::new(0);

pub struct ContentStore {
    dirs: Vec<PathBuf>,
}

impl ContentStore {
    pub fn open(data_dirs: &[PathBuf]) -> Result<Self> {
        let mut dirs = Vec::with_capacity(data_dirs.len());

        for dir in data_dirs {
            let content = dir.join("content");
            std::fs::create_dir_all(&content)?;
            sweep_temp_files(&content)?;
            dirs.push(content);
        }

        Ok(Self { dirs })
    }

    pub fn num_dirs(&self) -> usize {
        self.dirs.len()
    }

    pub fn dir_of(&self, fp: &ContentFp) -> usize {
        (fp.first_u32() % self.dirs.len() as u32) as usize
    }

    pub fn path_of(&self, fp: &ContentFp) -> PathBuf {
        self.dirs[self.dir_of(fp)].join(format!("{}.txt", fp.hex()))
    }

    /// Write the artifact unless it already exists. An existing file is
    /// success without a rewrite.
    pub fn store(&self, fp: &ContentFp, text: &str) -> Result<PathBuf> {
        let path = self.path_of(fp);

        if path.exists() {
            return Ok(path);
        }

        let salt = TMP_SALT.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.{salt}.tmp", std::process::id()));

        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;

        Ok(path)
    }
}

fn sweep_temp_files(dir: &std::path::Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            std::fs::remove_file(&path).ok();
        }
    }

    Ok(())
}
