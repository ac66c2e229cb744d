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

//! Two fingerprint widths, one per purpose: 64-bit xxh3 for seen-set
//! membership, sharding and visited keys; 256-bit SHA-256 for content
//! directory selection and content file naming.

use url::Url;

/// 64-bit fingerprint of a canonical url.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrlFp(u64);

impl UrlFp {
    pub fn of(url: &Url) -> Self {
        Self(bloom::fast_stable_hash_64(url.as_str().as_bytes()))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for UrlFp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// 256-bit fingerprint used for content placement and naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFp([u8; 32]);

impl ContentFp {
    pub fn of_url(url: &Url) -> Self {
        Self::digest(url.as_str().as_bytes())
    }

    pub fn of_text(text: &str) -> Self {
        Self::digest(text.as_bytes())
    }

    fn digest(bytes: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Self(out)
    }

    pub fn first_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn hex(&self) -> String {
        use std::fmt::Write;

        let mut s = String::with_capacity(64);
        for b in self.0 {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }
}
