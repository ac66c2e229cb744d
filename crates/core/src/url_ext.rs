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

use crate::Result;
use url::Url;

pub trait UrlExt {
    fn parse_with_base_url(base_url: &Url, url: &str) -> Result<Url> {
        Url::parse(url).or_else(|_| base_url.join(url).map_err(|e| e.into()))
    }
    fn registrable_domain(&self) -> Option<&str>;
    fn canonicalize_in_place(&mut self);
    fn is_fetchable(&self) -> bool;
}

impl UrlExt for Url {
    fn registrable_domain(&self) -> Option<&str> {
        psl::domain_str(self.host_str()?)
    }

    /// Canonicalize the url so that byte-equality of the serialized form is
    /// resource identity.
    ///
    /// The url crate already lowercases scheme and host and strips default
    /// ports. On top of that: fragment and credentials are removed, tracking
    /// query parameters are dropped, an empty query is erased, and unreserved
    /// percent-escapes in the path are decoded. Idempotent.
    fn canonicalize_in_place(&mut self) {
        self.set_fragment(None);

        let queries: Vec<_> = self
            .query_pairs()
            .filter(|(key, _)| {
                !key.starts_with("utm_")
                    && !key.starts_with("fbclid")
                    && !key.starts_with("gclid")
                    && !key.starts_with("msclkid")
            })
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        {
            let mut query_mut = self.query_pairs_mut();
            query_mut.clear();
            if !queries.is_empty() {
                query_mut.extend_pairs(queries);
            }
        }

        if self.query().unwrap_or_default().is_empty() {
            self.set_query(None);
        }

        if !self.username().is_empty() {
            let _ = self.set_username("");
        }

        if self.password().is_some() {
            let _ = self.set_password(None);
        }

        let path = self.path();
        if path.contains('%') {
            let decoded = decode_unreserved(path);
            if decoded != path {
                self.set_path(&decoded);
            }
        }
    }

    fn is_fetchable(&self) -> bool {
        if self.host_str().is_none() || !matches!(self.scheme(), "http" | "https") {
            return false;
        }

        if let Some(port) = self.port() {
            if port != 80 && port != 443 {
                return false;
            }
        }

        true
    }
}

pub fn canonicalized(url: &Url) -> Url {
    let mut url = url.clone();
    url.canonicalize_in_place();
    url
}

/// Decode `%XX` escapes whose target is an unreserved character
/// (ALPHA / DIGIT / "-" / "." / "_" / "~"). All other escapes are kept.
fn decode_unreserved(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(val) = u8::from_str_radix(hex, 16) {
                if val.is_ascii_alphanumeric() || matches!(val, b'-' | b'.' | b'_' | b'~') {
                    out.push(val as char);
                    i += 3;
                    continue;
                }
            }
        }

        // path is valid utf-8, copy the whole char
        let ch = path[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn canon(s: &str) -> String {
        canonicalized(&Url::parse(s).unwrap()).to_string()
    }

    #[test]
    fn strips_fragment_and_credentials() {
        assert_eq!(canon("https://b.com/p?x=1#frag"), "https://b.com/p?x=1");
        assert_eq!(canon("http://user:pw@a.com/"), "http://a.com/");
    }

    #[test]
    fn strips_tracking_params() {
        assert_eq!(
            canon("https://a.com/p?utm_source=x&id=2&fbclid=y"),
            "https://a.com/p?id=2"
        );
        assert_eq!(canon("https://a.com/p?utm_source=x"), "https://a.com/p");
    }

    #[test]
    fn default_port_and_case() {
        assert_eq!(canon("HTTP://A.com:80/"), "http://a.com/");
        assert_eq!(canon("https://a.com:443/x"), "https://a.com/x");
    }

    #[test]
    fn host_only_gets_trailing_slash() {
        assert_eq!(canon("http://a.com"), "http://a.com/");
    }

    #[test]
    fn decodes_unreserved_escapes_only() {
        assert_eq!(canon("https://a.com/%61bc"), "https://a.com/abc");
        // %2F is reserved ("/"), must stay encoded
        assert_eq!(canon("https://a.com/a%2Fb"), "https://a.com/a%2Fb");
        assert_eq!(canon("https://a.com/%7Euser"), "https://a.com/~user");
    }

    #[test]
    fn registrable_domains() {
        let url = Url::parse("http://news.example.co.uk/a").unwrap();
        assert_eq!(url.registrable_domain().unwrap(), "example.co.uk");

        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(url.registrable_domain().unwrap(), "example.com");
    }

    #[test]
    fn fetchable() {
        assert!(Url::parse("http://a.com/").unwrap().is_fetchable());
        assert!(Url::parse("https://a.com:443/").unwrap().is_fetchable());
        assert!(!Url::parse("ftp://a.com/").unwrap().is_fetchable());
        assert!(!Url::parse("http://a.com:8080/").unwrap().is_fetchable());
        assert!(!Url::parse("data:text/plain,hi").unwrap().is_fetchable());
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(path in "[a-zA-Z0-9/%._~-]{0,40}", query in "[a-z0-9=&]{0,20}") {
            let raw = format!("https://example.com/{path}?{query}");
            if let Ok(url) = Url::parse(&raw) {
                let once = canonicalized(&url);
                let twice = canonicalized(&once);
                prop_assert_eq!(once.as_str(), twice.as_str());
            }
        }
    }
}
