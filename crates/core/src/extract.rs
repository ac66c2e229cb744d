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

use itertools::Itertools;
use scraper::{Html, Selector};
use url::Url;

pub struct Extraction {
    pub text: String,
    pub outbound_urls: Vec<Url>,
}

/// Seam for the html-to-text collaborator.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, body: &[u8], base_url: &Url) -> Extraction;
}

pub fn is_textual(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.split(';').next().unwrap_or(ct).trim();
            ct.starts_with("text/") || ct == "application/xhtml+xml" || ct.ends_with("+xml")
        }
        // servers that send no content type mostly serve html
        None => true,
    }
}

pub struct HtmlTextExtractor {
    anchors: Selector,
}

impl Default for HtmlTextExtractor {
    fn default() -> Self {
        Self {
            anchors: Selector::parse("a[href]").unwrap(),
        }
    }
}

impl TextExtractor for HtmlTextExtractor {
    fn extract(&self, body: &[u8], base_url: &Url) -> Extraction {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);

        let text = document
            .tree
            .nodes()
            .filter_map(|node| {
                let scraper::node::Node::Text(text) = node.value() else {
                    return None;
                };

                let parent = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name().to_string()));
                if matches!(parent.as_deref(), Some("script" | "style" | "noscript")) {
                    return None;
                }

                Some(text.to_string())
            })
            .flat_map(|t| t.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .join(" ");

        let outbound_urls = document
            .select(&self.anchors)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| Url::parse(href).or_else(|_| base_url.join(href)).ok())
            .unique()
            .collect();

        Extraction {
            text,
            outbound_urls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_and_links() {
        let body = br#"<html><head><title>T</title><style>.x{}</style></head>
            <body><p>Hello   world</p>
            <script>var x = "no";</script>
            <a href="/rel">rel</a>
            <a href="https://other.com/abs">abs</a>
            </body></html>"#;

        let extractor = HtmlTextExtractor::default();
        let base = Url::parse("https://a.com/page").unwrap();
        let extraction = extractor.extract(body, &base);

        assert!(extraction.text.contains("Hello world"));
        assert!(!extraction.text.contains("var x"));
        assert!(!extraction.text.contains(".x{}"));

        let links: Vec<_> = extraction
            .outbound_urls
            .iter()
            .map(|u| u.as_str())
            .collect();
        assert!(links.contains(&"https://a.com/rel"));
        assert!(links.contains(&"https://other.com/abs"));
    }

    #[test]
    fn duplicate_links_are_collapsed() {
        let body = br#"<a href="/x">1</a><a href="/x">2</a>"#;

        let extractor = HtmlTextExtractor::default();
        let base = Url::parse("https://a.com/").unwrap();
        let extraction = extractor.extract(body, &base);

        assert_eq!(extraction.outbound_urls.len(), 1);
    }

    #[test]
    fn textual_content_types() {
        assert!(is_textual(Some("text/html; charset=utf-8")));
        assert!(is_textual(Some("text/plain")));
        assert!(is_textual(Some("application/xhtml+xml")));
        assert!(is_textual(None));
        assert!(!is_textual(Some("image/png")));
        assert!(!is_textual(Some("application/octet-stream")));
    }
}
