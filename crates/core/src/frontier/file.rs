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

//! Append-only per-domain url files. One `<url>|<depth>\n` entry per line;
//! the read offset lives in the pod store, never in the file.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use url::Url;

use crate::fabric::Domain;
use crate::Result;

#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, well-formed line. Second field is the offset just past it.
    Entry(Url, u32, u64),
    /// A complete but malformed line to step over.
    Skip(u64),
    /// End of readable data: either EOF or a partial trailing line that a
    /// concurrent append has not finished yet.
    End,
}

/// Two hex chars of the domain hash; keeps any single directory from
/// accumulating millions of files.
pub fn bucket(domain: &Domain) -> String {
    format!("{:02x}", domain.hash() & 0xff)
}

pub fn file_path<P: AsRef<Path>>(root: P, domain: &Domain) -> PathBuf {
    root.as_ref()
        .join(bucket(domain))
        .join(format!("{domain}.frontier"))
}

pub fn append(path: &Path, url: &Url, depth: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format!("{url}|{depth}\n").as_bytes())?;
    file.flush()?;

    Ok(())
}

pub fn read_at(path: &Path, offset: u64) -> Result<ReadOutcome> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::End),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut line = String::new();
    let read = reader.read_line(&mut line)?;

    if read == 0 || !line.ends_with('\n') {
        return Ok(ReadOutcome::End);
    }

    let next_offset = offset + read as u64;
    let line = line.trim_end_matches('\n');

    let Some((url, depth)) = line.rsplit_once('|') else {
        return Ok(ReadOutcome::Skip(next_offset));
    };

    match (Url::parse(url), depth.parse::<u32>()) {
        (Ok(url), Ok(depth)) => Ok(ReadOutcome::Entry(url, depth, next_offset)),
        _ => Ok(ReadOutcome::Skip(next_offset)),
    }
}

pub fn len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> Domain {
        Domain::from(name.to_string())
    }

    #[test]
    fn append_then_read_in_order() {
        let path = file_path(crate::gen_temp_path(), &domain("a.com"));

        append(&path, &Url::parse("http://a.com/1").unwrap(), 0).unwrap();
        append(&path, &Url::parse("http://a.com/2").unwrap(), 3).unwrap();

        let ReadOutcome::Entry(url, depth, next) = read_at(&path, 0).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(url.as_str(), "http://a.com/1");
        assert_eq!(depth, 0);

        let ReadOutcome::Entry(url, depth, next) = read_at(&path, next).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(url.as_str(), "http://a.com/2");
        assert_eq!(depth, 3);

        assert!(matches!(read_at(&path, next).unwrap(), ReadOutcome::End));
    }

    #[test]
    fn partial_trailing_line_is_not_consumed() {
        let path = file_path(crate::gen_temp_path(), &domain("a.com"));
        append(&path, &Url::parse("http://a.com/1").unwrap(), 0).unwrap();

        // simulate an append cut short mid-line
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"http://a.com/2|").unwrap();
        drop(file);

        let ReadOutcome::Entry(_, _, next) = read_at(&path, 0).unwrap() else {
            panic!("expected entry");
        };
        assert!(matches!(read_at(&path, next).unwrap(), ReadOutcome::End));

        // completing the line makes it readable at the same offset
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"1\n").unwrap();
        drop(file);

        let ReadOutcome::Entry(url, depth, _) = read_at(&path, next).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(url.as_str(), "http://a.com/2");
        assert_eq!(depth, 1);
    }

    #[test]
    fn malformed_line_is_skipped() {
        let path = file_path(crate::gen_temp_path(), &domain("a.com"));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, "not a url at all\nhttp://a.com/ok|2\n").unwrap();

        let ReadOutcome::Skip(next) = read_at(&path, 0).unwrap() else {
            panic!("expected skip");
        };

        let ReadOutcome::Entry(url, _, _) = read_at(&path, next).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(url.as_str(), "http://a.com/ok");
    }

    #[test]
    fn missing_file_reads_as_end() {
        let path = file_path(crate::gen_temp_path(), &domain("nope.com"));
        assert!(matches!(read_at(&path, 0).unwrap(), ReadOutcome::End));
    }

    #[test]
    fn urls_with_pipes_in_query_survive() {
        let path = file_path(crate::gen_temp_path(), &domain("a.com"));
        let url = Url::parse("http://a.com/p?q=a%7Cb").unwrap();

        append(&path, &url, 1).unwrap();

        let ReadOutcome::Entry(read, depth, _) = read_at(&path, 0).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(read, url);
        assert_eq!(depth, 1);
    }
}
