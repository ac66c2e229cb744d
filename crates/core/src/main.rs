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

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

use trawler::config::CrawlConfig;
use trawler::coordinator::CrawlLimits;
use trawler::orchestrator::{Crawler, RunOptions};

const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// File with one seed url per line.
    seed_file: PathBuf,

    /// Operator contact email, appended to the user agent.
    contact_email: String,

    /// YAML configuration file. Without it a single-pod layout is created
    /// under ./trawler-data.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Restore frontier offsets and the seen-set from a previous run.
    #[clap(long)]
    resume: bool,

    /// Only crawl domains present in the seed list.
    #[clap(long)]
    seeded_urls_only: bool,

    /// Stop after this many pages have been crawled.
    #[clap(long)]
    max_pages: Option<u64>,

    /// Stop after this many seconds of wall clock.
    #[clap(long)]
    max_duration: Option<u64>,

    #[clap(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn read_seeds(path: &PathBuf) -> Result<Vec<Url>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read seed file '{}': {e}", path.display()))?;

    let mut seeds = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match Url::parse(line) {
            Ok(url) => seeds.push(url),
            Err(e) => tracing::warn!("skipping unparsable seed '{line}': {e}"),
        }
    }

    Ok(seeds)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(args.log_level))
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(
                    format!("trawler={}", format!("{:?}", args.log_level).to_lowercase())
                        .parse()
                        .unwrap(),
                )
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => match CrawlConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => CrawlConfig::single_pod("trawler-data"),
    };

    if !args.contact_email.contains('@') {
        eprintln!("invalid configuration: contact email '{}'", args.contact_email);
        return ExitCode::from(EXIT_CONFIG);
    }

    let seeds = match read_seeds(&args.seed_file) {
        Ok(seeds) => seeds,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if seeds.is_empty() && !args.resume {
        eprintln!("seed file contains no usable urls");
        return ExitCode::from(EXIT_CONFIG);
    }

    let options = RunOptions {
        contact_email: args.contact_email.clone(),
        resume: args.resume,
        seeded_urls_only: args.seeded_urls_only,
        limits: CrawlLimits {
            max_pages: args.max_pages,
            max_duration: args.max_duration.map(Duration::from_secs),
        },
    };

    let crawler = match Crawler::new(config, options) {
        Ok(crawler) => crawler,
        Err(e) => {
            let code = match e.downcast_ref::<trawler::Error>() {
                Some(trawler::Error::Config(_)) => EXIT_CONFIG,
                _ => EXIT_RUNTIME,
            };
            eprintln!("failed to start: {e}");
            return ExitCode::from(code);
        }
    };

    let outcome = crawler.ingest_seeds(seeds);
    tracing::info!(
        "seed ingest: {} admitted, {} dropped",
        outcome.admitted,
        outcome.dropped
    );

    match crawler.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("crawl failed: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
