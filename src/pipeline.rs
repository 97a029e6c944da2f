//! End-to-end run: fetch, extract, load, parse, resolve, aggregate, report

use crate::bridge::aggregator::{Aggregator, Report};
use crate::bridge::archive::{ArchiveLoader, ExtractedDatabase};
use crate::bridge::error::{PipelineError, Stage};
use crate::bridge::fetcher::{Fetcher, Transport};
use crate::bridge::geo::GeoIndex;
use crate::bridge::models::{BridgeRecord, PluggableTransport};
use crate::bridge::parser::{BridgeParser, ParseFailure};
use crate::bridge::resolver::Resolver;
use crate::config::AnalyzerConfig;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fallback file name for a downloaded geo-database archive
const GEO_ARCHIVE_NAME: &str = "geo-database.tar.gz";

fn join_error(stage: Stage, e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Io {
        stage,
        source: std::io::Error::other(e),
    }
}

/// One analysis run over a configured set of sources
pub struct Pipeline<T> {
    config: AnalyzerConfig,
    fetcher: Fetcher<T>,
    cancel: CancellationToken,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(config: AnalyzerConfig, transport: T, cancel: CancellationToken) -> Self {
        let fetcher = Fetcher::new(config.fetch.clone(), transport, cancel.clone());
        Self {
            config,
            fetcher,
            cancel,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Run every stage and write the report
    ///
    /// Any fatal error aborts the run with the stage it happened in. A
    /// cancelled run never writes a report.
    pub async fn run(&self) -> Result<Report, PipelineError> {
        let index = self.load_geo_index().await?;
        let (bridges, parse_failures) = self.load_bridges().await?;

        let resolver = Resolver::with_config(self.config.resolver.clone(), self.cancel.clone());
        let enriched = resolver
            .resolve_all(bridges, index)
            .await
            .map_err(|_| PipelineError::Cancelled(Stage::Resolve))?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(Stage::Resolve));
        }

        let report = Aggregator::with_config(self.config.aggregator.clone())
            .aggregate(enriched, &parse_failures);
        self.write_report(&report).await?;

        log::info!(
            "Report written to {}: {} bridges, {} countries, {} autonomous systems",
            self.config.output.display(),
            report.total_bridges,
            report.country_stats.len(),
            report.as_stats.len()
        );
        Ok(report)
    }

    /// Fetch, extract and load the geo-database
    ///
    /// Downloads that fail to extract are fetched once more, bypassing any
    /// reused file, and extracted again before giving up.
    async fn load_geo_index(&self) -> Result<Arc<GeoIndex>, PipelineError> {
        let downloads = self.config.downloads_dir();
        let database_dir = self.config.database_dir();
        let sources: Vec<(&str, PathBuf)> = self
            .config
            .geo_db_urls
            .iter()
            .enumerate()
            .map(|(i, url)| (url.as_str(), downloads.join(geo_download_name(i, url))))
            .collect();
        let paths: Vec<PathBuf> = sources.iter().map(|(_, path)| path.clone()).collect();

        for (url, path) in &sources {
            self.fetcher
                .fetch(url, path)
                .await
                .map_err(|e| PipelineError::network(Stage::FetchGeoDatabase, e))?;
        }

        let database = match extract(paths.clone(), database_dir.clone()).await {
            Err(PipelineError::Extraction(e)) => {
                log::warn!("Geo-database extraction failed: {}, downloading again", e);
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled(Stage::ExtractGeoDatabase));
                }
                for (url, path) in &sources {
                    self.fetcher
                        .fetch_fresh(url, path)
                        .await
                        .map_err(|e| PipelineError::network(Stage::FetchGeoDatabase, e))?;
                }
                extract(paths, database_dir).await?
            }
            other => other?,
        };

        let index = tokio::task::spawn_blocking(move || GeoIndex::load(&database))
            .await
            .map_err(|e| join_error(Stage::LoadGeoDatabase, e))??;
        log::info!("Geo-database loaded");

        Ok(Arc::new(index))
    }

    /// Fetch and parse every bridge list
    ///
    /// Each list is parsed on its own, so failure line numbers refer to that
    /// list, with the transport implied by the list name for lines that name
    /// none. Bridges repeated across lists are kept once.
    async fn load_bridges(&self) -> Result<(Vec<BridgeRecord>, Vec<ParseFailure>), PipelineError> {
        let downloads = self.config.downloads_dir();
        let mut seen = HashSet::new();
        let mut bridges = Vec::new();
        let mut failures = Vec::new();
        let mut duplicates = 0;

        for (i, url) in self.config.bridge_urls.iter().enumerate() {
            let destination = downloads.join(format!("bridges-{}.txt", i));
            self.fetcher
                .fetch(url, &destination)
                .await
                .map_err(|e| PipelineError::network(Stage::FetchBridgeList, e))?;

            let bytes = tokio::fs::read(&destination)
                .await
                .map_err(|source| PipelineError::Io {
                    stage: Stage::FetchBridgeList,
                    source,
                })?;
            let content = String::from_utf8_lossy(&bytes);

            let mut lines =
                BridgeParser::parse_list(&content, PluggableTransport::from_list_name(url));
            let before = bridges.len();
            for record in lines.by_ref() {
                if seen.insert(record.identity()) {
                    bridges.push(record);
                } else {
                    duplicates += 1;
                }
            }
            duplicates += lines.duplicates();
            let list_failures = lines.into_failures();
            log::info!(
                "Parsed {} new bridges from {} ({} unparseable lines)",
                bridges.len() - before,
                url,
                list_failures.len()
            );
            failures.extend(list_failures.into_iter().map(|mut failure| {
                failure.source = Some(url.clone());
                failure
            }));
        }

        log::info!(
            "Parsed {} bridges from {} lists ({} duplicates, {} unparseable lines)",
            bridges.len(),
            self.config.bridge_urls.len(),
            duplicates,
            failures.len()
        );
        if bridges.is_empty() {
            log::warn!("No bridges found in the configured lists");
        }

        Ok((bridges, failures))
    }

    async fn write_report(&self, report: &Report) -> Result<(), PipelineError> {
        let report = report.clone();
        let output = self.config.output.clone();
        tokio::task::spawn_blocking(move || report.write_json(output))
            .await
            .map_err(|e| join_error(Stage::WriteReport, e))?
            .map_err(|source| PipelineError::Io {
                stage: Stage::WriteReport,
                source,
            })
    }
}

/// Local file name for the `index`th geo-database download
///
/// Keeps the URL's file name when it shows the format (`.mmdb`, `.csv`,
/// `.tar.gz`, `.tgz`), so bare database files are recognised after download.
fn geo_download_name(index: usize, url: &str) -> String {
    let file_name = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            [".mmdb", ".csv", ".tar.gz", ".tgz"].iter().any(|ext| lower.ends_with(ext))
        });
    match file_name {
        Some(name) => format!("geo-{}-{}", index, name),
        None => format!("geo-{}-{}", index, GEO_ARCHIVE_NAME),
    }
}

async fn extract(sources: Vec<PathBuf>, output_dir: PathBuf) -> Result<ExtractedDatabase, PipelineError> {
    let database = tokio::task::spawn_blocking(move || ArchiveLoader::extract_all(&sources, &output_dir))
        .await
        .map_err(|e| join_error(Stage::ExtractGeoDatabase, e))??;
    Ok(database)
}
