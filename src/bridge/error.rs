//! Error taxonomy for the bridge pipeline
//!
//! Fatal errors (network exhaustion, extraction, database load) abort a run and
//! are wrapped in [`PipelineError`] together with the stage that failed.
//! Per-line and per-record errors ([`ParseError`], [`LookupError`]) never
//! abort anything; they are counted into the report's failure summary.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while retrieving a remote resource
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The URL could not be parsed or uses an unsupported scheme
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Likely to succeed on retry (timeout, reset, 5xx, 429)
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    /// Retrying will not help (4xx, oversized payload, undecodable body)
    #[error("permanent failure fetching {url}: {reason}")]
    Permanent { url: String, reason: String },

    /// The payload arrived but could not be stored under its final name
    #[error("failed to store {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled before the fetch could complete
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl NetworkError {
    pub fn transient(url: &str, reason: impl fmt::Display) -> Self {
        Self::Transient {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn permanent(url: &str, reason: impl fmt::Display) -> Self {
        Self::Permanent {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure while unpacking the geo-database archive
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("archive {0:?} is empty")]
    Empty(PathBuf),

    #[error("archive {0:?} is not a gzip-compressed tarball")]
    UnsupportedFormat(PathBuf),

    #[error("archive {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {0:?} contains no geo-database file (.mmdb or .csv)")]
    MissingDatabase(PathBuf),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while building the in-memory index
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to open MaxMind database {path:?}: {reason}")]
    MaxMind { path: PathBuf, reason: String },

    #[error("failed to read network table {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("invalid row {row} in {path:?}: {reason}")]
    InvalidRow {
        path: PathBuf,
        row: u64,
        reason: String,
    },

    #[error("no database file to load")]
    Missing,
}

/// Why a single bridge line was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseError {
    #[error("no address:port field")]
    MissingEndpoint,

    #[error("malformed address:port field `{0}`")]
    MalformedEndpoint(String),

    #[error("`{0}` is not an IP address")]
    InvalidAddress(String),

    #[error("`{0}` is not a valid port")]
    InvalidPort(String),
}

/// Per-record lookup failure, reported instead of raised
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LookupError {
    #[error("`{0}` is not an IP address")]
    InvalidAddress(String),

    #[error("database error: {0}")]
    Backend(String),

    #[error("lookup worker failed: {0}")]
    Worker(String),
}

/// Invalid configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("USE_PROXY is enabled but PROXY_URL is empty")]
    MissingProxyUrl,

    #[error("invalid proxy url {url}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    #[error("MAX_WORKERS must be at least 1")]
    ZeroWorkers,

    #[error("REQUEST_TIMEOUT must be at least 1 second")]
    ZeroTimeout,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Pipeline stage, used to tag fatal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    FetchGeoDatabase,
    ExtractGeoDatabase,
    LoadGeoDatabase,
    FetchBridgeList,
    Resolve,
    WriteReport,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FetchGeoDatabase => "fetch-geo-database",
            Stage::ExtractGeoDatabase => "extract-geo-database",
            Stage::LoadGeoDatabase => "load-geo-database",
            Stage::FetchBridgeList => "fetch-bridge-list",
            Stage::Resolve => "resolve",
            Stage::WriteReport => "write-report",
        };
        f.write_str(name)
    }
}

/// Fatal, stage-identified run failure
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{stage}] {source}")]
    Network {
        stage: Stage,
        #[source]
        source: NetworkError,
    },

    #[error("[extract-geo-database] {0}")]
    Extraction(#[from] ExtractionError),

    #[error("[load-geo-database] {0}")]
    Database(#[from] DatabaseError),

    #[error("[{stage}] {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("[{0}] run cancelled")]
    Cancelled(Stage),
}

impl PipelineError {
    pub fn network(stage: Stage, source: NetworkError) -> Self {
        match source {
            NetworkError::Cancelled { .. } => Self::Cancelled(stage),
            source => Self::Network { stage, source },
        }
    }

    /// The stage at which the run stopped
    pub fn stage(&self) -> Stage {
        match self {
            Self::Network { stage, .. } | Self::Io { stage, .. } | Self::Cancelled(stage) => {
                *stage
            }
            Self::Extraction(_) => Stage::ExtractGeoDatabase,
            Self::Database(_) => Stage::LoadGeoDatabase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_transient_flag() {
        assert!(NetworkError::transient("http://a", "timed out").is_transient());
        assert!(!NetworkError::permanent("http://a", "404").is_transient());
        assert!(!NetworkError::Cancelled {
            url: "http://a".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_pipeline_error_names_stage() {
        let err = PipelineError::network(
            Stage::FetchBridgeList,
            NetworkError::permanent("http://a", "HTTP status: 404"),
        );
        assert_eq!(err.stage(), Stage::FetchBridgeList);
        assert!(err.to_string().starts_with("[fetch-bridge-list]"));

        let err = PipelineError::from(ExtractionError::Empty(PathBuf::from("db.tar.gz")));
        assert_eq!(err.stage(), Stage::ExtractGeoDatabase);
        assert!(err.to_string().starts_with("[extract-geo-database]"));
    }

    #[test]
    fn test_extraction_and_database_errors_display_their_stage() {
        let err = PipelineError::from(ExtractionError::MissingDatabase(PathBuf::from("geo.tar.gz")));
        assert_eq!(
            err.to_string(),
            format!("[{}] {}", Stage::ExtractGeoDatabase, ExtractionError::MissingDatabase(PathBuf::from("geo.tar.gz")))
        );

        let err = PipelineError::from(DatabaseError::Missing);
        assert_eq!(err.stage(), Stage::LoadGeoDatabase);
        assert_eq!(
            err.to_string(),
            format!("[{}] {}", Stage::LoadGeoDatabase, DatabaseError::Missing)
        );
    }

    #[test]
    fn test_cancelled_network_error_maps_to_cancelled_stage() {
        let err = PipelineError::network(
            Stage::FetchGeoDatabase,
            NetworkError::Cancelled {
                url: "http://a".to_string(),
            },
        );
        assert!(matches!(err, PipelineError::Cancelled(Stage::FetchGeoDatabase)));
    }
}
