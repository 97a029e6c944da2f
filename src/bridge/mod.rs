//! Bridge module for parsing, locating and summarizing Tor bridges
//!
//! This module provides functionality for:
//! - Downloading bridge lists and the geo-database archive with retries
//! - Extracting and loading the offline geo-database
//! - Parsing bridge lines from the published list formats
//! - Resolving bridge addresses to country and AS data concurrently
//! - Aggregating the results into per-country and per-AS statistics

pub mod aggregator;
pub mod archive;
pub mod error;
pub mod fetcher;
pub mod geo;
pub mod models;
pub mod parser;
pub mod resolver;

pub use aggregator::{Aggregator, AggregatorConfig, AsStat, CountryStat, FailureSummary, Report};
pub use archive::{ArchiveLoader, ExtractedDatabase};
pub use error::{
    ConfigError, DatabaseError, ExtractionError, LookupError, NetworkError, ParseError,
    PipelineError, Stage,
};
pub use fetcher::{FetchConfig, Fetcher, HttpTransport, Transport};
pub use geo::{GeoIndex, GeoLookup, MaxMindIndex, Network, PrefixIndex};
pub use models::{
    BridgeIdentity, BridgeRecord, EnrichedBridge, GeoRecord, PluggableTransport, ResolutionStatus,
};
pub use parser::{BridgeParser, ParseFailure};
pub use resolver::{ResolveCancelled, Resolver, ResolverConfig};
