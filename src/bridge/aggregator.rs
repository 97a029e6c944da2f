//! Aggregation of enriched bridges into country and AS statistics

use crate::bridge::error::LookupError;
use crate::bridge::fetcher::persist_atomically;
use crate::bridge::models::{EnrichedBridge, PluggableTransport, ResolutionStatus};
use crate::bridge::parser::ParseFailure;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Default number of entries kept per diagnostic sample
pub const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Bridge count for one country
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryStat {
    pub country_code: String,
    pub country_name: Option<String>,
    pub count: usize,
}

/// Bridge count for one autonomous system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsStat {
    pub asn: u32,
    /// Organization name, last write wins in canonical bridge order
    pub organization: Option<String>,
    pub count: usize,
}

/// A bridge whose lookup failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSample {
    pub endpoint: String,
    pub fingerprint: Option<String>,
    pub error: LookupError,
}

/// Non-fatal failures accumulated during the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub lookup_errors: usize,
    pub lookup_error_samples: Vec<FailureSample>,
    pub parse_failures: usize,
    pub parse_failure_samples: Vec<ParseFailure>,
}

impl FailureSummary {
    pub fn is_empty(&self) -> bool {
        self.lookup_errors == 0 && self.parse_failures == 0
    }
}

/// Bridges the database had no data for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnmappedSummary {
    pub count: usize,
    pub samples: Vec<String>,
}

/// Flattened bridge row for the bridge listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeView {
    pub endpoint: String,
    pub transport: PluggableTransport,
    pub fingerprint: Option<String>,
    pub country_code: String,
    pub country_name: Option<String>,
    pub asn: Option<u32>,
    pub as_org: Option<String>,
}

impl From<&EnrichedBridge> for BridgeView {
    fn from(enriched: &EnrichedBridge) -> Self {
        Self {
            endpoint: enriched.bridge.endpoint(),
            transport: enriched.bridge.transport.clone(),
            fingerprint: enriched.bridge.fingerprint.clone(),
            country_code: enriched.geo.country_code.clone(),
            country_name: enriched.geo.country_name.clone(),
            asn: enriched.geo.asn,
            as_org: enriched.geo.as_org.clone(),
        }
    }
}

/// Full statistics report for one run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub total_bridges: usize,
    pub resolved: usize,
    pub not_found: usize,
    /// Sorted by count descending, then country code
    pub country_stats: Vec<CountryStat>,
    /// Sorted by count descending, then ASN
    pub as_stats: Vec<AsStat>,
    pub transport_stats: BTreeMap<String, usize>,
    pub unmapped: UnmappedSummary,
    pub failure_summary: FailureSummary,
    /// Every analysed bridge in canonical order
    pub bridges: Vec<BridgeView>,
    /// Bridges located in one of the focus countries
    pub focus_country_bridges: Vec<BridgeView>,
    /// Bridges whose AS organization matches one of the keywords
    pub org_keyword_bridges: Vec<BridgeView>,
}

impl Report {
    /// Country code to count
    pub fn country_counts(&self) -> BTreeMap<String, usize> {
        self.country_stats
            .iter()
            .map(|s| (s.country_code.clone(), s.count))
            .collect()
    }

    /// ASN to (organization, count)
    pub fn as_counts(&self) -> BTreeMap<u32, (Option<String>, usize)> {
        self.as_stats
            .iter()
            .map(|s| (s.asn, (s.organization.clone(), s.count)))
            .collect()
    }

    /// Serialize as pretty JSON and replace `path` atomically
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        persist_atomically(path.as_ref(), &bytes)
    }
}

/// Configuration for the aggregator
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Country codes listed in `focus_country_bridges`
    pub focus_countries: Vec<String>,
    /// Case-insensitive substrings matched against AS organizations
    pub org_keywords: Vec<String>,
    /// Entries kept per diagnostic sample
    pub sample_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            focus_countries: vec!["CN".to_string()],
            org_keywords: vec![
                "alibaba".to_string(),
                "tencent".to_string(),
                "huawei".to_string(),
            ],
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

impl AggregatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_focus_countries(mut self, countries: Vec<String>) -> Self {
        self.focus_countries = countries;
        self
    }

    pub fn with_org_keywords(mut self, keywords: Vec<String>) -> Self {
        self.org_keywords = keywords;
        self
    }

    pub fn with_sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit;
        self
    }
}

/// Reduces enriched bridges into a [`Report`]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::with_config(AggregatorConfig::default())
    }

    pub fn with_config(config: AggregatorConfig) -> Self {
        let config = AggregatorConfig {
            focus_countries: config
                .focus_countries
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect(),
            org_keywords: config
                .org_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            ..config
        };
        Self { config }
    }

    /// Build the report
    ///
    /// Bridges are first put in canonical order (by identity, then endpoint)
    /// so the result, including which organization name an ASN ends up with,
    /// does not depend on the order lookups completed in. LookupError entries
    /// are excluded from country and AS counts.
    pub fn aggregate(&self, mut bridges: Vec<EnrichedBridge>, parse_failures: &[ParseFailure]) -> Report {
        bridges.sort_by(|a, b| {
            a.bridge
                .identity()
                .cmp(&b.bridge.identity())
                .then_with(|| a.bridge.address.cmp(&b.bridge.address))
                .then_with(|| a.bridge.port.cmp(&b.bridge.port))
                .then_with(|| a.bridge.transport.cmp(&b.bridge.transport))
        });

        let limit = self.config.sample_limit;
        let mut countries: HashMap<String, CountryStat> = HashMap::new();
        let mut systems: HashMap<u32, AsStat> = HashMap::new();
        let mut transport_stats = BTreeMap::new();
        let mut unmapped = UnmappedSummary::default();
        let mut failures = FailureSummary {
            parse_failures: parse_failures.len(),
            parse_failure_samples: parse_failures.iter().take(limit).cloned().collect(),
            ..FailureSummary::default()
        };
        let mut resolved = 0;
        let mut focus_country_bridges = Vec::new();
        let mut org_keyword_bridges = Vec::new();
        let mut all_bridges = Vec::with_capacity(bridges.len());

        for enriched in &bridges {
            all_bridges.push(BridgeView::from(enriched));
            *transport_stats
                .entry(enriched.bridge.transport.to_string())
                .or_insert(0) += 1;

            match &enriched.status {
                ResolutionStatus::LookupError(error) => {
                    failures.lookup_errors += 1;
                    if failures.lookup_error_samples.len() < limit {
                        failures.lookup_error_samples.push(FailureSample {
                            endpoint: enriched.bridge.endpoint(),
                            fingerprint: enriched.bridge.fingerprint.clone(),
                            error: error.clone(),
                        });
                    }
                    continue;
                }
                ResolutionStatus::NotFound => {
                    unmapped.count += 1;
                    if unmapped.samples.len() < limit {
                        unmapped.samples.push(enriched.bridge.endpoint());
                    }
                }
                ResolutionStatus::Resolved => resolved += 1,
            }

            let geo = &enriched.geo;
            let country = countries
                .entry(geo.country_code.clone())
                .or_insert_with(|| CountryStat {
                    country_code: geo.country_code.clone(),
                    country_name: None,
                    count: 0,
                });
            country.count += 1;
            if geo.country_name.is_some() {
                country.country_name = geo.country_name.clone();
            }

            if let Some(asn) = geo.asn {
                let system = systems.entry(asn).or_insert_with(|| AsStat {
                    asn,
                    organization: None,
                    count: 0,
                });
                system.count += 1;
                if geo.as_org.is_some() {
                    system.organization = geo.as_org.clone();
                }
            }

            if self.is_focus_country(&geo.country_code) {
                focus_country_bridges.push(BridgeView::from(enriched));
            }
            if self.matches_org_keyword(geo.as_org.as_deref()) {
                org_keyword_bridges.push(BridgeView::from(enriched));
            }
        }

        let mut country_stats: Vec<_> = countries.into_values().collect();
        country_stats.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.country_code.cmp(&b.country_code))
        });

        let mut as_stats: Vec<_> = systems.into_values().collect();
        as_stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.asn.cmp(&b.asn)));

        Report {
            generated_at: Utc::now(),
            total_bridges: bridges.len(),
            resolved,
            not_found: unmapped.count,
            country_stats,
            as_stats,
            transport_stats,
            unmapped,
            failure_summary: failures,
            bridges: all_bridges,
            focus_country_bridges,
            org_keyword_bridges,
        }
    }

    fn is_focus_country(&self, country_code: &str) -> bool {
        self.config
            .focus_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country_code))
    }

    fn matches_org_keyword(&self, as_org: Option<&str>) -> bool {
        let Some(org) = as_org else {
            return false;
        };
        let org = org.to_lowercase();
        self.config.org_keywords.iter().any(|k| org.contains(k.as_str()))
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}
