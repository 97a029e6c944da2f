//! Command-line and environment configuration
//!
//! Every option can be given as a flag or as an environment variable, and a
//! `.env` file in the working directory is loaded by the binary before
//! parsing. [`Settings`] is the raw parsed form; [`Settings::into_config`]
//! validates it into the immutable [`AnalyzerConfig`] the pipeline runs on.

use crate::bridge::aggregator::AggregatorConfig;
use crate::bridge::error::ConfigError;
use crate::bridge::fetcher::FetchConfig;
use crate::bridge::resolver::{ResolverConfig, DEFAULT_CONCURRENCY};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// GeoLite2 databases fetched when none are configured
pub const DEFAULT_GEO_DB_URLS: &[&str] = &[
    "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-ASN.mmdb",
    "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-Country.mmdb",
];

/// Bridge lists fetched when none are configured
pub const DEFAULT_BRIDGE_URLS: &[&str] = &[
    "https://raw.githubusercontent.com/scriptzteam/Tor-Bridges-Collector/main/bridges-obfs4",
    "https://raw.githubusercontent.com/scriptzteam/Tor-Bridges-Collector/main/bridges-obfs4-ipv6",
    "https://raw.githubusercontent.com/scriptzteam/Tor-Bridges-Collector/main/bridges-vanilla",
    "https://raw.githubusercontent.com/scriptzteam/Tor-Bridges-Collector/main/bridges-webtunnel",
];

/// Logging level for the `--log-level` option
#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    #[value(alias = "warn")]
    Warning,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Locate Tor bridges by country and autonomous system
#[derive(Parser, Debug, Clone)]
#[command(name = "bridge-geo", version)]
#[command(about = "Enrich Tor bridge lists with country and ASN data from an offline geo-database")]
pub struct Settings {
    /// Route every download through PROXY_URL
    #[arg(
        long,
        env = "USE_PROXY",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        default_value_t = false
    )]
    pub use_proxy: bool,

    /// Proxy URL (http, https, socks5, socks5h)
    #[arg(long, env = "PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Number of concurrent lookup workers
    #[arg(long, env = "MAX_WORKERS", default_value_t = DEFAULT_CONCURRENCY)]
    pub max_workers: usize,

    /// Timeout in seconds for each HTTP request
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Retries after the first attempt for transient download failures
    #[arg(long, env = "FETCH_RETRIES", default_value_t = 3)]
    pub fetch_retries: usize,

    /// Geo-database URL: a .tar.gz archive or a bare .mmdb/.csv file
    /// (repeatable, or comma separated in GEO_DB_URL)
    #[arg(long = "geo-db-url", env = "GEO_DB_URL", value_delimiter = ',')]
    pub geo_db_urls: Vec<String>,

    /// Bridge list URL (repeatable, or comma separated in BRIDGE_URLS)
    #[arg(long = "bridge-url", env = "BRIDGE_URLS", value_delimiter = ',')]
    pub bridge_urls: Vec<String>,

    /// Directory for downloads and the extracted database
    #[arg(long, env = "WORK_DIR", default_value = "./data")]
    pub work_dir: PathBuf,

    /// Report output path
    #[arg(short, long, env = "OUTPUT", default_value = "bridge_stats.json")]
    pub output: PathBuf,

    /// Cancel the run after this many seconds
    #[arg(long, env = "RUN_TIMEOUT")]
    pub run_timeout: Option<u64>,

    /// Skip downloads whose destination file already exists
    #[arg(long)]
    pub reuse_downloads: bool,

    /// Country codes listed separately in the report
    #[arg(long = "focus-country", env = "FOCUS_COUNTRIES", value_delimiter = ',', default_value = "CN")]
    pub focus_countries: Vec<String>,

    /// AS organization keywords listed separately in the report
    #[arg(
        long = "org-keyword",
        env = "ORG_KEYWORDS",
        value_delimiter = ',',
        default_value = "alibaba,tencent,huawei"
    )]
    pub org_keywords: Vec<String>,
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub geo_db_urls: Vec<String>,
    pub bridge_urls: Vec<String>,
    pub work_dir: PathBuf,
    pub output: PathBuf,
    pub run_timeout: Option<Duration>,
    pub fetch: FetchConfig,
    pub resolver: ResolverConfig,
    pub aggregator: AggregatorConfig,
}

impl AnalyzerConfig {
    pub fn new(geo_db_urls: Vec<String>, bridge_urls: Vec<String>) -> Self {
        Self {
            geo_db_urls,
            bridge_urls,
            work_dir: PathBuf::from("./data"),
            output: PathBuf::from("bridge_stats.json"),
            run_timeout: None,
            fetch: FetchConfig::default(),
            resolver: ResolverConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Directory downloads are written to
    pub fn downloads_dir(&self) -> PathBuf {
        self.work_dir.join("downloads")
    }

    /// Directory the geo-database is extracted into
    pub fn database_dir(&self) -> PathBuf {
        self.work_dir.join("geo-database")
    }
}

impl Settings {
    /// Validate into an [`AnalyzerConfig`]
    pub fn into_config(self) -> Result<AnalyzerConfig, ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let proxy_url = if self.use_proxy {
            let url = self
                .proxy_url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .ok_or(ConfigError::MissingProxyUrl)?;
            reqwest::Proxy::all(url.as_str()).map_err(|e| ConfigError::InvalidProxyUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            Some(url)
        } else {
            None
        };

        let geo_db_urls = urls_or_default(&self.geo_db_urls, DEFAULT_GEO_DB_URLS);
        let bridge_urls = urls_or_default(&self.bridge_urls, DEFAULT_BRIDGE_URLS);

        let fetch = FetchConfig::new()
            .with_timeout(Duration::from_secs(self.request_timeout))
            .with_proxy(proxy_url)
            .with_max_retries(self.fetch_retries)
            .with_reuse_existing(self.reuse_downloads);

        let aggregator = AggregatorConfig::new()
            .with_focus_countries(self.focus_countries)
            .with_org_keywords(self.org_keywords);

        Ok(AnalyzerConfig {
            geo_db_urls,
            bridge_urls,
            work_dir: self.work_dir,
            output: self.output,
            run_timeout: self.run_timeout.filter(|s| *s > 0).map(Duration::from_secs),
            fetch,
            resolver: ResolverConfig::new().with_concurrency(self.max_workers),
            aggregator,
        })
    }
}

/// Trimmed non-empty URLs, or `defaults` when none remain
fn urls_or_default(urls: &[String], defaults: &[&str]) -> Vec<String> {
    let urls: Vec<String> = urls
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if urls.is_empty() {
        defaults.iter().map(|u| u.to_string()).collect()
    } else {
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["bridge-geo", "--geo-db-url", "https://example.com/geo.tar.gz"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(log::LevelFilter::from(LogLevel::Warning), log::LevelFilter::Warn);
        assert_eq!(log::LevelFilter::from(LogLevel::Debug), log::LevelFilter::Debug);
    }

    #[test]
    fn test_log_level_accepts_aliases_and_case() {
        assert_eq!(parse(&["--log-level", "WARNING"]).log_level, LogLevel::Warning);
        assert_eq!(parse(&["--log-level", "warn"]).log_level, LogLevel::Warning);
        assert_eq!(parse(&["--log-level", "Debug"]).log_level, LogLevel::Debug);
        assert!(Settings::try_parse_from([
            "bridge-geo",
            "--geo-db-url",
            "https://example.com/geo.tar.gz",
            "--log-level",
            "loud"
        ])
        .is_err());
    }

    #[test]
    fn test_bridge_urls_default_when_empty() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.bridge_urls.len(), DEFAULT_BRIDGE_URLS.len());
        assert!(config.fetch.proxy_url.is_none());
    }

    #[test]
    fn test_bridge_urls_repeatable_and_comma_separated() {
        let config = parse(&[
            "--bridge-url",
            "https://a.example/obfs4,https://a.example/vanilla",
            "--bridge-url",
            "https://a.example/webtunnel",
        ])
        .into_config()
        .unwrap();
        assert_eq!(
            config.bridge_urls,
            vec![
                "https://a.example/obfs4",
                "https://a.example/vanilla",
                "https://a.example/webtunnel"
            ]
        );
    }

    #[test]
    fn test_use_proxy_requires_url() {
        let err = parse(&["--use-proxy", "true"]).into_config().unwrap_err();
        assert!(matches!(err, ConfigError::MissingProxyUrl));

        let err = parse(&["--use-proxy", "1", "--proxy-url", "  "])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProxyUrl));
    }

    #[test]
    fn test_proxy_applied_only_when_enabled() {
        let config = parse(&["--use-proxy", "yes", "--proxy-url", "socks5h://127.0.0.1:9050"])
            .into_config()
            .unwrap();
        assert_eq!(config.fetch.proxy_url.as_deref(), Some("socks5h://127.0.0.1:9050"));

        let config = parse(&["--proxy-url", "socks5h://127.0.0.1:9050"])
            .into_config()
            .unwrap();
        assert!(config.fetch.proxy_url.is_none());
    }

    #[test]
    fn test_numeric_validation() {
        assert!(matches!(
            parse(&["--max-workers", "0"]).into_config(),
            Err(ConfigError::ZeroWorkers)
        ));
        assert!(matches!(
            parse(&["--request-timeout", "0"]).into_config(),
            Err(ConfigError::ZeroTimeout)
        ));
    }

    #[test]
    fn test_values_flow_into_component_configs() {
        let config = parse(&[
            "--max-workers",
            "8",
            "--request-timeout",
            "5",
            "--fetch-retries",
            "1",
            "--reuse-downloads",
            "--run-timeout",
            "600",
            "--work-dir",
            "/tmp/bridges",
            "--focus-country",
            "IR,RU",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.resolver.concurrency, 8);
        assert_eq!(config.fetch.timeout, Duration::from_secs(5));
        assert_eq!(config.fetch.max_retries, 1);
        assert!(config.fetch.reuse_existing);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.downloads_dir(), PathBuf::from("/tmp/bridges/downloads"));
        assert_eq!(config.aggregator.focus_countries, vec!["IR", "RU"]);
        assert_eq!(config.aggregator.org_keywords.len(), 3);
    }

    #[test]
    fn test_geo_db_urls_default_to_geolite_files() {
        let config = Settings::try_parse_from(["bridge-geo", "--geo-db-url", ""])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(config.geo_db_urls.len(), DEFAULT_GEO_DB_URLS.len());
        assert!(config.geo_db_urls.iter().all(|u| u.ends_with(".mmdb")));
    }

    #[test]
    fn test_default_bridge_lists_include_ipv6() {
        assert!(DEFAULT_BRIDGE_URLS.iter().any(|u| u.ends_with("bridges-obfs4-ipv6")));
    }

    #[test]
    fn test_geo_db_urls_comma_separated() {
        let config = Settings::try_parse_from([
            "bridge-geo",
            "--geo-db-url",
            "https://a.example/GeoLite2-ASN.mmdb, https://a.example/GeoLite2-Country.mmdb",
        ])
        .unwrap()
        .into_config()
        .unwrap();
        assert_eq!(
            config.geo_db_urls,
            vec![
                "https://a.example/GeoLite2-ASN.mmdb",
                "https://a.example/GeoLite2-Country.mmdb"
            ]
        );
    }
}
