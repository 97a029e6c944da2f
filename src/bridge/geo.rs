//! Geo-database index for resolving bridge addresses
//!
//! Two backends sit behind [`GeoLookup`]:
//! - [`MaxMindIndex`]: GeoLite2 Country/City and ASN `.mmdb` files
//! - [`PrefixIndex`]: a CSV network table held in per-prefix-length maps
//!
//! Both are immutable once loaded and are shared across resolver workers.

use crate::bridge::archive::ExtractedDatabase;
use crate::bridge::error::{DatabaseError, LookupError};
use crate::bridge::models::GeoRecord;
use maxminddb::{geoip2, Reader};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

/// Read-only address lookup shared by resolver workers
pub trait GeoLookup: Send + Sync {
    /// Look up an address. `Ok(None)` means no range covers it.
    fn lookup_ip(&self, ip: IpAddr) -> Result<Option<GeoRecord>, LookupError>;

    /// Look up an address given in textual form
    fn resolve(&self, ip: &str) -> Result<Option<GeoRecord>, LookupError> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LookupError::InvalidAddress(ip.to_string()))?;
        self.lookup_ip(ip)
    }
}

/// GeoIndex over whichever database format the archive shipped
pub enum GeoIndex {
    MaxMind(MaxMindIndex),
    Prefix(PrefixIndex),
}

impl GeoIndex {
    /// Build the index from extracted database files
    pub fn load(database: &ExtractedDatabase) -> Result<Self, DatabaseError> {
        match database {
            ExtractedDatabase::MaxMind { country, asn } => Ok(GeoIndex::MaxMind(
                MaxMindIndex::open(country.as_deref(), asn.as_deref())?,
            )),
            ExtractedDatabase::PrefixTable(path) => {
                Ok(GeoIndex::Prefix(PrefixIndex::from_csv_path(path)?))
            }
        }
    }
}

impl GeoLookup for GeoIndex {
    fn lookup_ip(&self, ip: IpAddr) -> Result<Option<GeoRecord>, LookupError> {
        match self {
            GeoIndex::MaxMind(index) => index.lookup_ip(ip),
            GeoIndex::Prefix(index) => index.lookup_ip(ip),
        }
    }
}

/// Lookup against MaxMind GeoLite2 databases
pub struct MaxMindIndex {
    country: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl MaxMindIndex {
    /// Open the country (or city) and ASN databases; at least one is required
    pub fn open(country: Option<&Path>, asn: Option<&Path>) -> Result<Self, DatabaseError> {
        if country.is_none() && asn.is_none() {
            return Err(DatabaseError::Missing);
        }

        let country = country.map(Self::open_reader).transpose()?;
        let asn = asn.map(Self::open_reader).transpose()?;

        if country.is_none() {
            log::warn!("No country database loaded, country lookups will be skipped");
        }
        if asn.is_none() {
            log::warn!("No ASN database loaded, ASN lookups will be skipped");
        }

        Ok(Self { country, asn })
    }

    fn open_reader(path: &Path) -> Result<Reader<Vec<u8>>, DatabaseError> {
        let reader = Reader::open_readfile(path).map_err(|e| DatabaseError::MaxMind {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        log::info!("Opened MaxMind database: {}", path.display());
        Ok(reader)
    }
}

impl GeoLookup for MaxMindIndex {
    fn lookup_ip(&self, ip: IpAddr) -> Result<Option<GeoRecord>, LookupError> {
        let mut geo = GeoRecord::unknown();

        if let Some(reader) = &self.country {
            let lookup_result = reader.lookup(ip).map_err(backend_error)?;
            // City databases decode as Country too
            let country: Option<geoip2::Country> = lookup_result.decode().map_err(backend_error)?;
            if let Some(country) = country {
                if let Some(code) = country.country.iso_code {
                    geo.country_code = code.to_string();
                }
                geo.country_name = country.country.names.english.map(String::from);
            }
        }

        if let Some(reader) = &self.asn {
            let lookup_result = reader.lookup(ip).map_err(backend_error)?;
            let asn: Option<geoip2::Asn> = lookup_result.decode().map_err(backend_error)?;
            if let Some(asn) = asn {
                geo.asn = asn.autonomous_system_number;
                geo.as_org = asn.autonomous_system_organization.map(String::from);
            }
        }

        Ok((!geo.is_empty()).then_some(geo))
    }
}

fn backend_error<E: fmt::Display>(e: E) -> LookupError {
    LookupError::Backend(e.to_string())
}

/// An IP network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length in `{}`", s))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid network address in `{}`", s))?;
        let prefix = prefix.unwrap_or(match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        });
        Network::new(addr, prefix).ok_or_else(|| format!("prefix length out of range in `{}`", s))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// One row of the CSV network table
#[derive(Debug, Deserialize)]
struct NetworkRow {
    network: String,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    asn: Option<u32>,
    #[serde(default)]
    as_org: Option<String>,
}

/// Longest-prefix-match table
///
/// Ranges are bucketed by prefix length; a lookup searches from the most
/// specific populated length down. Inserting a network that is already
/// present replaces the earlier entry.
#[derive(Debug, Default)]
pub struct PrefixIndex {
    v4: HashMap<u8, HashMap<u32, GeoRecord>>,
    v6: HashMap<u8, HashMap<u128, GeoRecord>>,
    v4_lengths: Vec<u8>,
    v6_lengths: Vec<u8>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(network, record)` pairs, later pairs winning ties
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Network, GeoRecord)>,
    {
        let mut index = Self::new();
        for (network, record) in entries {
            index.insert(network, record);
        }
        index
    }

    pub fn insert(&mut self, network: Network, record: GeoRecord) {
        match network.addr {
            IpAddr::V4(addr) => {
                let key = u32::from(addr) & mask_v4(network.prefix);
                self.v4.entry(network.prefix).or_default().insert(key, record);
                insert_length(&mut self.v4_lengths, network.prefix);
            }
            IpAddr::V6(addr) => {
                let key = u128::from(addr) & mask_v6(network.prefix);
                self.v6.entry(network.prefix).or_default().insert(key, record);
                insert_length(&mut self.v6_lengths, network.prefix);
            }
        }
    }

    /// Number of distinct networks held
    pub fn len(&self) -> usize {
        self.v4.values().map(HashMap::len).sum::<usize>()
            + self.v6.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a CSV table with header `network,country_code,country_name,asn,as_org`
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let csv_error = |source| DatabaseError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;

        let mut index = Self::new();
        for (row_number, row) in reader.deserialize::<NetworkRow>().enumerate() {
            let row = row.map_err(csv_error)?;
            let network: Network = row.network.parse().map_err(|reason| DatabaseError::InvalidRow {
                path: path.to_path_buf(),
                row: row_number as u64 + 1,
                reason,
            })?;

            let mut record = match row.country_code.filter(|c| !c.is_empty()) {
                Some(code) => GeoRecord::with_country(code, row.country_name.filter(|n| !n.is_empty())),
                None => GeoRecord::unknown(),
            };
            if let Some(asn) = row.asn {
                record = record.with_asn(asn, row.as_org.filter(|o| !o.is_empty()));
            }
            index.insert(network, record);
        }

        log::info!(
            "Loaded network table {} ({} networks)",
            path.display(),
            index.len()
        );
        Ok(index)
    }

    fn lookup_v4(&self, addr: Ipv4Addr) -> Option<&GeoRecord> {
        let bits = u32::from(addr);
        self.v4_lengths.iter().find_map(|prefix| {
            self.v4
                .get(prefix)
                .and_then(|table| table.get(&(bits & mask_v4(*prefix))))
        })
    }

    fn lookup_v6(&self, addr: Ipv6Addr) -> Option<&GeoRecord> {
        let bits = u128::from(addr);
        self.v6_lengths.iter().find_map(|prefix| {
            self.v6
                .get(prefix)
                .and_then(|table| table.get(&(bits & mask_v6(*prefix))))
        })
    }
}

/// Keep lengths sorted most-specific first
fn insert_length(lengths: &mut Vec<u8>, prefix: u8) {
    if let Err(pos) = lengths.binary_search_by(|len| prefix.cmp(len)) {
        lengths.insert(pos, prefix);
    }
}

impl GeoLookup for PrefixIndex {
    fn lookup_ip(&self, ip: IpAddr) -> Result<Option<GeoRecord>, LookupError> {
        let found = match ip.to_canonical() {
            IpAddr::V4(addr) => self.lookup_v4(addr),
            IpAddr::V6(addr) => self.lookup_v6(addr),
        };
        Ok(found.filter(|geo| !geo.is_empty()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn net(s: &str) -> Network {
        s.parse().unwrap()
    }

    fn geo(country: &str, asn: u32, org: &str) -> GeoRecord {
        GeoRecord::with_country(country, None).with_asn(asn, Some(org.to_string()))
    }

    fn sample_index() -> PrefixIndex {
        PrefixIndex::from_entries([
            (net("1.0.0.0/8"), geo("AU", 13335, "Cloudflare")),
            (net("1.2.0.0/16"), geo("JP", 2497, "IIJ")),
            (net("1.2.3.0/24"), geo("CN", 4134, "Chinanet")),
            (net("2001:db8::/32"), geo("DE", 3320, "Deutsche Telekom")),
            (net("2001:db8:1::/48"), geo("NL", 1136, "KPN")),
        ])
    }

    #[test]
    fn test_network_parse() {
        assert_eq!(net("10.0.0.0/8").prefix(), 8);
        assert_eq!(net("10.0.0.1").prefix(), 32);
        assert_eq!(net("2001:db8::/32").to_string(), "2001:db8::/32");
        assert!("10.0.0.0/33".parse::<Network>().is_err());
        assert!("not-a-network/8".parse::<Network>().is_err());
        assert!("10.0.0.0/x".parse::<Network>().is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let index = sample_index();

        let hit = index.resolve("1.2.3.4").unwrap().unwrap();
        assert_eq!(hit.country_code, "CN");
        assert_eq!(hit.asn, Some(4134));
        assert_eq!(hit.as_org.as_deref(), Some("Chinanet"));

        let hit = index.resolve("1.2.200.1").unwrap().unwrap();
        assert_eq!(hit.country_code, "JP");

        let hit = index.resolve("1.99.0.1").unwrap().unwrap();
        assert_eq!(hit.country_code, "AU");
    }

    #[test]
    fn test_ipv6_longest_prefix() {
        let index = sample_index();
        assert_eq!(index.resolve("2001:db8:1::5").unwrap().unwrap().country_code, "NL");
        assert_eq!(index.resolve("2001:db8:2::5").unwrap().unwrap().country_code, "DE");
    }

    #[test]
    fn test_ipv4_mapped_ipv6_uses_ipv4_table() {
        let index = sample_index();
        let hit = index.resolve("::ffff:1.2.3.4").unwrap().unwrap();
        assert_eq!(hit.country_code, "CN");
    }

    #[test]
    fn test_uncovered_address_is_not_found() {
        let index = sample_index();
        assert_eq!(index.resolve("9.9.9.9"), Ok(None));
        assert_eq!(index.resolve("2a00::1"), Ok(None));
    }

    #[test]
    fn test_malformed_address_is_lookup_error() {
        let index = sample_index();
        assert_eq!(
            index.resolve("not-an-ip"),
            Err(LookupError::InvalidAddress("not-an-ip".to_string()))
        );
        assert!(index.resolve("1.2.3").is_err());
    }

    #[test]
    fn test_equal_specificity_later_entry_wins() {
        let index = PrefixIndex::from_entries([
            (net("5.5.5.0/24"), geo("FR", 1, "first")),
            (net("5.5.5.0/24"), geo("IT", 2, "second")),
        ]);
        assert_eq!(index.len(), 1);
        let hit = index.resolve("5.5.5.5").unwrap().unwrap();
        assert_eq!(hit.country_code, "IT");
        assert_eq!(hit.as_org.as_deref(), Some("second"));
    }

    #[test]
    fn test_host_bits_are_masked_on_insert() {
        let index = PrefixIndex::from_entries([(net("7.7.7.99/24"), geo("SE", 3301, "Telia"))]);
        assert_eq!(index.resolve("7.7.7.1").unwrap().unwrap().country_code, "SE");
    }

    #[test]
    fn test_default_route_covers_everything() {
        let index = PrefixIndex::from_entries([(net("0.0.0.0/0"), geo("ZZ", 1, "any"))]);
        assert_eq!(index.resolve("203.0.113.1").unwrap().unwrap().country_code, "ZZ");
    }

    #[test]
    fn test_load_csv_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network,country_code,country_name,asn,as_org").unwrap();
        writeln!(file, "1.2.3.0/24,CN,China,4134,Chinanet").unwrap();
        writeln!(file, "8.8.8.0/24,US,United States,15169,Google LLC").unwrap();
        writeln!(file, "10.0.0.0/8,,,64512,Private").unwrap();
        file.flush().unwrap();

        let index = PrefixIndex::from_csv_path(file.path()).unwrap();
        assert_eq!(index.len(), 3);

        let hit = index.resolve("1.2.3.4").unwrap().unwrap();
        assert_eq!(hit.country_name.as_deref(), Some("China"));

        let hit = index.resolve("10.1.1.1").unwrap().unwrap();
        assert_eq!(hit.country_code, crate::bridge::models::UNKNOWN_COUNTRY);
        assert_eq!(hit.asn, Some(64512));
    }

    #[test]
    fn test_load_csv_rejects_bad_network() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network,country_code,country_name,asn,as_org").unwrap();
        writeln!(file, "1.2.3.0/40,CN,China,4134,Chinanet").unwrap();
        file.flush().unwrap();

        let result = PrefixIndex::from_csv_path(file.path());
        assert!(matches!(result, Err(DatabaseError::InvalidRow { .. })));
    }

    #[test]
    fn test_maxmind_open_requires_a_database() {
        assert!(matches!(MaxMindIndex::open(None, None), Err(DatabaseError::Missing)));
    }

    #[test]
    fn test_maxmind_open_rejects_garbage_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an mmdb file").unwrap();
        file.flush().unwrap();

        let result = MaxMindIndex::open(Some(file.path()), None);
        assert!(matches!(result, Err(DatabaseError::MaxMind { .. })));
    }
}
