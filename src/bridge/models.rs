//! Bridge data models

use crate::bridge::error::LookupError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

/// Country code used when the database has no country for an address
pub const UNKNOWN_COUNTRY: &str = "unknown";

/// Pluggable transport advertised by a bridge line
///
/// The set is open: any transport name the parser does not recognise is kept
/// verbatim in [`PluggableTransport::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PluggableTransport {
    #[default]
    Vanilla,
    Obfs4,
    Webtunnel,
    Snowflake,
    Meek,
    Other(String),
}

impl PluggableTransport {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "vanilla" => PluggableTransport::Vanilla,
            "obfs4" => PluggableTransport::Obfs4,
            "webtunnel" => PluggableTransport::Webtunnel,
            "snowflake" => PluggableTransport::Snowflake,
            "meek" | "meek_lite" => PluggableTransport::Meek,
            other => PluggableTransport::Other(other.to_string()),
        }
    }

    /// Transport implied by a bridge list's name or URL, e.g.
    /// `bridges-snowflake-ipv4` or `.../bridges-obfs4-ipv6`
    pub fn from_list_name(name: &str) -> Self {
        let file_name = name
            .rsplit('/')
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();
        if file_name.contains("snowflake") {
            PluggableTransport::Snowflake
        } else if file_name.contains("webtunnel") {
            PluggableTransport::Webtunnel
        } else if file_name.contains("obfs4") {
            PluggableTransport::Obfs4
        } else if file_name.contains("meek") {
            PluggableTransport::Meek
        } else {
            PluggableTransport::Vanilla
        }
    }
}

impl fmt::Display for PluggableTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluggableTransport::Vanilla => write!(f, "vanilla"),
            PluggableTransport::Obfs4 => write!(f, "obfs4"),
            PluggableTransport::Webtunnel => write!(f, "webtunnel"),
            PluggableTransport::Snowflake => write!(f, "snowflake"),
            PluggableTransport::Meek => write!(f, "meek"),
            PluggableTransport::Other(name) => write!(f, "{}", name),
        }
    }
}

impl Serialize for PluggableTransport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity used to collapse duplicate bridge lines
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BridgeIdentity {
    Fingerprint(String),
    Endpoint(IpAddr, u16),
}

/// A single parsed bridge descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeRecord {
    pub address: IpAddr,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub transport: PluggableTransport,
    /// The descriptor line as it appeared in the list
    #[serde(skip)]
    pub raw: String,
}

impl BridgeRecord {
    pub fn new(address: IpAddr, port: u16, transport: PluggableTransport) -> Self {
        Self {
            address,
            port,
            fingerprint: None,
            transport,
            raw: String::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Fingerprint when present, otherwise the address/port pair
    pub fn identity(&self) -> BridgeIdentity {
        match &self.fingerprint {
            Some(fp) => BridgeIdentity::Fingerprint(fp.clone()),
            None => BridgeIdentity::Endpoint(self.address, self.port),
        }
    }

    /// Get the endpoint in ADDRESS:PORT form, bracketing IPv6
    pub fn endpoint(&self) -> String {
        match self.address {
            IpAddr::V4(v4) => format!("{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, self.port),
        }
    }
}

impl fmt::Display for BridgeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.endpoint())?;
        if let Some(fp) = &self.fingerprint {
            write!(f, " {}", fp)?;
        }
        Ok(())
    }
}

/// Geolocation and network-ownership data for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoRecord {
    /// ISO 3166-1 alpha-2 country code, or [`UNKNOWN_COUNTRY`]
    pub country_code: String,
    /// Country name in English
    pub country_name: Option<String>,
    pub asn: Option<u32>,
    pub as_org: Option<String>,
}

impl Default for GeoRecord {
    fn default() -> Self {
        Self::unknown()
    }
}

impl GeoRecord {
    pub fn unknown() -> Self {
        Self {
            country_code: UNKNOWN_COUNTRY.to_string(),
            country_name: None,
            asn: None,
            as_org: None,
        }
    }

    pub fn with_country(country_code: impl Into<String>, country_name: Option<String>) -> Self {
        Self {
            country_code: country_code.into(),
            country_name,
            ..Self::unknown()
        }
    }

    pub fn with_asn(mut self, asn: u32, as_org: Option<String>) -> Self {
        self.asn = Some(asn);
        self.as_org = as_org;
        self
    }

    pub fn has_country(&self) -> bool {
        self.country_code != UNKNOWN_COUNTRY
    }

    /// Neither country nor ASN is known
    pub fn is_empty(&self) -> bool {
        !self.has_country() && self.asn.is_none()
    }
}

/// Outcome of resolving one bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    NotFound,
    LookupError(LookupError),
}

/// A bridge with its geo data attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedBridge {
    pub bridge: BridgeRecord,
    pub geo: GeoRecord,
    pub status: ResolutionStatus,
}

impl EnrichedBridge {
    pub fn resolved(bridge: BridgeRecord, geo: GeoRecord) -> Self {
        Self {
            bridge,
            geo,
            status: ResolutionStatus::Resolved,
        }
    }

    pub fn not_found(bridge: BridgeRecord) -> Self {
        Self {
            bridge,
            geo: GeoRecord::unknown(),
            status: ResolutionStatus::NotFound,
        }
    }

    pub fn lookup_error(bridge: BridgeRecord, error: LookupError) -> Self {
        Self {
            bridge,
            geo: GeoRecord::unknown(),
            status: ResolutionStatus::LookupError(error),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, ResolutionStatus::Resolved)
    }

    pub fn is_lookup_error(&self) -> bool {
        matches!(self.status, ResolutionStatus::LookupError(_))
    }
}
