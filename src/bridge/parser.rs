//! Bridge list parser
//!
//! Each non-empty, non-comment line is a whitespace separated descriptor:
//!
//! ```text
//! [Bridge] [transport] address:port [fingerprint] [key=value ...]
//! ```
//!
//! Supported shapes include:
//! - `1.2.3.4:9001 4C0FF...` (vanilla)
//! - `obfs4 1.2.3.4:443 4C0FF... cert=... iat-mode=0`
//! - `webtunnel [2001:db8::1]:443 4C0FF... url=https://... ver=0.0.1`
//! - `1.2.3.4:443 fp=4C0FF...`
//! - `192.0.2.3` or `2001:db8::5` alone on a line (snowflake lists), which
//!   gets [`DEFAULT_BARE_PORT`]

use crate::bridge::error::ParseError;
use crate::bridge::models::{BridgeIdentity, BridgeRecord, PluggableTransport};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::iter::Enumerate;
use std::net::IpAddr;
use std::str::Lines;

/// `address:port` with the IPv6 form bracketed
static ENDPOINT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[(?P<v6>[^\]]+)\]|(?P<host>[^:\[\]]+)):(?P<port>[^:]+)$")
        .expect("Invalid endpoint regex")
});

/// Transport names: `obfs4`, `meek_lite`, `snowflake`, ...
static TRANSPORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("Invalid transport regex"));

/// Port assigned to lines that carry only an address
pub const DEFAULT_BARE_PORT: u16 = 443;

/// A rejected line, kept for the failure summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseFailure {
    /// List the line came from, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 1-based line number within its list
    pub line_number: usize,
    pub line: String,
    pub error: ParseError,
}

/// Bridge list parser
pub struct BridgeParser;

impl BridgeParser {
    /// Parse a single bridge line
    ///
    /// Returns `Ok(None)` for blank lines and `#` comments.
    pub fn parse_line(line: &str) -> Result<Option<BridgeRecord>, ParseError> {
        Self::parse_line_as(line, &PluggableTransport::Vanilla)
    }

    /// Parse a single bridge line, using `default_transport` when the line
    /// names none
    pub fn parse_line_as(
        line: &str,
        default_transport: &PluggableTransport,
    ) -> Result<Option<BridgeRecord>, ParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut tokens = line.split_whitespace().peekable();

        // torrc style `Bridge obfs4 ...`
        if tokens
            .peek()
            .is_some_and(|t| t.eq_ignore_ascii_case("bridge"))
        {
            tokens.next();
        }

        let first = tokens.next().ok_or(ParseError::MissingEndpoint)?;

        if tokens.peek().is_none() {
            if let Ok(address) = first.parse::<IpAddr>() {
                return Ok(Some(
                    BridgeRecord::new(address, DEFAULT_BARE_PORT, default_transport.clone())
                        .with_raw(line),
                ));
            }
        }

        let (transport, endpoint) = if ENDPOINT_REGEX.is_match(first) {
            (default_transport.clone(), first)
        } else if TRANSPORT_REGEX.is_match(first) {
            let endpoint = tokens.next().ok_or(ParseError::MissingEndpoint)?;
            (PluggableTransport::from_name(first), endpoint)
        } else {
            return Err(ParseError::MalformedEndpoint(first.to_string()));
        };

        let (address, port) = Self::parse_endpoint(endpoint)?;
        let mut record = BridgeRecord::new(address, port, transport).with_raw(line);

        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) => {
                    let key = key.to_ascii_lowercase();
                    if (key == "fp" || key == "fingerprint") && !value.is_empty() {
                        record.fingerprint = Some(value.to_string());
                    }
                }
                None => {
                    if record.fingerprint.is_none() {
                        record.fingerprint = Some(token.to_string());
                    }
                }
            }
        }

        Ok(Some(record))
    }

    /// Parse `address:port` or `[v6]:port`
    fn parse_endpoint(token: &str) -> Result<(IpAddr, u16), ParseError> {
        let caps = ENDPOINT_REGEX
            .captures(token)
            .ok_or_else(|| ParseError::MalformedEndpoint(token.to_string()))?;

        let host = caps
            .name("v6")
            .or_else(|| caps.name("host"))
            .map(|m| m.as_str())
            .ok_or_else(|| ParseError::MalformedEndpoint(token.to_string()))?;
        let address: IpAddr = host
            .parse()
            .map_err(|_| ParseError::InvalidAddress(host.to_string()))?;

        let port_str = &caps["port"];
        let port: u16 = port_str
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ParseError::InvalidPort(port_str.to_string()))?;

        Ok((address, port))
    }

    /// Parse a whole bridge list lazily
    ///
    /// The returned iterator yields each unique bridge once, in order of first
    /// appearance. Rejected lines are collected on the iterator and can be read
    /// back with [`BridgeLines::failures`] once iteration is done.
    pub fn parse(content: &str) -> BridgeLines<'_> {
        Self::parse_list(content, PluggableTransport::Vanilla)
    }

    /// Like [`BridgeParser::parse`], with the transport assumed for lines
    /// that name none (see [`PluggableTransport::from_list_name`])
    pub fn parse_list(content: &str, default_transport: PluggableTransport) -> BridgeLines<'_> {
        BridgeLines {
            lines: content.lines().enumerate(),
            default_transport,
            seen: HashSet::new(),
            failures: Vec::new(),
            duplicates: 0,
        }
    }

    /// Parse a whole bridge list eagerly
    pub fn parse_string(content: &str) -> (Vec<BridgeRecord>, Vec<ParseFailure>) {
        let mut lines = Self::parse(content);
        let records: Vec<_> = lines.by_ref().collect();
        (records, lines.into_failures())
    }
}

/// Single-pass iterator over the unique bridges of a list
pub struct BridgeLines<'a> {
    lines: Enumerate<Lines<'a>>,
    default_transport: PluggableTransport,
    seen: HashSet<BridgeIdentity>,
    failures: Vec<ParseFailure>,
    duplicates: usize,
}

impl BridgeLines<'_> {
    /// Lines rejected so far
    pub fn failures(&self) -> &[ParseFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<ParseFailure> {
        self.failures
    }

    /// Lines collapsed into an earlier bridge with the same identity
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

impl Iterator for BridgeLines<'_> {
    type Item = BridgeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, line) in self.lines.by_ref() {
            match BridgeParser::parse_line_as(line, &self.default_transport) {
                Ok(Some(record)) => {
                    if self.seen.insert(record.identity()) {
                        return Some(record);
                    }
                    self.duplicates += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    log::debug!("Skipping bridge line {}: {}", index + 1, error);
                    self.failures.push(ParseFailure {
                        source: None,
                        line_number: index + 1,
                        line: line.trim().to_string(),
                        error,
                    });
                }
            }
        }
        None
    }
}
