// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - VLESS credential parser
// Decodes a vless:// share link into validated connection parameters

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};

/// URL scheme accepted by the parser
pub const SCHEME: &str = "vless";

/// Port used when the link does not carry one
pub const DEFAULT_PORT: u16 = 443;

const DEFAULT_SECURITY: &str = "reality";
const DEFAULT_FINGERPRINT: &str = "chrome";
const DEFAULT_TRANSPORT: &str = "tcp";
const DEFAULT_SPX: &str = "/";

/// Transport security mode requested by the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    /// TLS with a REALITY sub-block (public key + short id)
    Reality,
    /// Plain TLS
    Tls,
    /// No transport security
    None,
    /// Unrecognised mode, kept verbatim and treated as TLS
    Other(String),
}

impl Security {
    pub fn as_str(&self) -> &str {
        match self {
            Security::Reality => "reality",
            Security::Tls => "tls",
            Security::None => "none",
            Security::Other(mode) => mode,
        }
    }

    /// Whether the outbound needs a TLS block at all
    pub fn uses_tls(&self) -> bool {
        !matches!(self, Security::None)
    }
}

impl From<&str> for Security {
    fn from(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "reality" => Security::Reality,
            "tls" => Security::Tls,
            "none" => Security::None,
            _ => Security::Other(mode.to_string()),
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to reach the remote endpoint, as decoded from one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// User identity (the part before '@')
    pub uuid: String,
    /// Server hostname or IP address
    pub server: String,
    /// Server port (1-65535)
    pub server_port: u16,
    /// Transport security mode
    pub security: Security,
    /// REALITY public key (`pbk`)
    pub public_key: Option<String>,
    /// Server name indication, defaults to the server host
    pub sni: String,
    /// REALITY short id (`sid`, or `short_id`)
    pub short_id: Option<String>,
    /// uTLS fingerprint (`fp`)
    pub fingerprint: String,
    /// Flow control tag, possibly empty
    pub flow: String,
    /// Transport type (`type`)
    pub transport: String,
    /// Spider path (`spx`)
    pub spx: String,
    /// Transport path for ws/httpupgrade
    pub path: Option<String>,
    /// Transport Host header for ws/httpupgrade
    pub host_header: Option<String>,
    /// gRPC service name
    pub service_name: Option<String>,
    /// Human-readable name (URL fragment, or the host)
    pub name: String,
}

/// Parse a `vless://uuid@host[:port][/]?query#name` link
///
/// Purely syntactic: no name resolution, no network access.
pub fn parse_vless_url(url: &str) -> Result<ConnectionParameters> {
    let url = url.trim();

    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::InvalidUrl("missing '://' after scheme".to_string()))?;
    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return Err(Error::InvalidUrl(format!(
            "scheme is not {}:// (got '{}')",
            SCHEME, scheme
        )));
    }

    let (rest, fragment) = match rest.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (rest, None),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, query),
        None => (rest, ""),
    };
    // Share links often carry an empty path ("host:443/?...")
    let authority = match rest.find('/') {
        Some(idx) => &rest[..idx],
        None => rest,
    };

    let (uuid, host_port) = authority
        .split_once('@')
        .ok_or_else(|| Error::InvalidUrl("missing user@host".to_string()))?;
    if uuid.is_empty() {
        return Err(Error::InvalidUrl("missing user identity".to_string()));
    }

    let (host, port) = split_host_port(host_port)?;
    if host.is_empty() {
        return Err(Error::InvalidUrl("missing host".to_string()));
    }

    let params = parse_query(query);
    let get = |key: &str| params.get(key).cloned();

    let name = fragment
        .map(decode_fragment)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host.to_string());

    let parsed = ConnectionParameters {
        uuid: uuid.to_string(),
        server: host.to_string(),
        server_port: port,
        security: Security::from(get("security").as_deref().unwrap_or(DEFAULT_SECURITY)),
        public_key: get("pbk"),
        sni: get("sni").unwrap_or_else(|| host.to_string()),
        short_id: get("sid").or_else(|| get("short_id")),
        fingerprint: get("fp").unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string()),
        flow: get("flow").unwrap_or_default(),
        transport: get("type").unwrap_or_else(|| DEFAULT_TRANSPORT.to_string()),
        spx: get("spx").unwrap_or_else(|| DEFAULT_SPX.to_string()),
        path: get("path"),
        host_header: get("host"),
        service_name: get("serviceName"),
        name,
    };

    debug!(
        "Parsed VLESS link for {}:{} (security={}, type={})",
        parsed.server, parsed.server_port, parsed.security, parsed.transport
    );

    Ok(parsed)
}

/// Split `host[:port]` at the last ':'; bracketed IPv6 hosts are unwrapped
fn split_host_port(address: &str) -> Result<(&str, u16)> {
    if let Some(inner) = address.strip_prefix('[') {
        let (host, after) = inner
            .split_once(']')
            .ok_or_else(|| Error::InvalidUrl("unterminated IPv6 address".to_string()))?;
        if after.is_empty() {
            return Ok((host, DEFAULT_PORT));
        }
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidUrl(format!("unexpected '{}' after IPv6 address", after)))?;
        return Ok((host, parse_port(port)?));
    }

    match address.rsplit_once(':') {
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((address, DEFAULT_PORT)),
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    if raw.is_empty() {
        return Err(Error::InvalidUrl("empty port after ':'".to_string()));
    }

    let value: u32 = raw
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("port '{}' is not a number", raw)))?;

    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::InvalidUrl(format!(
            "port {} is outside 1-65535",
            value
        ))),
    }
}

/// Query string as name -> first non-empty value
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_form(key);
        let value = decode_form(value);
        if key.is_empty() || value.is_empty() {
            continue;
        }
        params.entry(key).or_insert(value);
    }

    params
}

fn decode_form(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn decode_fragment(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}
