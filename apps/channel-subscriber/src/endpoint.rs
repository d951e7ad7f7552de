//! Broker endpoint descriptors (`scheme://host:port`).

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::ConfigError;

/// Connection scheme understood by broker transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `nsp`: plain socket.
    Socket,
    /// `nsps`: TLS socket.
    SecureSocket,
    /// `nhp`: plain HTTP tunnel.
    HttpTunnel,
    /// `nhps`: HTTPS tunnel.
    SecureHttpTunnel,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "nsp",
            Self::SecureSocket => "nsps",
            Self::HttpTunnel => "nhp",
            Self::SecureHttpTunnel => "nhps",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Socket | Self::SecureSocket => 9000,
            Self::HttpTunnel => 80,
            Self::SecureHttpTunnel => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::SecureSocket | Self::SecureHttpTunnel)
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nsp" => Ok(Self::Socket),
            "nsps" => Ok(Self::SecureSocket),
            "nhp" => Ok(Self::HttpTunnel),
            "nhps" => Ok(Self::SecureHttpTunnel),
            other => Err(format!("unknown scheme {other:?} (expected nsp, nsps, nhp or nhps)")),
        }
    }
}

/// A single candidate broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::Endpoint {
            endpoint: s.to_string(),
            reason,
        };

        let url = Url::parse(s).map_err(|e| invalid(e.to_string()))?;
        let scheme: Scheme = url.scheme().parse().map_err(invalid)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: url.port().unwrap_or(scheme.default_port()),
        })
    }
}

/// Parse an `RNAME`-style list into endpoints, preserving order.
///
/// Accepts either a comma-separated list (`nsp://a:9000,nhp://b:80`) or
/// parenthesised groups (`(nsp://a:9000,nsp://b:9000)(nhp://c:80)`), which are
/// flattened group by group.
pub fn parse_endpoints(rname: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let raw: Vec<&str> = if rname.contains('(') {
        rname
            .split(['(', ')'])
            .flat_map(|group| group.split(','))
            .collect()
    } else {
        rname.split(',').collect()
    };

    let endpoints = raw
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Endpoint::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if endpoints.is_empty() {
        return Err(ConfigError::Endpoint {
            endpoint: rname.to_string(),
            reason: "no endpoints given".to_string(),
        });
    }

    Ok(endpoints)
}
