//! JDBC-like connection strings for engines that accept a host cluster.
//!
//! Format: `[jdbc:]scheme://host1[:port1][,host2[:port2]...][/catalog[/schema]][?KEY=value&...]`

use crate::error::{RelayError, Result};
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static CONNECTION_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:jdbc:)?([A-Za-z][A-Za-z0-9+.\-]*)://([^/?#]+)(?:/([^/?#]*))?(?:/([^/?#]*))?/?(?:\?(.*))?$",
    )
    .expect("connection string pattern is valid")
});

/// Port used when a host omits one and the connection is plain HTTP.
const DEFAULT_HTTP_PORT: u16 = 8080;

/// Port used when a host omits one and the connection uses TLS.
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: String,
    pub hosts: Vec<(String, u16)>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub params: HashMap<String, String>,
}

/// One concrete host chosen from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: &'static str,
    pub host: String,
    pub port: u16,
    pub catalog: Option<String>,
    pub schema: Option<String>,
}

impl Endpoint {
    /// Returns `protocol://host:port` without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl ConnectionString {
    /// Parses a connection string, failing fast on malformed input.
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = CONNECTION_STRING_RE.captures(raw.trim()).ok_or_else(|| {
            RelayError::config(format!("Malformed connection string: '{raw}'"))
        })?;

        let scheme = caps[1].to_lowercase();
        let params = caps
            .get(5)
            .map(|m| parse_params(m.as_str()))
            .unwrap_or_default();
        let secure = is_ssl_enabled(&params);

        let mut hosts = Vec::new();
        for entry in caps[2].split(',') {
            hosts.push(parse_host(entry, secure, raw)?);
        }

        let non_empty = |idx: usize| {
            caps.get(idx)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
        };

        Ok(Self {
            scheme,
            hosts,
            catalog: non_empty(3),
            schema: non_empty(4),
            params,
        })
    }

    /// Returns `https` iff an `SSL` parameter is present and not `false`.
    pub fn protocol(&self) -> &'static str {
        if is_ssl_enabled(&self.params) {
            "https"
        } else {
            "http"
        }
    }

    /// Picks one host uniformly at random.
    pub fn pick_endpoint(&self) -> Result<Endpoint> {
        let (host, port) = self
            .hosts
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| RelayError::config("Connection string has no hosts"))?;

        Ok(Endpoint {
            protocol: self.protocol(),
            host: host.clone(),
            port: *port,
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
        })
    }

    /// Looks up a query parameter case-insensitively.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn is_ssl_enabled(params: &HashMap<String, String>) -> bool {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("ssl"))
        .map(|(_, v)| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn parse_host(entry: &str, secure: bool, raw: &str) -> Result<(String, u16)> {
    let entry = entry.trim();
    let malformed = || RelayError::config(format!("Malformed host '{entry}' in '{raw}'"));

    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| malformed())?)),
        None => (entry, None),
    };
    if host.is_empty() {
        return Err(malformed());
    }

    let default_port = if secure {
        DEFAULT_HTTPS_PORT
    } else {
        DEFAULT_HTTP_PORT
    };
    Ok((host.to_string(), port.unwrap_or(default_port)))
}
