use std::fmt;

use crate::http1::RequestHead;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_TUNNEL_PORT: u16 = 443;

/// The destination a client asked the proxy to reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    MissingHost,
    InvalidPort(String),
    InvalidUrl(String),
    UnsupportedScheme(String),
}

/// Works out where a request is headed: the authority of a CONNECT, the host
/// of an absolute-form URL, or the `Host` header of an origin-form request.
///
/// The host is ASCII-lowercased whatever form it arrived in, so one
/// destination always resolves to the same `Target`.
pub fn resolve_target(head: &RequestHead) -> Result<Target, TargetError> {
    let mut target = resolve_raw_target(head)?;
    target.host.make_ascii_lowercase();
    Ok(target)
}

fn resolve_raw_target(head: &RequestHead) -> Result<Target, TargetError> {
    if head.is_connect() {
        return split_host_port(&head.line.target, DEFAULT_TUNNEL_PORT);
    }

    let target = head.line.target.as_str();
    let absolute = if target.starts_with('/') {
        None
    } else {
        target.split_once("://")
    };
    if let Some((scheme, _)) = absolute {
        if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
            return Err(TargetError::UnsupportedScheme(scheme.to_string()));
        }
        let url = url::Url::parse(target).map_err(|err| TargetError::InvalidUrl(err.to_string()))?;
        let host = url.host_str().ok_or(TargetError::MissingHost)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
        return Ok(Target::new(host, port));
    }

    let host = head.header("host").ok_or(TargetError::MissingHost)?;
    split_host_port(host, DEFAULT_HTTP_PORT)
}

pub fn split_host_port(authority: &str, default_port: u16) -> Result<Target, TargetError> {
    let authority = authority.trim();

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| TargetError::InvalidPort(authority.to_string()))?;
        if host.is_empty() {
            return Err(TargetError::MissingHost);
        }
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => return Err(TargetError::InvalidPort(tail.to_string())),
        };
        return Ok(Target::new(host, port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => (authority, default_port),
        Some((host, port)) => (host, parse_port(port)?),
        None => (authority, default_port),
    };

    if host.is_empty() {
        return Err(TargetError::MissingHost);
    }

    Ok(Target::new(host, port))
}

fn parse_port(raw: &str) -> Result<u16, TargetError> {
    raw.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| TargetError::InvalidPort(raw.to_string()))
}
