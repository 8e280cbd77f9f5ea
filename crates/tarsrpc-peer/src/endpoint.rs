use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Default per-endpoint timeout advertised by endpoint strings (ms).
pub const DEFAULT_ENDPOINT_TIMEOUT_MS: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// One network address a servant can be reached on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u32,
    /// Relative weight for weighted balancing. Zero is treated as one.
    pub weight: u32,
    /// Set division the endpoint belongs to, if any.
    pub set_id: Option<String>,
    /// Inactive endpoints are never picked.
    pub active: bool,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: host.into(),
            port,
            timeout_ms: DEFAULT_ENDPOINT_TIMEOUT_MS,
            weight: 1,
            set_id: None,
            active: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_set(mut self, set_id: impl Into<String>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }

    /// `host:port`, suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }

    /// Parse `tcp -h HOST -p PORT [-t MS] [-w WEIGHT] [-s SET]`.
    ///
    /// Unknown flags are skipped together with their value.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut tokens = raw.split_whitespace();
        let protocol = match tokens.next() {
            Some(p) if p.eq_ignore_ascii_case("tcp") => Protocol::Tcp,
            Some(p) if p.eq_ignore_ascii_case("udp") => Protocol::Udp,
            Some(p) => {
                return Err(RpcError::invalid_endpoint(
                    raw,
                    format!("unknown protocol '{p}'"),
                ))
            }
            None => return Err(RpcError::invalid_endpoint(raw, "empty endpoint")),
        };

        let mut host = None;
        let mut port = None;
        let mut endpoint = Endpoint::tcp(String::new(), 0);
        endpoint.protocol = protocol;

        while let Some(flag) = tokens.next() {
            let value = tokens
                .next()
                .ok_or_else(|| RpcError::invalid_endpoint(raw, format!("'{flag}' has no value")))?;
            match flag {
                "-h" => host = Some(value.to_string()),
                "-p" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        RpcError::invalid_endpoint(raw, format!("bad port '{value}'"))
                    })?)
                }
                "-t" => {
                    endpoint.timeout_ms = value.parse().map_err(|_| {
                        RpcError::invalid_endpoint(raw, format!("bad timeout '{value}'"))
                    })?
                }
                "-w" => {
                    endpoint.weight = value.parse().map_err(|_| {
                        RpcError::invalid_endpoint(raw, format!("bad weight '{value}'"))
                    })?
                }
                "-s" => endpoint.set_id = Some(value.to_string()),
                _ => {}
            }
        }

        endpoint.host = host.ok_or_else(|| RpcError::invalid_endpoint(raw, "missing -h"))?;
        endpoint.port = port.ok_or_else(|| RpcError::invalid_endpoint(raw, "missing -p"))?;
        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -h {} -p {} -t {}",
            self.protocol.as_str(),
            self.host,
            self.port,
            self.timeout_ms
        )?;
        if self.weight != 1 {
            write!(f, " -w {}", self.weight)?;
        }
        if let Some(set_id) = &self.set_id {
            write!(f, " -s {set_id}")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse a `:`-separated list of endpoint strings, skipping blanks.
pub fn parse_endpoint_list(raw: &str) -> Result<Vec<Endpoint>> {
    raw.split(':')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Endpoint::parse)
        .collect()
}

/// Join endpoints into the `:`-separated form.
pub fn format_endpoint_list(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

/// Split `App.Server.Obj@endpoints` into the servant name and the direct
/// endpoint list, if one is given.
pub fn split_object_name(object_name: &str) -> (&str, Option<&str>) {
    match object_name.split_once('@') {
        Some((name, endpoints)) => (name.trim(), Some(endpoints)),
        None => (object_name.trim(), None),
    }
}
