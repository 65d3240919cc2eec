//! Transport address parsing
//!
//! Addresses have the textual form `[protocol://]host[:port][;key=value...]`.
//! Parsing is pure, so a writer and a reader configured with the same string
//! always resolve it to the same [`Address`], and [`Address`]'s `Display`
//! reproduces the canonical input.

use crate::error::{AdaptioError, Result};
use std::fmt;
use std::str::FromStr;

/// A parsed transport address
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    /// Protocol name, empty when neither the string nor a default named one
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    /// Auxiliary `key=value` parameters in their original order
    pub params: Vec<(String, String)>,
}

impl Address {
    /// Parse `address`, using `default_protocol` when the string has none
    pub fn parse(address: &str, default_protocol: Option<&str>) -> Result<Self> {
        let malformed = |reason: &str| AdaptioError::MalformedAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = address.trim().split(';');
        let endpoint = segments.next().unwrap_or_default();

        let mut params = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| malformed("parameter is not key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(malformed("parameter has an empty key"));
            }
            params.push((key.to_string(), value.trim().to_string()));
        }

        let (protocol, rest) = match endpoint.split_once("://") {
            Some((protocol, rest)) => {
                let valid = !protocol.is_empty()
                    && protocol
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
                if !valid {
                    return Err(malformed("invalid protocol"));
                }
                (protocol.to_ascii_lowercase(), rest)
            }
            None => (default_protocol.unwrap_or_default().to_string(), endpoint),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| malformed("unterminated '[' in host"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(malformed("unexpected text after host")),
                },
            }
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        if host.contains(['/', ' ']) || (!rest.starts_with('[') && host.contains(':')) {
            return Err(malformed("invalid character in host"));
        }

        let port = match port {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| malformed("port is not a number in 0..=65535"))?,
            ),
            None => None,
        };

        Ok(Address {
            protocol,
            host: host.to_string(),
            port,
            params,
        })
    }

    /// Value of auxiliary parameter `key`
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `host:port` suitable for socket APIs
    pub fn socket_addr(&self) -> Result<String> {
        let port = self.port.ok_or_else(|| AdaptioError::MalformedAddress {
            address: self.to_string(),
            reason: "no port".to_string(),
        })?;
        if self.host.contains(':') {
            Ok(format!("[{}]:{}", self.host, port))
        } else {
            Ok(format!("{}:{}", self.host, port))
        }
    }
}

impl FromStr for Address {
    type Err = AdaptioError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s, None)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.protocol.is_empty() {
            write!(f, "{}://", self.protocol)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.params {
            write!(f, ";{}={}", key, value)?;
        }
        Ok(())
    }
}
