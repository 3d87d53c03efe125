//! Connection addresses.
//!
//! `scheme://[user[:password]@]host[:port][/path]`
//!
//! Known schemes carry default ports: `amqp` 5672, `amqps` 5671, `ws` 80,
//! `wss` 443. Other schemes must name a port and need a registered
//! connector.

use std::fmt;
use std::str::FromStr;

use crate::error::{AmqpError, Result};

/// A parsed connection address.
#[derive(Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Path without the leading `/`, if any.
    pub path: Option<String>,
}

impl Address {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| AmqpError::InvalidAddress(format!("{}: {}", reason, input));

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], Some(&rest[index + 1..])),
            None => (rest, None),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(index) => (Some(&authority[..index]), &authority[index + 1..]),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (Some(percent_decode(user)?), Some(percent_decode(password)?)),
                None => (Some(percent_decode(info)?), None),
            },
            None => (None, None),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| invalid("bad host or port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port,
            None => default_port(&scheme).ok_or_else(|| invalid("no default port for scheme"))?,
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            user,
            password,
            path: path.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }

    /// True for schemes that run over TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.scheme.as_str(), "amqps" | "wss")
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Default port for the built-in schemes.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "amqp" => Some(5672),
        "amqps" => Some(5671),
        "ws" => Some(80),
        "wss" => Some(443),
        _ => None,
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if after.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| AmqpError::InvalidAddress(format!("bad escape in {}", input)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| AmqpError::InvalidAddress(format!("invalid utf-8 in {}", input)))
}

impl FromStr for Address {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.authority())?;
        if let Some(path) = &self.path {
            write!(f, "/{}", path)?;
        }
        Ok(())
    }
}

// Keep the password out of logs.
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}
