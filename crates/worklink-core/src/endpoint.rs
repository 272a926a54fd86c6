//! Controller and locator endpoint parsing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::ConnectionError;

/// Port assumed when an endpoint names only a host.
pub const DEFAULT_PORT: u16 = 10053;

/// Where a stream transport connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`, `[v6]:port` or a bare host (default port).
    Tcp { host: String, port: u16 },
    /// A local socket path (`/path/to/sock` or `unix:/path/to/sock`).
    Unix(PathBuf),
}

impl Endpoint {
    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConnectionError::InvalidEndpoint(s.to_string());

        if s.is_empty() {
            return Err(invalid());
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.contains('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                tail => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if s.matches(':').count() > 1 {
            // Unbracketed IPv6 literal: no room for a port.
            (s, None)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// Parse a comma-separated locator list. Empty entries are skipped.
pub fn parse_locators(list: &str) -> Result<Vec<Endpoint>, ConnectionError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> Endpoint {
        Endpoint::Tcp {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn host_without_port_uses_default() {
        assert_eq!("localhost".parse::<Endpoint>().unwrap(), tcp("localhost", 10053));
        assert_eq!("10.0.0.1:7000".parse::<Endpoint>().unwrap(), tcp("10.0.0.1", 7000));
    }

    #[test]
    fn ipv6_brackets_are_stripped() {
        assert_eq!("[::1]:10054".parse::<Endpoint>().unwrap(), tcp("::1", 10054));
        assert_eq!("[fe80::1]".parse::<Endpoint>().unwrap(), tcp("fe80::1", 10053));
        assert_eq!("::1".parse::<Endpoint>().unwrap(), tcp("::1", 10053));
        assert_eq!(tcp("::1", 10054).to_string(), "[::1]:10054");
    }

    #[test]
    fn paths_are_unix_sockets() {
        assert_eq!(
            "/run/worklink/app.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/worklink/app.sock"))
        );
        assert_eq!(
            "unix:relative.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("relative.sock"))
        );
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        for bad in ["", "host:notaport", "host:70000", "[::1", "[::1]x", ":80", "unix:"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(ConnectionError::InvalidEndpoint(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn locator_list_is_split_on_commas() {
        let endpoints = parse_locators("a:1, [::1]:2,,b").unwrap();
        assert_eq!(endpoints, vec![tcp("a", 1), tcp("::1", 2), tcp("b", 10053)]);
        assert!(parse_locators("a:1,b:x").is_err());
    }
}
