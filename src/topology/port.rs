//! Port binding grammar: `[host[~max]][:]container[/protocol]`

use crate::error::{ArmadaError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol used when the binding names none
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// Lower bound of an open `~` host port range
pub const RANGE_MIN_PORT: u16 = 1025;

/// Upper bound of an open `~` host port range
pub const RANGE_MAX_PORT: u16 = 65535;

/// Separator between alternative host ports in a multi-port spec
pub const MULTI_PORT_SEPARATOR: char = '|';

/// A parsed port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Protocol, `tcp` unless given
    pub protocol: String,
    /// Lowest host port the binding accepts
    pub host_port_min: u16,
    /// Highest host port the binding accepts
    pub host_port_max: u16,
    /// Host port picked from the range when the binding was parsed
    pub host_port: u16,
    /// Port inside the container
    pub container_port: u16,
}

impl PortBinding {
    /// Parse a binding string.
    ///
    /// A missing host part binds the container port on the host. A `~`
    /// range picks a host port uniformly at random, with open ends
    /// defaulting to 1025 and 65535.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = |reason: &str| ArmadaError::InvalidPortBinding(format!("'{}': {}", spec, reason));

        let (ports, protocol) = match spec.rfind('/') {
            Some(idx) if idx > 0 => (&spec[..idx], &spec[idx + 1..]),
            Some(_) => return Err(invalid("missing container port")),
            None => (spec, DEFAULT_PROTOCOL),
        };

        let protocol = protocol.to_ascii_lowercase();
        if protocol != "tcp" && protocol != "udp" {
            return Err(invalid("protocol must be tcp or udp"));
        }

        let (host, container) = match ports.rfind(':') {
            Some(idx) => (&ports[..idx], &ports[idx + 1..]),
            None => ("", ports),
        };

        let container_port = parse_port(container).ok_or_else(|| invalid("bad container port"))?;

        let (host_port_min, host_port_max) = if host.is_empty() {
            (container_port, container_port)
        } else if let Some(idx) = host.find('~') {
            let (min, max) = (&host[..idx], &host[idx + 1..]);
            let min = if min.is_empty() {
                RANGE_MIN_PORT
            } else {
                parse_port(min).ok_or_else(|| invalid("bad host range start"))?
            };
            let max = if max.is_empty() {
                RANGE_MAX_PORT
            } else {
                parse_port(max).ok_or_else(|| invalid("bad host range end"))?
            };
            if min > max {
                return Err(invalid("host range start exceeds end"));
            }
            (min, max)
        } else {
            let port = parse_port(host).ok_or_else(|| invalid("bad host port"))?;
            (port, port)
        };

        let host_port = if host_port_min == host_port_max {
            host_port_min
        } else {
            rand::thread_rng().gen_range(host_port_min..=host_port_max)
        };

        Ok(Self {
            protocol,
            host_port_min,
            host_port_max,
            host_port,
            container_port,
        })
    }

    /// Same port on host and container
    pub fn fixed(protocol: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            host_port_min: port,
            host_port_max: port,
            host_port: port,
            container_port: port,
        }
    }

    /// Whether the host port was drawn from a range
    pub fn is_range(&self) -> bool {
        self.host_port_min != self.host_port_max
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Split a multi-port spec such as `8080|8081:80/tcp` into one spec per
/// host port. Specs without a `|` come back unchanged.
pub fn expand_multi_port(spec: &str) -> Vec<String> {
    let (ports, protocol) = match spec.rfind('/') {
        Some(idx) => (&spec[..idx], Some(&spec[idx + 1..])),
        None => (spec, None),
    };
    let (host, container) = match ports.rfind(':') {
        Some(idx) => (&ports[..idx], &ports[idx + 1..]),
        None => return vec![spec.to_string()],
    };
    if !host.contains(MULTI_PORT_SEPARATOR) {
        return vec![spec.to_string()];
    }

    host.split(MULTI_PORT_SEPARATOR)
        .map(|h| match protocol {
            Some(p) => format!("{}:{}/{}", h.trim(), container, p),
            None => format!("{}:{}", h.trim(), container),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let pb = PortBinding::parse("8080:80/tcp").unwrap();
        assert_eq!(pb.host_port, 8080);
        assert_eq!(pb.container_port, 80);
        assert_eq!(pb.protocol, "tcp");
        assert!(!pb.is_range());
    }

    #[test]
    fn test_parse_container_only() {
        let pb = PortBinding::parse("80").unwrap();
        assert_eq!(pb.host_port, 80);
        assert_eq!(pb.container_port, 80);
        assert_eq!(pb.protocol, DEFAULT_PROTOCOL);

        let pb = PortBinding::parse(":53/udp").unwrap();
        assert_eq!(pb.host_port, 53);
        assert_eq!(pb.protocol, "udp");
    }

    #[test]
    fn test_parse_range() {
        for _ in 0..100 {
            let pb = PortBinding::parse("1025~65535:80").unwrap();
            assert!(pb.host_port >= 1025);
            assert_eq!(pb.container_port, 80);
            assert!(pb.is_range());
        }

        let pb = PortBinding::parse("~:80").unwrap();
        assert_eq!((pb.host_port_min, pb.host_port_max), (RANGE_MIN_PORT, RANGE_MAX_PORT));

        let pb = PortBinding::parse("9000~9002:80").unwrap();
        assert!((9000..=9002).contains(&pb.host_port));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "abc", "80:", "8080:80/sctp", "9000~8000:80", "70000:80", "/tcp", "0"] {
            let err = PortBinding::parse(bad).unwrap_err();
            assert!(matches!(err, ArmadaError::InvalidPortBinding(_)), "{}", bad);
        }
    }

    #[test]
    fn test_expand_multi_port() {
        assert_eq!(
            expand_multi_port("8080|8081:80/tcp"),
            vec!["8080:80/tcp".to_string(), "8081:80/tcp".to_string()]
        );
        assert_eq!(expand_multi_port("8080:80"), vec!["8080:80".to_string()]);
        assert_eq!(expand_multi_port("80"), vec!["80".to_string()]);
    }
}
