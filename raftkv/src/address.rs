//! Node identity, derived from a normalized network endpoint (§6 of the spec).

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An opaque, comparable identifier for a cluster member.
///
/// Constructed from an endpoint string of the form `/ip4/A.B.C.D/tcp/P` or
/// `/ip6/.../tcp/P`. Two `NodeId`s are equal iff their normalized (lowercased)
/// endpoint strings are equal; the raw input casing and surrounding
/// whitespace never affect identity or hashing.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Parse and normalize an endpoint string into a `NodeId`.
    ///
    /// Only the first four `/`-separated segments are significant, matching
    /// the wire format `/{ip4,ip6}/{host}/tcp/{port}`; anything beyond that
    /// is dropped rather than rejected, so callers may pass a longer
    /// multiaddr-style string without failing normalization.
    pub fn parse(endpoint: &str) -> Result<Self, InvalidAddress> {
        let segments: Vec<&str> = endpoint.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 4 {
            return Err(InvalidAddress {
                input: endpoint.to_string(),
            });
        }
        let proto = segments[0].to_ascii_lowercase();
        if proto != "ip4" && proto != "ip6" {
            return Err(InvalidAddress {
                input: endpoint.to_string(),
            });
        }
        if segments[2].to_ascii_lowercase() != "tcp" {
            return Err(InvalidAddress {
                input: endpoint.to_string(),
            });
        }
        let host = segments[1].to_ascii_lowercase();
        let port = segments[3];
        if port.parse::<u16>().is_err() {
            return Err(InvalidAddress {
                input: endpoint.to_string(),
            });
        }
        Ok(NodeId(format!("/{proto}/{host}/tcp/{port}")))
    }

    /// The canonical, normalized endpoint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::parse(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid node address: {input}")]
pub struct InvalidAddress {
    input: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case() {
        let a = NodeId::parse("/ip4/127.0.0.1/tcp/9101").unwrap();
        let b = NodeId::parse("/IP4/127.0.0.1/TCP/9101").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "/ip4/127.0.0.1/tcp/9101");
    }

    #[test]
    fn rejects_bad_port() {
        assert!(NodeId::parse("/ip4/127.0.0.1/tcp/notaport").is_err());
    }

    #[test]
    fn rejects_missing_segments() {
        assert!(NodeId::parse("/ip4/127.0.0.1").is_err());
    }

    #[test]
    fn trailing_segments_are_ignored() {
        let a = NodeId::parse("/ip4/127.0.0.1/tcp/9101/extra").unwrap();
        assert_eq!(a.as_str(), "/ip4/127.0.0.1/tcp/9101");
    }
}
