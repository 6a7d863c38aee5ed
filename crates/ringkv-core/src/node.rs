//! Identity of a ring member.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Network identity of a server node.
///
/// Two ids are equal when both address and port are equal. The textual form
/// `address:port` is what gets hashed onto the ring and what travels in ring
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    address: String,
    port: u16,
}

impl NodeId {
    /// Create a new node id
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Host name or IP address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidOperation(format!("Expected address:port, got '{}'", s)))?;

        if address.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "Missing address in '{}'",
                s
            )));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidOperation(format!("Invalid port in '{}': {}", s, e)))?;

        Ok(NodeId::new(address, port))
    }
}
