use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a ring peer: `host:port`. Used both as a connection
/// target and, in `TasksCount`, as the origin marker that lets a node detect
/// that a dissemination message has completed a full lap of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&PeerAddr> for String {
    fn from(addr: &PeerAddr) -> Self {
        addr.to_string()
    }
}
