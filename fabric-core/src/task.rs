use serde::{Deserialize, Serialize};

/// One unit of work. Immutable once created; identity is the full field
/// tuple, so two tasks are equal only if every field matches.
///
/// Wire shape: (origin host, origin port, round, nonce).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub origin_host: String,
    pub origin_port: u16,
    pub round: u32,
    pub nonce: u64,
}

impl Task {
    pub fn new(origin_host: impl Into<String>, origin_port: u16, round: u32, nonce: u64) -> Self {
        Self {
            origin_host: origin_host.into(),
            origin_port,
            round,
            nonce,
        }
    }
}
