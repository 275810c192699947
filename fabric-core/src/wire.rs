use serde::{Deserialize, Serialize};

use crate::addr::PeerAddr;
use crate::task::Task;

/// The fixed set of messages exchanged over every connection in the fabric:
/// node to registry, node to neighbor, and (via forwarding) node to node
/// around the ring. The enum discriminant that `bincode` writes serves as
/// the message's type tag, so no separate tag field is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // -- node -> registry --
    RegisterRequest {
        host: String,
        port: u16,
    },
    TaskComplete {
        host: String,
        port: u16,
    },
    TrafficSummary {
        host: String,
        port: u16,
        generated: u64,
        pushed: u64,
        pulled: u64,
        completed: u64,
    },

    // -- registry -> node --
    RegisterResponse {
        status: RegisterStatus,
        info: String,
    },
    MessagingNodesList {
        /// exactly two entries once the overlay is fully formed: `[prev, next]`
        neighbors: Vec<PeerAddr>,
        pool_size: usize,
        overlay_size: usize,
    },
    TaskInitiate {
        round: u32,
    },
    PullTrafficSummary,

    // -- node <-> neighbor --
    Hello {
        addr: PeerAddr,
    },
    TasksCount {
        origin: PeerAddr,
        count: u64,
    },
    CheckStatus {
        deficit: u64,
    },
    PushRequest {
        total: u64,
    },
    MigrateTasks {
        batch: Vec<Task>,
    },
    MigrateResponse,
    /// Sent back instead of `MigrateResponse` when the batch arrives after
    /// the receiver has already entered Executing and can no longer accept
    /// it; carries the batch back so the sender can keep the tasks rather
    /// than lose them.
    MigrateRejected {
        batch: Vec<Task>,
    },
    StatusResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterStatus {
    Ok,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let bytes = bincode::serialize(msg).expect("serialize should work");
        bincode::deserialize(&bytes).expect("deserialize should work")
    }

    #[test]
    fn codec_roundtrips_every_message_kind() {
        let origin = PeerAddr::new("node-a", 9000);
        let messages = vec![
            Message::RegisterRequest {
                host: "node-a".into(),
                port: 9000,
            },
            Message::TaskComplete {
                host: "node-a".into(),
                port: 9000,
            },
            Message::TrafficSummary {
                host: "node-a".into(),
                port: 9000,
                generated: 10,
                pushed: 2,
                pulled: 1,
                completed: 9,
            },
            Message::RegisterResponse {
                status: RegisterStatus::Ok,
                info: "welcome".into(),
            },
            Message::MessagingNodesList {
                neighbors: vec![origin.clone(), PeerAddr::new("node-b", 9001)],
                pool_size: 4,
                overlay_size: 3,
            },
            Message::TaskInitiate { round: 7 },
            Message::PullTrafficSummary,
            Message::Hello {
                addr: origin.clone(),
            },
            Message::TasksCount {
                origin: origin.clone(),
                count: 42,
            },
            Message::CheckStatus { deficit: 5 },
            Message::PushRequest { total: 120 },
            Message::MigrateTasks {
                batch: vec![Task::new("node-a", 9000, 7, 1)],
            },
            Message::MigrateResponse,
            Message::MigrateRejected {
                batch: vec![Task::new("node-a", 9000, 7, 2)],
            },
            Message::StatusResponse,
        ];

        for msg in &messages {
            let decoded = roundtrip(msg);
            // `Message` has no `PartialEq`; compare via `Debug` formatting,
            // which is exact for these plain-data variants.
            assert_eq!(format!("{:?}", msg), format!("{:?}", decoded));
        }
    }
}
