pub mod addr;
pub mod config;
pub mod controller;
pub mod error;
pub mod pool;
pub mod pow;
pub mod rw;
pub mod stats;
pub mod task;
pub mod wire;

pub use addr::PeerAddr;
pub use config::{OverlayConfig, ProtocolTuning};
pub use controller::{NeighborLink, NeighborSide, NodeController};
pub use pool::WorkerPool;
pub use rw::{Connection, ConnectionReader, ConnectionWriter};
pub use stats::{StatsSnapshot, Statistics};
pub use task::Task;
pub use wire::{Message, RegisterStatus};
