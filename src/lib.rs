pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod shutdown;
pub mod transport;

pub use client::{Client, ErrorHandler, JobHandle, Response, ResponseHandler, Status};
pub use config::{ClientConfig, PoolConfig, SelectionMode, ServerConfig};
pub use error::{GearError, Result};
pub use pool::{Pool, SelectionStrategy, UniformSelect, WeightedSelect};
pub use protocol::{JobPriority, Packet, PacketType};
