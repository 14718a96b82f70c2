pub mod codec;
pub mod packet;

pub use packet::{JobPriority, Magic, Packet, PacketType};
