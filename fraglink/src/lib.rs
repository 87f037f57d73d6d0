//! fraglink - Message Framing and Reliable Fragment Delivery
//!
//! High-level API re-exporting the packet codec, factory, loader, and the
//! fragmentation engines, plus the digest and cipher collaborator seams.

pub use fraglink_crypto as crypto;
pub use fraglink_protocol as protocol;

// Re-export commonly used types
pub use protocol::{
    FragmentReceiver, FragmentSender, FragmentationOptions, Packet, PacketError, PacketFactory,
    PacketLoader, ProtocolTag,
};
