//! Packet Protocol Core Implementation
//!
//! This crate implements the packet protocol: the primitive wire codec,
//! the closed set of packet variants, frame loading and saving with
//! optional integrity trailers, the tag-to-packet factory, and the
//! fragmentation engines that move oversized packets over bounded-MTU or
//! lossy transports with selective re-send.

pub mod core;
pub mod factory;
pub mod fragment;
pub mod loader;
pub mod options;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod tag;
pub mod wire;

pub use crate::core::{
    Base64Packet, CipherListPacket, EncryptedPacket, EncryptionUpgradePacket, IdentifierPacket,
    SslUpgradePacket,
};
pub use factory::PacketFactory;
pub use fragment::{
    AllocatePacket, AllocationPacket, MessagePacket, MessageResponsePacket, RetrySendPacket,
    SendCompletePacket, SendStopPacket, VerifyCompletePacket,
};
pub use loader::PacketLoader;
pub use options::{FragmentationOptions, OptionsError};
pub use packet::{Packet, PacketError};
pub use receiver::{FragmentReceiver, ReceiverError};
pub use sender::{FragmentSender, SenderError};
pub use tag::ProtocolTag;
pub use wire::LengthClampedReader;
