//! Tag-to-Packet Factory
//!
//! Maps a protocol tag to a freshly constructed, empty packet of that
//! variant, ready to receive its payload. The factory is a cheap-clone
//! handle over shared configuration; envelope packets receive a clone so
//! the default chained sub-factory is the factory itself without a back
//! edge.

use crate::core::{
    Base64Packet, CipherListPacket, EncryptedPacket, EncryptionUpgradePacket, IdentifierPacket,
    SslUpgradePacket,
};
use crate::fragment::{
    AllocatePacket, AllocationPacket, MessagePacket, MessageResponsePacket, RetrySendPacket,
    SendCompletePacket, SendStopPacket, VerifyCompletePacket,
};
use crate::loader::PacketLoader;
use crate::packet::Packet;
use crate::tag::{tags, ProtocolTag};
use fraglink_crypto::CipherFactory;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared-handle packet factory.
#[derive(Clone)]
pub struct PacketFactory {
    shared: Arc<FactoryShared>,
}

struct FactoryShared {
    stream_preferred: AtomicBool,
    state: Mutex<FactoryState>,
}

struct FactoryState {
    loader: PacketLoader,
    chain: Option<PacketFactory>,
    cipher_factory: Option<Arc<dyn CipherFactory>>,
    seed: Option<Packet>,
}

impl PacketFactory {
    pub fn new(stream_preferred: bool, loader: PacketLoader) -> Self {
        PacketFactory {
            shared: Arc::new(FactoryShared {
                stream_preferred: AtomicBool::new(stream_preferred),
                state: Mutex::new(FactoryState {
                    loader,
                    chain: None,
                    cipher_factory: None,
                    seed: None,
                }),
            }),
        }
    }

    /// Produces an empty packet for a recognized tag, `None` otherwise.
    ///
    /// `Encrypted` is only produced while a cipher factory is attached.
    pub fn get_packet(&self, tag: ProtocolTag) -> Option<Packet> {
        let state = self.shared.state.lock();
        let chain = state.chain.clone().unwrap_or_else(|| self.clone());
        match tag {
            tags::BASE64 => Some(Packet::Base64(Base64Packet::new(
                chain,
                state.loader.clone(),
                state.seed.clone(),
                false,
            ))),
            tags::ENCRYPTED => state.cipher_factory.clone().map(|cipher| {
                Packet::Encrypted(EncryptedPacket::new(
                    chain,
                    state.loader.clone(),
                    cipher,
                    state.seed.clone(),
                    false,
                ))
            }),
            tags::ENCRYPTION_UPGRADE => Some(Packet::EncryptionUpgrade(
                EncryptionUpgradePacket::new(None, false, false, state.cipher_factory.clone()),
            )),
            tags::SSL_UPGRADE => Some(Packet::SslUpgrade(SslUpgradePacket::empty())),
            tags::IDENTIFIER => Some(Packet::Identifier(IdentifierPacket::empty())),
            tags::CIPHER_LIST => Some(Packet::CipherList(CipherListPacket::empty())),
            tags::FRAGMENT_ALLOCATE => Some(Packet::Allocate(AllocatePacket::empty())),
            tags::FRAGMENT_ALLOCATION => Some(Packet::Allocation(AllocationPacket::empty())),
            tags::FRAGMENT_MESSAGE => Some(Packet::Message(MessagePacket::empty())),
            tags::FRAGMENT_MESSAGE_RESPONSE => {
                Some(Packet::MessageResponse(MessageResponsePacket::empty()))
            }
            tags::FRAGMENT_SEND_COMPLETE => {
                Some(Packet::SendComplete(SendCompletePacket::empty()))
            }
            tags::FRAGMENT_RETRY_SEND => Some(Packet::RetrySend(RetrySendPacket::empty())),
            tags::FRAGMENT_SEND_STOP => Some(Packet::SendStop(SendStopPacket::empty())),
            tags::FRAGMENT_VERIFY_COMPLETE => {
                Some(Packet::VerifyComplete(VerifyCompletePacket::empty()))
            }
            _ => None,
        }
    }

    /// Advisory: whether envelope variants should prefer their streaming
    /// body path where both paths exist.
    pub fn stream_packets_preferred(&self) -> bool {
        self.shared.stream_preferred.load(Ordering::Acquire)
    }

    pub fn set_stream_packets_preferred(&self, preferred: bool) {
        self.shared.stream_preferred.store(preferred, Ordering::Release);
    }

    /// The sub-factory envelope packets decode their inner frame with;
    /// `None` means this factory itself.
    pub fn chain(&self) -> Option<PacketFactory> {
        self.shared.state.lock().chain.clone()
    }

    pub fn set_chain(&self, chain: Option<PacketFactory>) {
        self.shared.state.lock().chain = chain;
    }

    pub fn cipher_factory(&self) -> Option<Arc<dyn CipherFactory>> {
        self.shared.state.lock().cipher_factory.clone()
    }

    pub fn set_cipher_factory(&self, cipher_factory: Option<Arc<dyn CipherFactory>>) {
        self.shared.state.lock().cipher_factory = cipher_factory;
    }

    /// Template inner packet handed to newly built envelopes.
    pub fn seed_packet(&self) -> Option<Packet> {
        self.shared.state.lock().seed.clone()
    }

    pub fn set_seed_packet(&self, seed: Option<Packet>) {
        self.shared.state.lock().seed = seed;
    }

    pub fn loader(&self) -> PacketLoader {
        self.shared.state.lock().loader.clone()
    }

    pub fn set_loader(&self, loader: PacketLoader) {
        self.shared.state.lock().loader = loader;
    }
}
