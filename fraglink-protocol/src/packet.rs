//! Packet Sum Type
//!
//! The protocol's packet variants form a closed set, modelled as one enum
//! dispatching to per-variant payload codecs. The loader establishes frame
//! boundaries; a variant codec never reads past the payload slice it is
//! given.
//!
//! Boolean payload bytes follow a strict discipline: `0x00` is false,
//! `0x01` is true, and any other value loads the field as unset so the
//! validity predicate fails.

use crate::core::{
    Base64Packet, CipherListPacket, EncryptedPacket, EncryptionUpgradePacket, IdentifierPacket,
    SslUpgradePacket,
};
use crate::fragment::{
    AllocatePacket, AllocationPacket, MessagePacket, MessageResponsePacket, RetrySendPacket,
    SendCompletePacket, SendStopPacket, VerifyCompletePacket,
};
use crate::tag::ProtocolTag;
use fraglink_crypto::CipherError;
use std::io::{Read, Write};
use thiserror::Error;

/// Codec and framing errors.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("payload length {actual} does not match expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("required field unset: {0}")]
    MissingField(&'static str),

    #[error("packet failed validity check")]
    Invalid,

    #[error("unexpected end of stream")]
    UnexpectedEnd,

    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes a boolean payload byte.
pub(crate) fn bool_to_byte(value: bool) -> u8 {
    u8::from(value)
}

/// Decodes a boolean payload byte; anything other than 0 or 1 is unset.
pub(crate) fn bool_from_byte(byte: u8) -> Option<bool> {
    match byte {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// A protocol packet: one of the closed set of variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Base64(Base64Packet),
    Encrypted(EncryptedPacket),
    EncryptionUpgrade(EncryptionUpgradePacket),
    SslUpgrade(SslUpgradePacket),
    Identifier(IdentifierPacket),
    CipherList(CipherListPacket),
    Allocate(AllocatePacket),
    Allocation(AllocationPacket),
    Message(MessagePacket),
    MessageResponse(MessageResponsePacket),
    SendComplete(SendCompletePacket),
    RetrySend(RetrySendPacket),
    SendStop(SendStopPacket),
    VerifyComplete(VerifyCompletePacket),
}

impl Packet {
    /// The variant's protocol tag.
    pub fn tag(&self) -> ProtocolTag {
        match self {
            Packet::Base64(_) => crate::tag::tags::BASE64,
            Packet::Encrypted(_) => crate::tag::tags::ENCRYPTED,
            Packet::EncryptionUpgrade(_) => crate::tag::tags::ENCRYPTION_UPGRADE,
            Packet::SslUpgrade(_) => crate::tag::tags::SSL_UPGRADE,
            Packet::Identifier(_) => crate::tag::tags::IDENTIFIER,
            Packet::CipherList(_) => crate::tag::tags::CIPHER_LIST,
            Packet::Allocate(_) => crate::tag::tags::FRAGMENT_ALLOCATE,
            Packet::Allocation(_) => crate::tag::tags::FRAGMENT_ALLOCATION,
            Packet::Message(_) => crate::tag::tags::FRAGMENT_MESSAGE,
            Packet::MessageResponse(_) => crate::tag::tags::FRAGMENT_MESSAGE_RESPONSE,
            Packet::SendComplete(_) => crate::tag::tags::FRAGMENT_SEND_COMPLETE,
            Packet::RetrySend(_) => crate::tag::tags::FRAGMENT_RETRY_SEND,
            Packet::SendStop(_) => crate::tag::tags::FRAGMENT_SEND_STOP,
            Packet::VerifyComplete(_) => crate::tag::tags::FRAGMENT_VERIFY_COMPLETE,
        }
    }

    /// Whether every required field is set.
    pub fn is_valid(&self) -> bool {
        match self {
            Packet::Base64(p) => p.is_valid(),
            Packet::Encrypted(p) => p.is_valid(),
            Packet::EncryptionUpgrade(p) => p.is_valid(),
            Packet::SslUpgrade(p) => p.is_valid(),
            Packet::Identifier(p) => p.is_valid(),
            Packet::CipherList(p) => p.is_valid(),
            Packet::Allocate(p) => p.is_valid(),
            Packet::Allocation(p) => p.is_valid(),
            Packet::Message(p) => p.is_valid(),
            Packet::MessageResponse(p) => p.is_valid(),
            Packet::SendComplete(p) => p.is_valid(),
            Packet::RetrySend(p) => p.is_valid(),
            Packet::SendStop(p) => p.is_valid(),
            Packet::VerifyComplete(p) => p.is_valid(),
        }
    }

    /// Serializes the payload to bytes. Fails if a required field is unset.
    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            Packet::Base64(p) => p.save_payload(),
            Packet::Encrypted(p) => p.save_payload(),
            Packet::EncryptionUpgrade(p) => p.save_payload(),
            Packet::SslUpgrade(p) => p.save_payload(),
            Packet::Identifier(p) => p.save_payload(),
            Packet::CipherList(p) => p.save_payload(),
            Packet::Allocate(p) => p.save_payload(),
            Packet::Allocation(p) => p.save_payload(),
            Packet::Message(p) => p.save_payload(),
            Packet::MessageResponse(p) => p.save_payload(),
            Packet::SendComplete(p) => p.save_payload(),
            Packet::RetrySend(p) => p.save_payload(),
            Packet::SendStop(p) => p.save_payload(),
            Packet::VerifyComplete(p) => p.save_payload(),
        }
    }

    /// Loads the payload from a frame body slice.
    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        match self {
            Packet::Base64(p) => p.load_payload(data),
            Packet::Encrypted(p) => p.load_payload(data),
            Packet::EncryptionUpgrade(p) => p.load_payload(data),
            Packet::SslUpgrade(p) => p.load_payload(data),
            Packet::Identifier(p) => p.load_payload(data),
            Packet::CipherList(p) => p.load_payload(data),
            Packet::Allocate(p) => p.load_payload(data),
            Packet::Allocation(p) => p.load_payload(data),
            Packet::Message(p) => p.load_payload(data),
            Packet::MessageResponse(p) => p.load_payload(data),
            Packet::SendComplete(p) => p.load_payload(data),
            Packet::RetrySend(p) => p.load_payload(data),
            Packet::SendStop(p) => p.load_payload(data),
            Packet::VerifyComplete(p) => p.load_payload(data),
        }
    }

    /// Whether the variant has a streaming body path.
    pub fn supports_streaming(&self) -> bool {
        matches!(
            self,
            Packet::Base64(_) | Packet::Encrypted(_) | Packet::CipherList(_)
        )
    }

    /// Exact body length for pre-declared frame lengths.
    pub fn body_len(&self) -> Result<usize, PacketError> {
        match self {
            Packet::Base64(p) => p.body_len(),
            Packet::Encrypted(p) => p.body_len(),
            Packet::CipherList(p) => p.body_len(),
            other => Ok(other.save_payload()?.len()),
        }
    }

    /// Streams the body to a sink; buffered variants fall back to
    /// [`save_payload`](Self::save_payload).
    pub fn write_body_to(&self, sink: &mut dyn Write) -> Result<(), PacketError> {
        match self {
            Packet::Base64(p) => p.write_body_to(sink),
            Packet::Encrypted(p) => p.write_body_to(sink),
            Packet::CipherList(p) => p.write_body_to(sink),
            other => {
                sink.write_all(&other.save_payload()?)?;
                Ok(())
            }
        }
    }

    /// Consumes a body of `len` bytes from a source; buffered variants
    /// fall back to [`load_payload`](Self::load_payload).
    pub fn read_body_from(&mut self, source: &mut dyn Read, len: usize) -> Result<(), PacketError> {
        match self {
            Packet::Base64(p) => p.read_body_from(source, len),
            Packet::Encrypted(p) => p.read_body_from(source, len),
            Packet::CipherList(p) => p.read_body_from(source, len),
            other => {
                let payload = crate::wire::read_exact_vec(source, len)?;
                other.load_payload(&payload)
            }
        }
    }

    /// Whether the packet carries a set, affirmative acknowledgement flag.
    pub fn is_acknowledgement(&self) -> bool {
        match self {
            Packet::EncryptionUpgrade(p) => p.is_acknowledgement(),
            Packet::SslUpgrade(p) => p.is_acknowledgement(),
            Packet::CipherList(p) => p.is_acknowledgement(),
            Packet::SendComplete(p) => p.is_acknowledgement(),
            Packet::RetrySend(p) => p.is_acknowledgement(),
            _ => false,
        }
    }

    /// The message key carried by fragment packets keyed on a packet-id.
    ///
    /// `Allocate` is keyed by its allocation handle instead and returns
    /// `None`, as do all non-fragment variants.
    pub fn fragment_packet_id(&self) -> Option<i32> {
        match self {
            Packet::Allocation(p) => p.packet_id,
            Packet::Message(p) => p.packet_id,
            Packet::MessageResponse(p) => p.packet_id,
            Packet::SendComplete(p) => p.packet_id,
            Packet::RetrySend(p) => p.packet_id,
            Packet::SendStop(p) => p.packet_id,
            Packet::VerifyComplete(p) => p.packet_id,
            _ => None,
        }
    }
}
