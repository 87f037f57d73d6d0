//! Protocol Tags
//!
//! Every packet variant is identified by a two-byte (major, minor) tag
//! written ahead of the frame length. Major 254 is the fragment protocol;
//! major 255 carries the session signalling and envelope variants.

use crate::packet::PacketError;
use crate::wire;
use std::fmt;
use std::io::{Read, Write};

/// Two-byte packet variant identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolTag {
    major: u8,
    minor: u8,
}

impl ProtocolTag {
    pub const fn new(major: u8, minor: u8) -> Self {
        ProtocolTag { major, minor }
    }

    #[inline]
    pub fn major(self) -> u8 {
        self.major
    }

    #[inline]
    pub fn minor(self) -> u8 {
        self.minor
    }

    /// Reads a tag from a stream: major byte then minor byte.
    pub fn read_from<R: Read + ?Sized>(source: &mut R) -> Result<Self, PacketError> {
        let major = wire::read_byte(source)?;
        let minor = wire::read_byte(source)?;
        Ok(ProtocolTag { major, minor })
    }

    /// Writes a tag to a stream: major byte then minor byte.
    pub fn write_to<W: Write + ?Sized>(self, sink: &mut W) -> Result<(), PacketError> {
        sink.write_all(&[self.major, self.minor])?;
        Ok(())
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.major, self.minor)
    }
}

/// The closed set of recognized tags.
pub mod tags {
    use super::ProtocolTag;

    pub const CIPHER_LIST: ProtocolTag = ProtocolTag::new(255, 250);
    pub const BASE64: ProtocolTag = ProtocolTag::new(255, 251);
    pub const ENCRYPTED: ProtocolTag = ProtocolTag::new(255, 252);
    pub const ENCRYPTION_UPGRADE: ProtocolTag = ProtocolTag::new(255, 253);
    pub const SSL_UPGRADE: ProtocolTag = ProtocolTag::new(255, 254);
    pub const IDENTIFIER: ProtocolTag = ProtocolTag::new(255, 255);

    pub const FRAGMENT_ALLOCATE: ProtocolTag = ProtocolTag::new(254, 1);
    pub const FRAGMENT_ALLOCATION: ProtocolTag = ProtocolTag::new(254, 2);
    pub const FRAGMENT_MESSAGE: ProtocolTag = ProtocolTag::new(254, 3);
    pub const FRAGMENT_MESSAGE_RESPONSE: ProtocolTag = ProtocolTag::new(254, 4);
    pub const FRAGMENT_SEND_COMPLETE: ProtocolTag = ProtocolTag::new(254, 5);
    pub const FRAGMENT_RETRY_SEND: ProtocolTag = ProtocolTag::new(254, 6);
    pub const FRAGMENT_SEND_STOP: ProtocolTag = ProtocolTag::new(254, 7);
    pub const FRAGMENT_VERIFY_COMPLETE: ProtocolTag = ProtocolTag::new(254, 8);
}
