//! Packet Frame Loading and Saving
//!
//! A frame is `tag[2] ∥ length[4] ∥ payload[length]`, optionally followed
//! by a digest trailer. With a digest provider configured, the length
//! word's top bit marks the trailer and an explicit one-byte digest length
//! precedes the digest; the legacy format keeps the short length encoding
//! and appends a digest of the provider's fixed length with no marker.
//!
//! A digest mismatch consumes the whole frame and yields `Ok(None)` so the
//! stream position stays aligned for the next frame.

use crate::factory::PacketFactory;
use crate::packet::{Packet, PacketError};
use crate::tag::ProtocolTag;
use crate::wire::{self, LengthClampedReader};
use bytes::{BufMut, BytesMut};
use fraglink_crypto::{digests_equal, DigestProvider, DigestReader, DigestWriter};
use std::io::{Read, Write};
use std::sync::Arc;

/// Reads and writes packets as frames on byte slices and streams.
#[derive(Clone, Default)]
pub struct PacketLoader {
    digest: Option<Arc<dyn DigestProvider>>,
    allow_invalid: bool,
    old_format: bool,
}

impl PacketLoader {
    /// A loader with no digest trailer support.
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader appending and checking digest trailers. All endpoints must
    /// configure the same provider.
    pub fn with_digest(provider: Arc<dyn DigestProvider>) -> Self {
        PacketLoader {
            digest: Some(provider),
            allow_invalid: false,
            old_format: false,
        }
    }

    /// As [`with_digest`](Self::with_digest), using the legacy framing
    /// with no length-flag bit and an implicit digest length.
    pub fn with_digest_format(provider: Arc<dyn DigestProvider>, old_format: bool) -> Self {
        PacketLoader {
            digest: Some(provider),
            allow_invalid: false,
            old_format,
        }
    }

    pub fn digest_provider(&self) -> Option<Arc<dyn DigestProvider>> {
        self.digest.clone()
    }

    pub fn allow_invalid_packets(&self) -> bool {
        self.allow_invalid
    }

    /// When set, the post-load validity predicate is bypassed.
    pub fn set_allow_invalid_packets(&mut self, allow: bool) {
        self.allow_invalid = allow;
    }

    pub fn old_packet_format(&self) -> bool {
        self.old_format
    }

    pub fn set_old_packet_format(&mut self, old_format: bool) {
        self.old_format = old_format;
    }

    fn rejects(&self, packet: &Packet) -> bool {
        !packet.is_valid() && !self.allow_invalid
    }

    fn frame_length(len: usize) -> Result<i32, PacketError> {
        if len > wire::LENGTH_MASK as usize {
            return Err(PacketError::Malformed("payload too large for a frame"));
        }
        Ok(len as i32)
    }

    /// Serializes a packet to a standalone byte frame. No digest trailer is
    /// written on this path.
    pub fn write_to_vec(&self, packet: &Packet, include_tag: bool) -> Result<Vec<u8>, PacketError> {
        if self.rejects(packet) {
            return Err(PacketError::Invalid);
        }
        let payload = packet.save_payload()?;
        let length = Self::frame_length(payload.len())?;
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        if include_tag {
            let tag = packet.tag();
            buf.put_u8(tag.major());
            buf.put_u8(tag.minor());
        }
        buf.put_i32(length);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Writes a packet frame, appending a digest trailer when a provider
    /// is configured. Streaming-capable bodies are piped while the digest
    /// is computed in line.
    pub fn write(
        &self,
        sink: &mut dyn Write,
        packet: &Packet,
        include_tag: bool,
    ) -> Result<(), PacketError> {
        if self.rejects(packet) {
            return Err(PacketError::Invalid);
        }
        if include_tag {
            packet.tag().write_to(sink)?;
        }
        match &self.digest {
            Some(provider) => {
                if packet.supports_streaming() {
                    let body_len = Self::frame_length(packet.body_len()?)?;
                    let word = if self.old_format {
                        body_len
                    } else {
                        wire::set_length_flag(body_len)
                    };
                    wire::write_i32(sink, word)?;
                    let mut hashing = DigestWriter::new(&mut *sink, provider.as_ref());
                    packet.write_body_to(&mut hashing)?;
                    let (_, digest) = hashing.finish();
                    self.write_trailer(sink, &digest)?;
                } else {
                    let payload = packet.save_payload()?;
                    let length = Self::frame_length(payload.len())?;
                    let word = if self.old_format {
                        length
                    } else {
                        wire::set_length_flag(length)
                    };
                    wire::write_i32(sink, word)?;
                    sink.write_all(&payload)?;
                    let digest = provider.digest_of(&payload);
                    self.write_trailer(sink, &digest)?;
                }
            }
            None => {
                self.write_frame_plain(sink, packet)?;
            }
        }
        sink.flush()?;
        Ok(())
    }

    /// Writes a packet frame with no digest trailer regardless of the
    /// configured provider.
    pub fn write_no_digest(
        &self,
        sink: &mut dyn Write,
        packet: &Packet,
        include_tag: bool,
    ) -> Result<(), PacketError> {
        if self.rejects(packet) {
            return Err(PacketError::Invalid);
        }
        if include_tag {
            packet.tag().write_to(sink)?;
        }
        self.write_frame_plain(sink, packet)?;
        sink.flush()?;
        Ok(())
    }

    fn write_frame_plain(&self, sink: &mut dyn Write, packet: &Packet) -> Result<(), PacketError> {
        if packet.supports_streaming() {
            let body_len = Self::frame_length(packet.body_len()?)?;
            wire::write_i32(sink, body_len)?;
            packet.write_body_to(sink)
        } else {
            let payload = packet.save_payload()?;
            wire::write_i32(sink, Self::frame_length(payload.len())?)?;
            sink.write_all(&payload)?;
            Ok(())
        }
    }

    fn write_trailer(&self, sink: &mut dyn Write, digest: &[u8]) -> Result<(), PacketError> {
        if !self.old_format {
            if digest.len() > u8::MAX as usize {
                return Err(PacketError::Malformed("digest longer than 255 bytes"));
            }
            sink.write_all(&[digest.len() as u8])?;
        }
        sink.write_all(digest)?;
        Ok(())
    }

    fn read_length(&self, source: &mut dyn Read) -> Result<(usize, bool), PacketError> {
        let word = wire::read_i32(source)?;
        let has_digest = wire::has_length_flag(word);
        let length = if has_digest {
            wire::clear_length_flag(word)
        } else {
            word
        };
        Ok((length as usize, has_digest))
    }

    /// Consumes and discards the remainder of a frame whose tag the
    /// factory rejected.
    fn skip_frame(&self, source: &mut dyn Read) -> Result<(), PacketError> {
        let (length, has_digest) = self.read_length(source)?;
        wire::skip_exact(source, length)?;
        if has_digest {
            let digest_len = wire::read_byte(source)? as usize;
            wire::skip_exact(source, digest_len)?;
        } else if self.old_format {
            if let Some(provider) = &self.digest {
                wire::skip_exact(source, provider.digest_len())?;
            }
        }
        Ok(())
    }

    /// Reads one frame, returning the decoded packet, or `None` when the
    /// factory rejects the tag, the digest mismatches, or the packet fails
    /// the validity predicate. All three consume the full frame.
    pub fn read(
        &self,
        source: &mut dyn Read,
        factory: &PacketFactory,
        tag: Option<ProtocolTag>,
    ) -> Result<Option<Packet>, PacketError> {
        let tag = match tag {
            Some(tag) => tag,
            None => ProtocolTag::read_from(source)?,
        };
        let Some(mut packet) = factory.get_packet(tag) else {
            self.skip_frame(source)?;
            return Ok(None);
        };
        let (length, has_digest) = self.read_length(source)?;

        match (&self.digest, has_digest) {
            (Some(provider), true) => {
                let mut hashing = DigestReader::new(&mut *source, provider.as_ref());
                let payload = wire::read_exact_vec(&mut hashing, length)?;
                let (_, computed) = hashing.finish();
                let digest_len = wire::read_byte(source)? as usize;
                if digest_len != provider.digest_len() {
                    wire::skip_exact(source, digest_len)?;
                    return Ok(None);
                }
                let trailer = wire::read_exact_vec(source, digest_len)?;
                if !digests_equal(&trailer, &computed) {
                    tracing::debug!(%tag, "digest mismatch, frame dropped");
                    return Ok(None);
                }
                packet.load_payload(&payload)?;
            }
            (None, true) => {
                // No provider to check against; consume the trailer blind.
                let payload = wire::read_exact_vec(source, length)?;
                let digest_len = wire::read_byte(source)? as usize;
                wire::skip_exact(source, digest_len)?;
                packet.load_payload(&payload)?;
            }
            (Some(provider), false) if self.old_format => {
                let mut hashing = DigestReader::new(&mut *source, provider.as_ref());
                let payload = wire::read_exact_vec(&mut hashing, length)?;
                let (_, computed) = hashing.finish();
                let trailer = wire::read_exact_vec(source, provider.digest_len())?;
                if !digests_equal(&trailer, &computed) {
                    tracing::debug!(%tag, "digest mismatch, frame dropped");
                    return Ok(None);
                }
                packet.load_payload(&payload)?;
            }
            _ => {
                let payload = wire::read_exact_vec(source, length)?;
                packet.load_payload(&payload)?;
            }
        }

        if self.rejects(&packet) {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Reads one frame expecting no digest trailer regardless of the
    /// configured provider; a flagged length word is still tolerated.
    pub fn read_no_digest(
        &self,
        source: &mut dyn Read,
        factory: &PacketFactory,
        tag: Option<ProtocolTag>,
    ) -> Result<Option<Packet>, PacketError> {
        let tag = match tag {
            Some(tag) => tag,
            None => ProtocolTag::read_from(source)?,
        };
        let Some(mut packet) = factory.get_packet(tag) else {
            let (length, _) = self.read_length(source)?;
            wire::skip_exact(source, length)?;
            return Ok(None);
        };
        let (length, _) = self.read_length(source)?;
        let payload = wire::read_exact_vec(source, length)?;
        packet.load_payload(&payload)?;
        if self.rejects(&packet) {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// As [`read`](Self::read), but a streaming-capable packet consumes
    /// its body directly from the stream instead of through a buffered
    /// payload.
    pub fn read_streamed(
        &self,
        source: &mut dyn Read,
        factory: &PacketFactory,
        tag: Option<ProtocolTag>,
    ) -> Result<Option<Packet>, PacketError> {
        let tag = match tag {
            Some(tag) => tag,
            None => ProtocolTag::read_from(source)?,
        };
        let Some(mut packet) = factory.get_packet(tag) else {
            self.skip_frame(source)?;
            return Ok(None);
        };
        if !packet.supports_streaming() {
            return self.read(source, factory, Some(tag));
        }
        let (length, has_digest) = self.read_length(source)?;

        let checked_provider = self
            .digest
            .as_ref()
            .filter(|_| has_digest || self.old_format)
            .map(Arc::clone);
        if let Some(provider) = checked_provider {
            let clamped = LengthClampedReader::new(&mut *source, length);
            let mut hashing = DigestReader::new(clamped, provider.as_ref());
            packet.read_body_from(&mut hashing, length)?;
            // Hash whatever of the body the packet left unread.
            let mut rest = Vec::new();
            hashing.read_to_end(&mut rest)?;
            let (_, computed) = hashing.finish();
            if has_digest {
                let digest_len = wire::read_byte(source)? as usize;
                if digest_len != provider.digest_len() {
                    wire::skip_exact(source, digest_len)?;
                    return Ok(None);
                }
            }
            let trailer = wire::read_exact_vec(source, provider.digest_len())?;
            if !digests_equal(&trailer, &computed) {
                tracing::debug!(%tag, "digest mismatch, frame dropped");
                return Ok(None);
            }
        } else {
            let mut clamped = LengthClampedReader::new(&mut *source, length);
            packet.read_body_from(&mut clamped, length)?;
            let mut rest = Vec::new();
            clamped.read_to_end(&mut rest)?;
            if has_digest {
                let digest_len = wire::read_byte(source)? as usize;
                wire::skip_exact(source, digest_len)?;
            }
        }

        if self.rejects(&packet) {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// As [`read_no_digest`](Self::read_no_digest) with the streaming body
    /// path for streaming-capable packets.
    pub fn read_streamed_no_digest(
        &self,
        source: &mut dyn Read,
        factory: &PacketFactory,
        tag: Option<ProtocolTag>,
    ) -> Result<Option<Packet>, PacketError> {
        let tag = match tag {
            Some(tag) => tag,
            None => ProtocolTag::read_from(source)?,
        };
        let Some(mut packet) = factory.get_packet(tag) else {
            let (length, _) = self.read_length(source)?;
            wire::skip_exact(source, length)?;
            return Ok(None);
        };
        let (length, _) = self.read_length(source)?;
        if packet.supports_streaming() {
            let mut clamped = LengthClampedReader::new(&mut *source, length);
            packet.read_body_from(&mut clamped, length)?;
            let mut rest = Vec::new();
            clamped.read_to_end(&mut rest)?;
        } else {
            let payload = wire::read_exact_vec(source, length)?;
            packet.load_payload(&payload)?;
        }
        if self.rejects(&packet) {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Decodes one frame from a byte slice. No digest trailer is expected
    /// on this path; trailing bytes beyond the frame are ignored.
    pub fn read_from_slice(
        &self,
        data: &[u8],
        factory: &PacketFactory,
        tag: Option<ProtocolTag>,
    ) -> Result<Option<Packet>, PacketError> {
        let mut offset = 0;
        let tag = match tag {
            Some(tag) => tag,
            None => {
                if data.len() < 2 {
                    return Err(PacketError::Malformed("slice has no tag header"));
                }
                offset = 2;
                ProtocolTag::new(data[0], data[1])
            }
        };
        let Some(mut packet) = factory.get_packet(tag) else {
            return Ok(None);
        };
        if data.len() < offset + 4 {
            return Err(PacketError::Malformed("slice has no length header"));
        }
        let word = wire::i32_from_slice(&data[offset..offset + 4])?;
        let length = if wire::has_length_flag(word) {
            wire::clear_length_flag(word)
        } else {
            word
        } as usize;
        offset += 4;
        if data.len() < offset + length {
            return Err(PacketError::UnexpectedEnd);
        }
        packet.load_payload(&data[offset..offset + length])?;
        if self.rejects(&packet) {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Exact size of the frame [`write`](Self::write) would produce.
    pub fn size_of(
        &self,
        packet: &Packet,
        include_tag: bool,
        ignore_digest: bool,
    ) -> Result<usize, PacketError> {
        let body = if packet.supports_streaming() {
            packet.body_len()?
        } else {
            packet.save_payload()?.len()
        };
        let trailer = match &self.digest {
            Some(provider) if !ignore_digest => {
                if self.old_format {
                    provider.digest_len()
                } else {
                    1 + provider.digest_len()
                }
            }
            _ => 0,
        };
        Ok(4 + if include_tag { 2 } else { 0 } + body + trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IdentifierPacket;
    use crate::fragment::SendStopPacket;
    use crate::tag::tags;
    use fraglink_crypto::Sha256Provider;

    fn plain_loader_factory() -> (PacketLoader, PacketFactory) {
        let loader = PacketLoader::new();
        let factory = PacketFactory::new(false, loader.clone());
        (loader, factory)
    }

    #[test]
    fn test_short_frame_literal_bytes() {
        let (loader, _) = plain_loader_factory();
        let packet = Packet::SendStop(SendStopPacket::new(7));
        let frame = loader.write_to_vec(&packet, true).unwrap();
        assert_eq!(
            frame,
            [0xFE, 0x07, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07]
        );
    }

    #[test]
    fn test_frame_self_description() {
        let (loader, factory) = plain_loader_factory();
        let packet = Packet::Identifier(IdentifierPacket::new("abc"));
        let frame = loader.write_to_vec(&packet, true).unwrap();

        let decoded = loader
            .read(&mut frame.as_slice(), &factory, None)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_stream_write_then_read() {
        let (loader, factory) = plain_loader_factory();
        let packet = Packet::SendStop(SendStopPacket::new(3));

        let mut wire_bytes = Vec::new();
        loader.write(&mut wire_bytes, &packet, true).unwrap();
        let decoded = loader
            .read(&mut wire_bytes.as_slice(), &factory, None)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_digested_frame_roundtrip() {
        let loader = PacketLoader::with_digest(Arc::new(Sha256Provider));
        let factory = PacketFactory::new(false, loader.clone());
        let packet = Packet::Identifier(IdentifierPacket::new("digested"));

        let mut wire_bytes = Vec::new();
        loader.write(&mut wire_bytes, &packet, true).unwrap();
        // tag(2) + length(4) + payload(8) + digest-len(1) + digest(32)
        assert_eq!(wire_bytes.len(), 2 + 4 + 8 + 1 + 32);
        assert_eq!(
            loader.size_of(&packet, true, false).unwrap(),
            wire_bytes.len()
        );
        // Length word carries the digest marker.
        assert!(wire_bytes[2] & 0x80 != 0);

        let decoded = loader
            .read(&mut wire_bytes.as_slice(), &factory, None)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_digest_mismatch_consumes_frame() {
        let loader = PacketLoader::with_digest(Arc::new(Sha256Provider));
        let factory = PacketFactory::new(false, loader.clone());

        let mut wire_bytes = Vec::new();
        loader
            .write(
                &mut wire_bytes,
                &Packet::Identifier(IdentifierPacket::new("first")),
                true,
            )
            .unwrap();
        // Flip a payload bit after the digest was computed.
        wire_bytes[7] ^= 0x01;
        let second = Packet::SendStop(SendStopPacket::new(11));
        loader.write(&mut wire_bytes, &second, true).unwrap();

        let mut source = wire_bytes.as_slice();
        assert!(loader.read(&mut source, &factory, None).unwrap().is_none());
        // The next frame on the same stream reads cleanly.
        let decoded = loader.read(&mut source, &factory, None).unwrap().unwrap();
        assert_eq!(decoded, second);
        assert!(source.is_empty());
    }

    #[test]
    fn test_legacy_format_roundtrip_and_verification() {
        let loader = PacketLoader::with_digest_format(Arc::new(Sha256Provider), true);
        let factory = PacketFactory::new(false, loader.clone());
        let packet = Packet::Identifier(IdentifierPacket::new("legacy"));

        let mut wire_bytes = Vec::new();
        loader.write(&mut wire_bytes, &packet, true).unwrap();
        // No flag bit, no digest length byte.
        assert_eq!(wire_bytes.len(), 2 + 4 + 6 + 32);
        assert!(wire_bytes[2] & 0x80 == 0);
        assert_eq!(
            loader.size_of(&packet, true, false).unwrap(),
            wire_bytes.len()
        );

        let decoded = loader
            .read(&mut wire_bytes.as_slice(), &factory, None)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);

        // Corruption is still caught in the legacy format.
        let mut corrupted = Vec::new();
        loader.write(&mut corrupted, &packet, true).unwrap();
        corrupted[7] ^= 0x40;
        assert!(loader
            .read(&mut corrupted.as_slice(), &factory, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unknown_tag_skips_frame() {
        let (loader, factory) = plain_loader_factory();
        let mut wire_bytes = vec![9, 9, 0, 0, 0, 2, 0xAA, 0xBB];
        let follow_on = Packet::SendStop(SendStopPacket::new(1));
        wire_bytes.extend(loader.write_to_vec(&follow_on, true).unwrap());

        let mut source = wire_bytes.as_slice();
        assert!(loader.read(&mut source, &factory, None).unwrap().is_none());
        let decoded = loader.read(&mut source, &factory, None).unwrap().unwrap();
        assert_eq!(decoded, follow_on);
    }

    #[test]
    fn test_invalid_packet_rejected_unless_allowed() {
        let (mut loader, factory) = plain_loader_factory();
        // An SSL upgrade frame whose boolean byte is out of discipline.
        let wire_bytes = [0xFF, 0xFE, 0x00, 0x00, 0x00, 0x01, 0x05];
        assert!(loader
            .read(&mut wire_bytes.as_slice(), &factory, None)
            .unwrap()
            .is_none());

        loader.set_allow_invalid_packets(true);
        let decoded = loader
            .read(&mut wire_bytes.as_slice(), &factory, None)
            .unwrap()
            .unwrap();
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_write_rejects_invalid_packet() {
        let (loader, _) = plain_loader_factory();
        let packet = Packet::SslUpgrade(crate::core::SslUpgradePacket::empty());
        assert!(matches!(
            loader.write_to_vec(&packet, true),
            Err(PacketError::Invalid)
        ));
    }

    #[test]
    fn test_truncated_frame_is_unexpected_end() {
        let (loader, factory) = plain_loader_factory();
        let packet = Packet::SendStop(SendStopPacket::new(1));
        let frame = loader.write_to_vec(&packet, true).unwrap();
        let err = loader
            .read(&mut frame[..frame.len() - 1].as_ref(), &factory, None)
            .unwrap_err();
        assert!(matches!(err, PacketError::UnexpectedEnd));
    }

    #[test]
    fn test_read_from_slice_with_out_of_band_tag() {
        let (loader, factory) = plain_loader_factory();
        let packet = Packet::SendStop(SendStopPacket::new(2));
        let frame = loader.write_to_vec(&packet, false).unwrap();
        let decoded = loader
            .read_from_slice(&frame, &factory, Some(tags::FRAGMENT_SEND_STOP))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_size_of_short_frame() {
        let (loader, _) = plain_loader_factory();
        let packet = Packet::SendStop(SendStopPacket::new(7));
        assert_eq!(loader.size_of(&packet, true, false).unwrap(), 10);
        assert_eq!(loader.size_of(&packet, false, false).unwrap(), 8);
    }
}
