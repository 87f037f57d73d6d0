//! Envelope and Signalling Packets
//!
//! Envelope variants (`Base64Packet`, `EncryptedPacket`) carry another
//! packet's complete frame as their body, transformed. They hold
//! cheap-clone handles to a factory and loader for parsing the inner
//! frame, an optional internal cache of the encoded body, and both a
//! whole-buffer and a streaming body path.
//!
//! Signalling variants negotiate transport upgrades: SSL, cipher
//! selection, encryption upgrade with settings exchange, and peer
//! identification.

use crate::factory::PacketFactory;
use crate::loader::PacketLoader;
use crate::packet::{bool_from_byte, bool_to_byte, Packet, PacketError};
use crate::wire::{self, LengthClampedReader};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use fraglink_crypto::{CipherFactory, CipherMode, CipherReader, CipherWriter};
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Envelope wrapping another packet's frame in base64.
pub struct Base64Packet {
    factory: PacketFactory,
    loader: PacketLoader,
    held: Option<Box<Packet>>,
    cache: Mutex<Option<Vec<u8>>>,
    use_cache: bool,
}

impl Base64Packet {
    pub fn new(
        factory: PacketFactory,
        loader: PacketLoader,
        held: Option<Packet>,
        use_cache: bool,
    ) -> Self {
        Base64Packet {
            factory,
            loader,
            held: held.map(Box::new),
            cache: Mutex::new(None),
            use_cache,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.held.is_some()
    }

    fn encode_inner(&self) -> Result<Vec<u8>, PacketError> {
        let held = self
            .held
            .as_deref()
            .ok_or(PacketError::MissingField("held packet"))?;
        let framed = self.loader.write_to_vec(held, true)?;
        Ok(BASE64_STANDARD.encode(framed).into_bytes())
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        if self.use_cache {
            let mut cache = self.cache.lock();
            if cache.is_none() {
                *cache = Some(self.encode_inner()?);
            }
            Ok(cache.clone().unwrap_or_default())
        } else {
            self.encode_inner()
        }
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let framed = BASE64_STANDARD
            .decode(data)
            .map_err(|_| PacketError::Malformed("invalid base64 body"))?;
        self.held = self
            .loader
            .read_from_slice(&framed, &self.factory, None)?
            .map(Box::new);
        *self.cache.lock() = if self.use_cache {
            Some(data.to_vec())
        } else {
            None
        };
        Ok(())
    }

    pub fn body_len(&self) -> Result<usize, PacketError> {
        if self.use_cache {
            return Ok(self.save_payload()?.len());
        }
        let held = self
            .held
            .as_deref()
            .ok_or(PacketError::MissingField("held packet"))?;
        let framed_len = self.loader.size_of(held, true, true)?;
        Ok(framed_len.div_ceil(3) * 4)
    }

    pub fn write_body_to(&self, sink: &mut dyn Write) -> Result<(), PacketError> {
        if self.use_cache {
            sink.write_all(&self.save_payload()?)?;
            return Ok(());
        }
        let held = self
            .held
            .as_deref()
            .ok_or(PacketError::MissingField("held packet"))?;
        let mut encoder = base64::write::EncoderWriter::new(&mut *sink, &BASE64_STANDARD);
        self.loader.write_no_digest(&mut encoder, held, true)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn read_body_from(&mut self, source: &mut dyn Read, len: usize) -> Result<(), PacketError> {
        let clamped = LengthClampedReader::new(source, len);
        let mut decoder = base64::read::DecoderReader::new(clamped, &BASE64_STANDARD);
        self.held = self
            .loader
            .read_streamed_no_digest(&mut decoder, &self.factory, None)?
            .map(Box::new);
        *self.cache.lock() = None;
        Ok(())
    }

    pub fn held_packet(&self) -> Option<&Packet> {
        self.held.as_deref()
    }

    /// Takes the inner packet out of the envelope.
    pub fn take_held_packet(&mut self) -> Option<Packet> {
        *self.cache.lock() = None;
        self.held.take().map(|boxed| *boxed)
    }

    pub fn set_held_packet(&mut self, packet: Option<Packet>) {
        *self.cache.lock() = None;
        self.held = packet.map(Box::new);
    }

    pub fn is_cache_used(&self) -> bool {
        self.use_cache
    }

    pub fn set_cache_used(&mut self, used: bool) {
        self.use_cache = used;
        if !used {
            *self.cache.lock() = None;
        }
    }

    pub fn set_loader(&mut self, loader: PacketLoader) {
        self.loader = loader;
    }

    pub fn set_factory(&mut self, factory: PacketFactory) {
        self.factory = factory;
    }
}

impl Clone for Base64Packet {
    fn clone(&self) -> Self {
        Base64Packet {
            factory: self.factory.clone(),
            loader: self.loader.clone(),
            held: self.held.clone(),
            cache: Mutex::new(self.cache.lock().clone()),
            use_cache: self.use_cache,
        }
    }
}

impl PartialEq for Base64Packet {
    fn eq(&self, other: &Self) -> bool {
        self.held == other.held
    }
}

impl fmt::Debug for Base64Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Base64Packet")
            .field("held", &self.held)
            .field("use_cache", &self.use_cache)
            .finish()
    }
}

struct EncryptedCache {
    ciphertext: Option<Vec<u8>>,
    trailer_len: usize,
}

/// Envelope wrapping another packet's frame in a cipher, with an optional
/// trailing password inside the plaintext.
///
/// Body layout: `trailer-flag[1] ∥ settings-len[4] ∥ settings ∥
/// opt(trailer-len[4]) ∥ ciphertext`. The settings blob is the cipher
/// factory's no-secrets form; the plaintext is the framed inner packet
/// followed by the optional UTF-8 trailer.
pub struct EncryptedPacket {
    factory: PacketFactory,
    loader: PacketLoader,
    cipher_factory: Arc<dyn CipherFactory>,
    held: Option<Box<Packet>>,
    trailing_password: Option<String>,
    cache: Mutex<EncryptedCache>,
    use_cache: bool,
}

impl EncryptedPacket {
    pub fn new(
        factory: PacketFactory,
        loader: PacketLoader,
        cipher_factory: Arc<dyn CipherFactory>,
        held: Option<Packet>,
        use_cache: bool,
    ) -> Self {
        EncryptedPacket {
            factory,
            loader,
            cipher_factory,
            held: held.map(Box::new),
            trailing_password: None,
            cache: Mutex::new(EncryptedCache {
                ciphertext: None,
                trailer_len: 0,
            }),
            use_cache,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.held.is_some()
    }

    fn trailer_bytes(&self) -> &[u8] {
        self.trailing_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(str::as_bytes)
            .unwrap_or_default()
    }

    /// Rebuilds the ciphertext cache if absent or the cipher settings
    /// changed since it was built.
    fn refresh_ciphertext(&self, cache: &mut EncryptedCache) -> Result<Vec<u8>, PacketError> {
        if cache.ciphertext.is_none() || self.cipher_factory.attributes_modified() {
            let held = self
                .held
                .as_deref()
                .ok_or(PacketError::MissingField("held packet"))?;
            let mut plain = self.loader.write_to_vec(held, true)?;
            let trailer = self.trailer_bytes();
            cache.trailer_len = trailer.len();
            plain.extend_from_slice(trailer);
            let mut cipher = self.cipher_factory.cipher(CipherMode::Encrypt)?;
            let mut ciphertext = cipher.update(&plain)?;
            ciphertext.extend(cipher.finish()?);
            cache.ciphertext = Some(ciphertext);
        }
        Ok(cache.ciphertext.clone().unwrap_or_default())
    }

    fn put_header(
        &self,
        buf: &mut BytesMut,
        settings: &[u8],
        trailer_len: usize,
    ) -> Result<(), PacketError> {
        buf.put_u8(u8::from(trailer_len > 0));
        buf.put_i32(settings.len() as i32);
        buf.put_slice(settings);
        if trailer_len > 0 {
            buf.put_i32(trailer_len as i32);
        }
        Ok(())
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let mut cache = self.cache.lock();
        let ciphertext = self.refresh_ciphertext(&mut cache)?;
        let settings = self.cipher_factory.settings_no_secrets()?;
        let mut buf = BytesMut::with_capacity(9 + settings.len() + ciphertext.len());
        self.put_header(&mut buf, &settings, cache.trailer_len)?;
        buf.put_slice(&ciphertext);
        if !self.use_cache {
            cache.ciphertext = None;
        }
        Ok(buf.to_vec())
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() < 5 {
            return Err(PacketError::Malformed("encrypted body shorter than header"));
        }
        let mut buf = data;
        let flag = buf.get_u8();
        let settings_len = buf.get_i32();
        if settings_len < 1 {
            return Err(PacketError::Malformed("cipher settings length less than 1"));
        }
        let settings_len = settings_len as usize;
        if buf.remaining() < settings_len {
            return Err(PacketError::Malformed("encrypted body truncated in settings"));
        }
        self.cipher_factory.apply_settings(&buf[..settings_len])?;
        buf.advance(settings_len);

        let mut trailer_len = 0usize;
        if flag & 1 == 1 {
            if buf.remaining() < 4 {
                return Err(PacketError::Malformed("encrypted body truncated in trailer length"));
            }
            let raw = buf.get_i32();
            if raw < 1 {
                return Err(PacketError::Malformed("trailer length less than 1"));
            }
            trailer_len = raw as usize;
        }

        let ciphertext = buf.to_vec();
        let mut cipher = self.cipher_factory.cipher(CipherMode::Decrypt)?;
        let mut plain = cipher.update(&ciphertext)?;
        plain.extend(cipher.finish()?);
        if plain.len() < trailer_len {
            return Err(PacketError::Malformed("trailer longer than plaintext"));
        }
        let split = plain.len() - trailer_len;
        if trailer_len > 0 {
            self.trailing_password = Some(wire::utf8_from_bytes(&plain[split..])?);
        }
        self.held = self
            .loader
            .read_from_slice(&plain[..split], &self.factory, None)?
            .map(Box::new);

        let mut cache = self.cache.lock();
        cache.trailer_len = trailer_len;
        cache.ciphertext = if self.use_cache { Some(ciphertext) } else { None };
        Ok(())
    }

    pub fn body_len(&self) -> Result<usize, PacketError> {
        let settings_len = self.cipher_factory.settings_no_secrets_len();
        if self.use_cache {
            let mut cache = self.cache.lock();
            let ciphertext = self.refresh_ciphertext(&mut cache)?;
            let trailer_field = if cache.trailer_len > 0 { 4 } else { 0 };
            return Ok(5 + settings_len + trailer_field + ciphertext.len());
        }
        let held = self
            .held
            .as_deref()
            .ok_or(PacketError::MissingField("held packet"))?;
        let trailer_len = self.trailer_bytes().len();
        let trailer_field = if trailer_len > 0 { 4 } else { 0 };
        let cipher = self.cipher_factory.cipher(CipherMode::Encrypt)?;
        let inner_len = self.loader.size_of(held, true, true)?;
        Ok(5 + settings_len + trailer_field + cipher.output_len(inner_len + trailer_len))
    }

    pub fn write_body_to(&self, sink: &mut dyn Write) -> Result<(), PacketError> {
        let settings = self.cipher_factory.settings_no_secrets()?;
        if self.use_cache {
            let mut cache = self.cache.lock();
            let ciphertext = self.refresh_ciphertext(&mut cache)?;
            let mut header = BytesMut::new();
            self.put_header(&mut header, &settings, cache.trailer_len)?;
            sink.write_all(&header)?;
            sink.write_all(&ciphertext)?;
            return Ok(());
        }
        let held = self
            .held
            .as_deref()
            .ok_or(PacketError::MissingField("held packet"))?;
        let trailer = self.trailer_bytes().to_vec();
        let mut header = BytesMut::new();
        self.put_header(&mut header, &settings, trailer.len())?;
        sink.write_all(&header)?;
        let cipher = self.cipher_factory.cipher(CipherMode::Encrypt)?;
        let mut ciphered = CipherWriter::new(&mut *sink, cipher);
        self.loader.write_no_digest(&mut ciphered, held, true)?;
        if !trailer.is_empty() {
            ciphered.write_all(&trailer)?;
        }
        ciphered.finish()?;
        Ok(())
    }

    pub fn read_body_from(&mut self, source: &mut dyn Read, len: usize) -> Result<(), PacketError> {
        if len < 5 {
            return Err(PacketError::UnexpectedEnd);
        }
        let flag = wire::read_byte(source)?;
        let settings_len_raw = wire::read_i32(source)?;
        if settings_len_raw < 1 {
            return Err(PacketError::Malformed("cipher settings length less than 1"));
        }
        let settings_len = settings_len_raw as usize;
        if len < 5 + settings_len {
            return Err(PacketError::UnexpectedEnd);
        }
        let settings = wire::read_exact_vec(source, settings_len)?;
        self.cipher_factory.apply_settings(&settings)?;
        let mut consumed = 5 + settings_len;

        let mut trailer_len = 0usize;
        if flag & 1 == 1 {
            if len < consumed + 4 {
                return Err(PacketError::UnexpectedEnd);
            }
            let raw = wire::read_i32(source)?;
            if raw < 1 {
                return Err(PacketError::Malformed("trailer length less than 1"));
            }
            trailer_len = raw as usize;
            consumed += 4;
        }

        let cipher = self.cipher_factory.cipher(CipherMode::Decrypt)?;
        let clamped = LengthClampedReader::new(source, len - consumed);
        let mut deciphered = CipherReader::new(clamped, cipher);
        self.held = self
            .loader
            .read_streamed_no_digest(&mut deciphered, &self.factory, None)?
            .map(Box::new);
        if trailer_len > 0 {
            let trailer = wire::read_exact_vec(&mut deciphered, trailer_len)?;
            self.trailing_password = Some(wire::utf8_from_bytes(&trailer)?);
        }

        let mut cache = self.cache.lock();
        cache.trailer_len = trailer_len;
        cache.ciphertext = None;
        Ok(())
    }

    pub fn held_packet(&self) -> Option<&Packet> {
        self.held.as_deref()
    }

    /// Takes the inner packet out of the envelope.
    pub fn take_held_packet(&mut self) -> Option<Packet> {
        self.cache.lock().ciphertext = None;
        self.held.take().map(|boxed| *boxed)
    }

    pub fn set_held_packet(&mut self, packet: Option<Packet>) {
        self.cache.lock().ciphertext = None;
        self.held = packet.map(Box::new);
    }

    pub fn trailing_password(&self) -> Option<&str> {
        self.trailing_password.as_deref()
    }

    pub fn set_trailing_password(&mut self, password: Option<String>) {
        self.cache.lock().ciphertext = None;
        self.trailing_password = password;
    }

    pub fn cipher_factory(&self) -> Arc<dyn CipherFactory> {
        self.cipher_factory.clone()
    }

    pub fn set_cipher_factory(&mut self, cipher_factory: Arc<dyn CipherFactory>) {
        self.cache.lock().ciphertext = None;
        self.cipher_factory = cipher_factory;
    }

    pub fn is_cache_used(&self) -> bool {
        self.use_cache
    }

    pub fn set_cache_used(&mut self, used: bool) {
        self.use_cache = used;
        if !used {
            self.cache.lock().ciphertext = None;
        }
    }

    pub fn set_loader(&mut self, loader: PacketLoader) {
        self.loader = loader;
    }

    pub fn set_factory(&mut self, factory: PacketFactory) {
        self.factory = factory;
    }
}

impl Clone for EncryptedPacket {
    fn clone(&self) -> Self {
        let cache = self.cache.lock();
        EncryptedPacket {
            factory: self.factory.clone(),
            loader: self.loader.clone(),
            cipher_factory: self.cipher_factory.clone(),
            held: self.held.clone(),
            trailing_password: self.trailing_password.clone(),
            cache: Mutex::new(EncryptedCache {
                ciphertext: cache.ciphertext.clone(),
                trailer_len: cache.trailer_len,
            }),
            use_cache: self.use_cache,
        }
    }
}

impl PartialEq for EncryptedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.held == other.held && self.trailing_password == other.trailing_password
    }
}

impl fmt::Debug for EncryptedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPacket")
            .field("held", &self.held)
            .field("has_trailing_password", &self.trailing_password.is_some())
            .field("use_cache", &self.use_cache)
            .finish()
    }
}

/// Signals an encryption upgrade or cipher mode change, optionally
/// carrying a cipher settings blob.
///
/// Body: `ack[1] ∥ flags[1]` with bit 0 = upgrade (vs mode change) and
/// bit 1 = base64 framing in use, followed by the settings blob when a
/// cipher factory is attached.
pub struct EncryptionUpgradePacket {
    acknowledgement: Option<bool>,
    upgrade: bool,
    base64ed: bool,
    cipher_factory: Option<Arc<dyn CipherFactory>>,
    send_secrets: bool,
}

impl EncryptionUpgradePacket {
    pub fn new(
        acknowledgement: Option<bool>,
        upgrade: bool,
        base64ed: bool,
        cipher_factory: Option<Arc<dyn CipherFactory>>,
    ) -> Self {
        EncryptionUpgradePacket {
            acknowledgement,
            upgrade,
            base64ed,
            cipher_factory,
            send_secrets: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.acknowledgement.is_some()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.acknowledgement == Some(true)
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let ack = self
            .acknowledgement
            .ok_or(PacketError::MissingField("acknowledgement"))?;
        let settings = match &self.cipher_factory {
            Some(factory) if self.send_secrets => Some(factory.settings()?),
            Some(factory) => Some(factory.settings_no_secrets()?),
            None => None,
        };
        let settings = settings.unwrap_or_default();
        let mut buf = BytesMut::with_capacity(2 + settings.len());
        buf.put_u8(bool_to_byte(ack));
        buf.put_u8(u8::from(self.upgrade) | (u8::from(self.base64ed) << 1));
        buf.put_slice(&settings);
        Ok(buf.to_vec())
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() < 2 {
            return Err(PacketError::Malformed("upgrade body shorter than 2 bytes"));
        }
        self.acknowledgement = bool_from_byte(data[0]);
        self.upgrade = data[1] & 1 == 1;
        self.base64ed = data[1] & 2 == 2;
        if let Some(factory) = &self.cipher_factory {
            if data.len() > 2 {
                factory.apply_settings(&data[2..])?;
            }
        }
        Ok(())
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    pub fn set_upgrade(&mut self, upgrade: bool) {
        self.upgrade = upgrade;
    }

    pub fn is_base64ed(&self) -> bool {
        self.base64ed
    }

    pub fn set_base64ed(&mut self, base64ed: bool) {
        self.base64ed = base64ed;
    }

    pub fn cipher_factory(&self) -> Option<Arc<dyn CipherFactory>> {
        self.cipher_factory.clone()
    }

    pub fn set_cipher_factory(&mut self, cipher_factory: Option<Arc<dyn CipherFactory>>) {
        self.cipher_factory = cipher_factory;
    }

    pub fn secrets_sent(&self) -> bool {
        self.send_secrets
    }

    pub fn set_secrets_sent(&mut self, send_secrets: bool) {
        self.send_secrets = send_secrets;
    }
}

impl Clone for EncryptionUpgradePacket {
    fn clone(&self) -> Self {
        EncryptionUpgradePacket {
            acknowledgement: self.acknowledgement,
            upgrade: self.upgrade,
            base64ed: self.base64ed,
            cipher_factory: self.cipher_factory.clone(),
            send_secrets: self.send_secrets,
        }
    }
}

impl PartialEq for EncryptionUpgradePacket {
    fn eq(&self, other: &Self) -> bool {
        self.acknowledgement == other.acknowledgement
            && self.upgrade == other.upgrade
            && self.base64ed == other.base64ed
    }
}

impl fmt::Debug for EncryptionUpgradePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionUpgradePacket")
            .field("acknowledgement", &self.acknowledgement)
            .field("upgrade", &self.upgrade)
            .field("base64ed", &self.base64ed)
            .field("has_cipher_factory", &self.cipher_factory.is_some())
            .finish()
    }
}

/// Signals an SSL upgrade request or its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SslUpgradePacket {
    pub acknowledgement: Option<bool>,
}

impl SslUpgradePacket {
    pub fn new(acknowledgement: bool) -> Self {
        SslUpgradePacket {
            acknowledgement: Some(acknowledgement),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.acknowledgement.is_some()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.acknowledgement == Some(true)
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let ack = self
            .acknowledgement
            .ok_or(PacketError::MissingField("acknowledgement"))?;
        Ok(vec![bool_to_byte(ack)])
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() != 1 {
            return Err(PacketError::WrongLength {
                expected: 1,
                actual: data.len(),
            });
        }
        self.acknowledgement = bool_from_byte(data[0]);
        Ok(())
    }
}

/// Carries a UTF-8 peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentifierPacket {
    pub id: Option<String>,
}

impl IdentifierPacket {
    pub fn new(id: impl Into<String>) -> Self {
        IdentifierPacket {
            id: Some(id.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let id = self.id.as_deref().ok_or(PacketError::MissingField("id"))?;
        Ok(id.as_bytes().to_vec())
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        self.id = Some(wire::utf8_from_bytes(data)?);
        Ok(())
    }
}

/// Offers or acknowledges an ordered list of cipher names.
///
/// Body: `ack[1] ∥ count[4] ∥ { len[4] ∥ utf8[len] } × count`.
pub struct CipherListPacket {
    acknowledgement: Option<bool>,
    ciphers: Option<Vec<String>>,
    cache: Mutex<Option<Vec<u8>>>,
    use_cache: bool,
}

impl CipherListPacket {
    pub fn new(acknowledgement: Option<bool>, ciphers: Vec<String>) -> Self {
        CipherListPacket {
            acknowledgement,
            ciphers: Some(ciphers),
            cache: Mutex::new(None),
            use_cache: false,
        }
    }

    pub fn empty() -> Self {
        CipherListPacket {
            acknowledgement: None,
            ciphers: None,
            cache: Mutex::new(None),
            use_cache: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.acknowledgement.is_some() && self.ciphers.is_some()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.acknowledgement == Some(true)
    }

    fn encode_records(&self) -> Result<Vec<u8>, PacketError> {
        let ack = self
            .acknowledgement
            .ok_or(PacketError::MissingField("acknowledgement"))?;
        let ciphers = self
            .ciphers
            .as_ref()
            .ok_or(PacketError::MissingField("ciphers"))?;
        let mut buf = BytesMut::with_capacity(5 + ciphers.iter().map(|c| 4 + c.len()).sum::<usize>());
        buf.put_u8(bool_to_byte(ack));
        buf.put_i32(ciphers.len() as i32);
        for cipher in ciphers {
            buf.put_i32(cipher.len() as i32);
            buf.put_slice(cipher.as_bytes());
        }
        Ok(buf.to_vec())
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        if self.use_cache {
            let mut cache = self.cache.lock();
            if cache.is_none() {
                *cache = Some(self.encode_records()?);
            }
            Ok(cache.clone().unwrap_or_default())
        } else {
            self.encode_records()
        }
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() < 5 {
            return Err(PacketError::Malformed("cipher list body shorter than header"));
        }
        let mut buf = data;
        self.acknowledgement = bool_from_byte(buf.get_u8());
        let count = buf.get_i32();
        if count < 0 {
            return Err(PacketError::Malformed("cipher record count less than 0"));
        }
        let mut ciphers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(PacketError::Malformed("cipher list truncated in record length"));
            }
            let record_len = buf.get_i32();
            if record_len < 0 {
                return Err(PacketError::Malformed("cipher record length less than 0"));
            }
            let record_len = record_len as usize;
            if buf.remaining() < record_len {
                return Err(PacketError::Malformed("cipher list truncated in record"));
            }
            ciphers.push(wire::utf8_from_bytes(&buf[..record_len])?);
            buf.advance(record_len);
        }
        self.ciphers = Some(ciphers);
        *self.cache.lock() = if self.use_cache {
            Some(data.to_vec())
        } else {
            None
        };
        Ok(())
    }

    pub fn body_len(&self) -> Result<usize, PacketError> {
        Ok(self.save_payload()?.len())
    }

    pub fn write_body_to(&self, sink: &mut dyn Write) -> Result<(), PacketError> {
        sink.write_all(&self.save_payload()?)?;
        Ok(())
    }

    pub fn read_body_from(&mut self, source: &mut dyn Read, len: usize) -> Result<(), PacketError> {
        if len < 5 {
            return Err(PacketError::UnexpectedEnd);
        }
        let mut clamped = LengthClampedReader::new(source, len);
        self.acknowledgement = bool_from_byte(wire::read_byte(&mut clamped)?);
        let count = wire::read_i32(&mut clamped)?;
        if count < 0 {
            return Err(PacketError::Malformed("cipher record count less than 0"));
        }
        let mut ciphers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let record_len = wire::read_i32(&mut clamped)?;
            if record_len < 0 {
                return Err(PacketError::Malformed("cipher record length less than 0"));
            }
            let record = wire::read_exact_vec(&mut clamped, record_len as usize)?;
            ciphers.push(wire::utf8_from_bytes(&record)?);
        }
        self.ciphers = Some(ciphers);
        *self.cache.lock() = None;
        Ok(())
    }

    pub fn ciphers(&self) -> Option<&[String]> {
        self.ciphers.as_deref()
    }

    pub fn set_ciphers(&mut self, ciphers: Vec<String>) {
        *self.cache.lock() = None;
        self.ciphers = Some(ciphers);
    }

    pub fn is_cache_used(&self) -> bool {
        self.use_cache
    }

    pub fn set_cache_used(&mut self, used: bool) {
        self.use_cache = used;
        if !used {
            *self.cache.lock() = None;
        }
    }
}

impl Clone for CipherListPacket {
    fn clone(&self) -> Self {
        CipherListPacket {
            acknowledgement: self.acknowledgement,
            ciphers: self.ciphers.clone(),
            cache: Mutex::new(self.cache.lock().clone()),
            use_cache: self.use_cache,
        }
    }
}

impl PartialEq for CipherListPacket {
    fn eq(&self, other: &Self) -> bool {
        self.acknowledgement == other.acknowledgement && self.ciphers == other.ciphers
    }
}

impl fmt::Debug for CipherListPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherListPacket")
            .field("acknowledgement", &self.acknowledgement)
            .field("ciphers", &self.ciphers)
            .field("use_cache", &self.use_cache)
            .finish()
    }
}
