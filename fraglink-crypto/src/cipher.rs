//! Cipher factory interface and streaming transforms
//!
//! The encrypted envelope packet drives its cipher through this seam: the
//! factory hands out one-direction cipher instances, exposes its settings
//! with and without secret material, and signals when those settings have
//! changed so envelope caches can be invalidated.
//!
//! `XorCipherFactory` is a keystream reference implementation: the key is
//! the secret half of the settings, the nonce the public half. It is not a
//! security boundary; it exists so the encrypted envelope can be exercised
//! end to end without an external cipher backend.

use parking_lot::Mutex;
use rand::RngCore;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Cipher collaborator errors.
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("cipher construction failed: {0}")]
    Construction(String),

    #[error("cipher settings rejected: {0}")]
    Settings(String),

    #[error("cipher finalization failed: {0}")]
    Finalization(String),
}

/// Direction a cipher instance operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// A one-direction cipher instance.
pub trait Cipher: Send {
    /// Transform a chunk, returning whatever output is ready.
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Finalize, returning any buffered output.
    fn finish(&mut self) -> Result<Vec<u8>, CipherError>;

    /// Total output length for an input of the given length.
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }
}

/// Constructs ciphers and carries their negotiable settings.
pub trait CipherFactory: Send + Sync {
    /// Construct a cipher for the given direction.
    fn cipher(&self, mode: CipherMode) -> Result<Box<dyn Cipher>, CipherError>;

    /// Settings blob including secret material.
    fn settings(&self) -> Result<Vec<u8>, CipherError>;

    /// Settings blob with secret material withheld.
    fn settings_no_secrets(&self) -> Result<Vec<u8>, CipherError>;

    fn settings_len(&self) -> usize;

    fn settings_no_secrets_len(&self) -> usize;

    /// True when the settings changed since this was last called.
    fn attributes_modified(&self) -> bool;

    /// Adopt settings received from a peer.
    fn apply_settings(&self, settings: &[u8]) -> Result<(), CipherError>;
}

/// Writer adapter that ciphers every byte written through it.
pub struct CipherWriter<W> {
    inner: W,
    cipher: Box<dyn Cipher>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, cipher: Box<dyn Cipher>) -> Self {
        CipherWriter { inner, cipher }
    }

    /// Finalize the cipher, flushing its trailing output to the wrapped writer.
    pub fn finish(mut self) -> io::Result<W> {
        let tail = self
            .cipher
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.inner.write_all(&tail)?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let out = self
            .cipher
            .update(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that deciphers every byte read through it.
pub struct CipherReader<R> {
    inner: R,
    cipher: Box<dyn Cipher>,
    ready: VecDeque<u8>,
    finished: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, cipher: Box<dyn Cipher>) -> Self {
        CipherReader {
            inner,
            cipher,
            ready: VecDeque::new(),
            finished: false,
        }
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.ready.is_empty() && !self.finished {
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.finished = true;
                let tail = self
                    .cipher
                    .finish()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                self.ready.extend(tail);
            } else {
                let out = self
                    .cipher
                    .update(&chunk[..n])
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                self.ready.extend(out);
            }
        }
        let mut count = 0;
        while count < buf.len() {
            match self.ready.pop_front() {
                Some(b) => {
                    buf[count] = b;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

const XOR_KEY_LEN: usize = 16;
const XOR_NONCE_LEN: usize = 8;

/// Keystream reference cipher factory.
///
/// Settings layout: `nonce[8]` (public) followed by `key[16]` (secret).
/// `apply_settings` accepts either the full form or the nonce-only public
/// form, in which case the local key is kept.
pub struct XorCipherFactory {
    state: Mutex<XorSettings>,
    modified: AtomicBool,
}

#[derive(Clone, Copy)]
struct XorSettings {
    nonce: [u8; XOR_NONCE_LEN],
    key: [u8; XOR_KEY_LEN],
}

impl XorCipherFactory {
    /// Construct with a random key and nonce.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; XOR_KEY_LEN];
        let mut nonce = [0u8; XOR_NONCE_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce);
        Self::with_key_nonce(key, nonce)
    }

    /// Construct with a shared key and a random nonce.
    pub fn with_key(key: [u8; XOR_KEY_LEN]) -> Self {
        let mut nonce = [0u8; XOR_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::with_key_nonce(key, nonce)
    }

    pub fn with_key_nonce(key: [u8; XOR_KEY_LEN], nonce: [u8; XOR_NONCE_LEN]) -> Self {
        XorCipherFactory {
            state: Mutex::new(XorSettings { nonce, key }),
            modified: AtomicBool::new(false),
        }
    }

    /// Pick a fresh nonce for subsequent ciphers.
    pub fn rotate_nonce(&self) {
        let mut state = self.state.lock();
        rand::thread_rng().fill_bytes(&mut state.nonce);
        self.modified.store(true, Ordering::Release);
    }

    fn seed(settings: &XorSettings) -> u64 {
        let mut seed = u64::from_be_bytes(settings.nonce);
        for chunk in settings.key.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            seed ^= u64::from_be_bytes(word).rotate_left(chunk.len() as u32);
        }
        // The keystream must never collapse to the all-zero state.
        if seed == 0 {
            seed = 0x9E37_79B9_7F4A_7C15;
        }
        seed
    }
}

impl Default for XorCipherFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherFactory for XorCipherFactory {
    fn cipher(&self, _mode: CipherMode) -> Result<Box<dyn Cipher>, CipherError> {
        let state = self.state.lock();
        Ok(Box::new(XorKeystream {
            state: Self::seed(&state),
        }))
    }

    fn settings(&self) -> Result<Vec<u8>, CipherError> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(XOR_NONCE_LEN + XOR_KEY_LEN);
        out.extend_from_slice(&state.nonce);
        out.extend_from_slice(&state.key);
        Ok(out)
    }

    fn settings_no_secrets(&self) -> Result<Vec<u8>, CipherError> {
        let state = self.state.lock();
        Ok(state.nonce.to_vec())
    }

    fn settings_len(&self) -> usize {
        XOR_NONCE_LEN + XOR_KEY_LEN
    }

    fn settings_no_secrets_len(&self) -> usize {
        XOR_NONCE_LEN
    }

    fn attributes_modified(&self) -> bool {
        self.modified.swap(false, Ordering::AcqRel)
    }

    fn apply_settings(&self, settings: &[u8]) -> Result<(), CipherError> {
        if settings.len() != XOR_NONCE_LEN && settings.len() != XOR_NONCE_LEN + XOR_KEY_LEN {
            return Err(CipherError::Settings(format!(
                "expected {} or {} bytes, got {}",
                XOR_NONCE_LEN,
                XOR_NONCE_LEN + XOR_KEY_LEN,
                settings.len()
            )));
        }
        let mut state = self.state.lock();
        state.nonce.copy_from_slice(&settings[..XOR_NONCE_LEN]);
        if settings.len() > XOR_NONCE_LEN {
            state.key.copy_from_slice(&settings[XOR_NONCE_LEN..]);
        }
        self.modified.store(true, Ordering::Release);
        Ok(())
    }
}

/// xorshift64 keystream; symmetric, so one type serves both directions.
struct XorKeystream {
    state: u64,
}

impl XorKeystream {
    fn next_byte(&mut self) -> u8 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u8
    }
}

impl Cipher for XorKeystream {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(input.iter().map(|b| b ^ self.next_byte()).collect())
    }

    fn finish(&mut self) -> Result<Vec<u8>, CipherError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_roundtrip() {
        let factory = XorCipherFactory::new();
        let plain = b"settings then ciphertext".to_vec();

        let mut enc = factory.cipher(CipherMode::Encrypt).unwrap();
        let mut cipher_text = enc.update(&plain).unwrap();
        cipher_text.extend(enc.finish().unwrap());
        assert_ne!(cipher_text, plain);

        let mut dec = factory.cipher(CipherMode::Decrypt).unwrap();
        let mut recovered = dec.update(&cipher_text).unwrap();
        recovered.extend(dec.finish().unwrap());
        assert_eq!(recovered, plain);
    }

    #[test]
    fn test_settings_roundtrip_between_factories() {
        let a = XorCipherFactory::new();
        let b = XorCipherFactory::new();
        b.apply_settings(&a.settings().unwrap()).unwrap();

        let mut enc = a.cipher(CipherMode::Encrypt).unwrap();
        let cipher_text = enc.update(b"shared state").unwrap();
        let mut dec = b.cipher(CipherMode::Decrypt).unwrap();
        assert_eq!(dec.update(&cipher_text).unwrap(), b"shared state");
    }

    #[test]
    fn test_no_secrets_keeps_local_key() {
        let key = [9u8; 16];
        let a = XorCipherFactory::with_key(key);
        let b = XorCipherFactory::with_key(key);

        // Public settings carry the nonce only; the shared key still decrypts.
        b.apply_settings(&a.settings_no_secrets().unwrap()).unwrap();
        let mut enc = a.cipher(CipherMode::Encrypt).unwrap();
        let cipher_text = enc.update(b"nonce only").unwrap();
        let mut dec = b.cipher(CipherMode::Decrypt).unwrap();
        assert_eq!(dec.update(&cipher_text).unwrap(), b"nonce only");
    }

    #[test]
    fn test_attributes_modified_latches_once() {
        let factory = XorCipherFactory::new();
        assert!(!factory.attributes_modified());
        factory.rotate_nonce();
        assert!(factory.attributes_modified());
        assert!(!factory.attributes_modified());
    }

    #[test]
    fn test_bad_settings_length_rejected() {
        let factory = XorCipherFactory::new();
        assert!(factory.apply_settings(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_streaming_adapters_roundtrip() {
        let factory = XorCipherFactory::new();
        let plain = (0u8..=255).collect::<Vec<_>>();

        let mut writer = CipherWriter::new(Vec::new(), factory.cipher(CipherMode::Encrypt).unwrap());
        writer.write_all(&plain).unwrap();
        let cipher_text = writer.finish().unwrap();

        let mut reader =
            CipherReader::new(&cipher_text[..], factory.cipher(CipherMode::Decrypt).unwrap());
        let mut recovered = Vec::new();
        reader.read_to_end(&mut recovered).unwrap();
        assert_eq!(recovered, plain);
    }
}
