//! Digest provider interface and streaming adapters
//!
//! The packet loader computes a digest over frame payloads as they pass
//! through a reader or writer, then compares it against the trailer. The
//! provider abstraction keeps the algorithm pluggable; a SHA-256 provider
//! is supplied.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// An in-progress incremental digest.
pub trait DigestState: Send {
    /// Feed more bytes into the digest.
    fn update(&mut self, data: &[u8]);

    /// Finish and return the digest bytes.
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// A source of fixed-length digests.
pub trait DigestProvider: Send + Sync {
    /// Length in bytes of every digest this provider produces.
    fn digest_len(&self) -> usize;

    /// Begin an incremental digest.
    fn begin(&self) -> Box<dyn DigestState>;

    /// One-shot digest of a byte slice.
    fn digest_of(&self, data: &[u8]) -> Vec<u8> {
        let mut state = self.begin();
        state.update(data);
        state.finish()
    }
}

/// SHA-256 digest provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Provider;

struct Sha256State(Sha256);

impl DigestState for Sha256State {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

impl DigestProvider for Sha256Provider {
    fn digest_len(&self) -> usize {
        32
    }

    fn begin(&self) -> Box<dyn DigestState> {
        Box::new(Sha256State(Sha256::new()))
    }
}

/// Compares two digests byte for byte.
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Reader adapter that digests every byte read through it.
pub struct DigestReader<R> {
    inner: R,
    state: Box<dyn DigestState>,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R, provider: &dyn DigestProvider) -> Self {
        DigestReader {
            inner,
            state: provider.begin(),
        }
    }

    /// Finish the digest, returning it together with the wrapped reader.
    pub fn finish(self) -> (R, Vec<u8>) {
        (self.inner, self.state.finish())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.state.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that digests every byte written through it.
pub struct DigestWriter<W> {
    inner: W,
    state: Box<dyn DigestState>,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W, provider: &dyn DigestProvider) -> Self {
        DigestWriter {
            inner,
            state: provider.begin(),
        }
    }

    /// Finish the digest, returning it together with the wrapped writer.
    pub fn finish(self) -> (W, Vec<u8>) {
        (self.inner, self.state.finish())
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.state.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
