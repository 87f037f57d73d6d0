//! Digest and Cipher Seams
//!
//! This crate defines the collaborator interfaces the packet codec relies on
//! for integrity trailers and encrypted envelopes: a digest provider with
//! streaming adapters, and a cipher factory with streaming transforms.
//! A SHA-256 digest provider and a keystream reference cipher are included.

pub mod cipher;
pub mod digest;

pub use cipher::{
    Cipher, CipherError, CipherFactory, CipherMode, CipherReader, CipherWriter, XorCipherFactory,
};
pub use digest::{
    digests_equal, DigestProvider, DigestReader, DigestState, DigestWriter, Sha256Provider,
};
