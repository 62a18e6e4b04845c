//! Key negotiation and stream encryption.
//!
//! Segments are optionally encrypted with AES-128 in CBC mode over the
//! compressed byte stream, PKCS#7-padded when the stream ends. The AES key
//! is never configured directly: the logger holds an ECDH public key on the
//! NIST P-256 curve (secp256r1), generates a fresh ephemeral key pair for
//! every segment, and derives the session key from the shared secret's X
//! coordinate. The ephemeral public key travels in the segment header, so
//! the holder of the long-term secret key can re-derive the session key.
//!
//! The scheme is confidentiality-only — there is no authentication tag, and
//! a wrong secret key is indistinguishable from a corrupt stream. The IV is
//! all zeros: the session key is unique per segment, so no (key, IV) pair
//! ever repeats.

use aes::{Aes128Dec, Aes128Enc, Block};
use base64::{prelude::BASE64_STANDARD, Engine};
use cipher::{
    block_padding::{Pkcs7, RawPadding},
    BlockDecrypt, BlockEncrypt, KeyInit,
};
use p256::ecdh::diffie_hellman;
use rand_core::OsRng;

use crate::{Error, Result};

/// Length of a compressed SEC1 public key: 1 tag byte + 32-byte X coordinate.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of a P-256 secret scalar.
pub const SECRET_KEY_LEN: usize = 32;

/// AES block and session key length.
pub(crate) const BLOCK_LEN: usize = 16;

/// A compressed P-256 public key.
pub type PublicKey = [u8; PUBLIC_KEY_LEN];

/// A P-256 secret key.
pub type SecretKey = [u8; SECRET_KEY_LEN];

/// Per-segment AES-128 key.
pub(crate) type SessionKey = [u8; BLOCK_LEN];

/// Generates a long-term ECDH key pair. The public key configures loggers,
/// the secret key stays with whoever parses the logs.
pub fn gen_key_pair() -> (SecretKey, PublicKey) {
    let secret = p256::SecretKey::random(&mut OsRng);
    let point = p256::EncodedPoint::from(secret.public_key()).compress();
    let public = point
        .as_bytes()
        .try_into()
        .expect("a compressed P-256 point is 33 bytes");
    (secret.to_bytes().into(), public)
}

/// Decodes and validates a base64 public key.
pub(crate) fn decode_public_key(encoded: &str) -> Result<PublicKey> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| Error::InvalidKey)?;
    let key: PublicKey = bytes.try_into().map_err(|_| Error::InvalidKey)?;
    // Reject off-curve points up front rather than at the first segment.
    p256::PublicKey::from_sec1_bytes(&key).map_err(|_| Error::InvalidKey)?;
    Ok(key)
}

/// Key material of one segment on the write side.
pub(crate) struct SegmentKeys {
    /// Ephemeral public key, written into the segment header.
    pub(crate) eph_pub: PublicKey,
    /// Negotiated AES-128 session key.
    pub(crate) key: SessionKey,
}

impl SegmentKeys {
    /// Generates an ephemeral key pair and negotiates the session key
    /// against the configured long-term public key.
    pub(crate) fn negotiate(user_pub: &PublicKey) -> Result<Self> {
        let user_pub = p256::PublicKey::from_sec1_bytes(user_pub).map_err(|_| Error::InvalidKey)?;
        let eph = p256::SecretKey::random(&mut OsRng);

        let shared = diffie_hellman(eph.to_nonzero_scalar(), user_pub.as_affine());
        let key = shared.raw_secret_bytes().as_slice()[..BLOCK_LEN]
            .try_into()
            .map_err(|_| Error::InvalidKey)?;

        let point = p256::EncodedPoint::from(eph.public_key()).compress();
        let eph_pub = point
            .as_bytes()
            .try_into()
            .map_err(|_| Error::InvalidKey)?;

        Ok(Self { eph_pub, key })
    }
}

/// Read side: re-derives a segment's session key from the reader's secret
/// key and the ephemeral public key found in the segment header.
pub(crate) fn derive_session_key(secret: &SecretKey, eph_pub: &PublicKey) -> Result<SessionKey> {
    let secret = p256::SecretKey::from_slice(secret).map_err(|_| Error::InvalidKey)?;
    let eph_pub = p256::PublicKey::from_sec1_bytes(eph_pub).map_err(|_| Error::InvalidKey)?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), eph_pub.as_affine());
    shared.raw_secret_bytes().as_slice()[..BLOCK_LEN]
        .try_into()
        .map_err(|_| Error::InvalidKey)
}

/// AES-128-CBC encryptor over a byte stream. Input of any length is
/// accepted; a partial block is carried until more bytes arrive or
/// [`StreamEncryptor::finish`] pads it.
pub(crate) struct StreamEncryptor {
    aes: Aes128Enc,
    chain: [u8; BLOCK_LEN],
    carry: Vec<u8>,
}

impl StreamEncryptor {
    pub(crate) fn new(key: &SessionKey) -> Self {
        Self {
            aes: Aes128Enc::new(key.into()),
            chain: [0; BLOCK_LEN],
            carry: Vec::with_capacity(BLOCK_LEN),
        }
    }

    /// Encrypts every complete block of `carry + input`, appending
    /// ciphertext to `dst`.
    pub(crate) fn write(&mut self, mut input: &[u8], dst: &mut Vec<u8>) {
        if !self.carry.is_empty() {
            let take = (BLOCK_LEN - self.carry.len()).min(input.len());
            self.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.carry.len() < BLOCK_LEN {
                return;
            }
            let block: [u8; BLOCK_LEN] = self.carry.as_slice().try_into().expect("full block");
            self.carry.clear();
            self.emit(block, dst);
        }

        let mut chunks = input.chunks_exact(BLOCK_LEN);
        for chunk in &mut chunks {
            self.emit(chunk.try_into().expect("exact chunk"), dst);
        }
        self.carry.extend_from_slice(chunks.remainder());
    }

    /// PKCS#7-pads whatever is carried and emits the final block.
    pub(crate) fn finish(mut self, dst: &mut Vec<u8>) {
        let mut block = [0u8; BLOCK_LEN];
        let pos = self.carry.len();
        block[..pos].copy_from_slice(&self.carry);
        Pkcs7::raw_pad(&mut block, pos);
        self.emit(block, dst);
    }

    fn emit(&mut self, mut block: [u8; BLOCK_LEN], dst: &mut Vec<u8>) {
        for (byte, prev) in block.iter_mut().zip(self.chain) {
            *byte ^= prev;
        }
        let mut ga = Block::from(block);
        self.aes.encrypt_block(&mut ga);
        self.chain = ga.into();
        dst.extend_from_slice(&self.chain);
    }
}

/// AES-128-CBC decryptor; the read path feeds it whole ciphertext blocks.
pub(crate) struct StreamDecryptor {
    aes: Aes128Dec,
    chain: [u8; BLOCK_LEN],
}

impl StreamDecryptor {
    pub(crate) fn new(key: &SessionKey) -> Self {
        Self {
            aes: Aes128Dec::new(key.into()),
            chain: [0; BLOCK_LEN],
        }
    }

    /// Decrypts one ciphertext block.
    pub(crate) fn block(&mut self, ciphertext: &[u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut ga = Block::from(*ciphertext);
        self.aes.decrypt_block(&mut ga);
        let mut plain: [u8; BLOCK_LEN] = ga.into();
        for (byte, prev) in plain.iter_mut().zip(self.chain) {
            *byte ^= prev;
        }
        self.chain = *ciphertext;
        plain
    }
}
