
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::header::{Flags, FLAG_NONCE_MASK, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

/// KeySchedule derives every per-datagram authentication and encryption
/// operation from the pre-shared key. The PSK is read-only after startup.
#[derive(Clone)]
pub struct KeySchedule {
    key: [u8; KEY_SIZE],
    aead: XChaCha20Poly1305,
}

impl KeySchedule {
    /// A PSK of exactly 32 bytes is used as-is; any other length is first
    /// hashed with SHA-256.
    pub fn new(psk: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        if psk.len() == KEY_SIZE {
            key.copy_from_slice(psk);
        } else {
            key.copy_from_slice(&Sha256::digest(psk));
        }
        let aead = XChaCha20Poly1305::new(GenericArray::from_slice(&key));
        KeySchedule { key, aead }
    }

    /// Leading 16 bytes of HMAC-SHA-256 over the concatenated parts. Used both
    /// for the per-datagram tag (header then payload) and for the aggregate
    /// tag (body payloads in sequence order).
    pub fn tag(&self, parts: &[&[u8]]) -> [u8; TAG_SIZE] {
        let mut mac =
            <HmacSha256 as KeyInit>::new_from_slice(&self.key).expect("HMAC can take key of any size");
        for part in parts {
            mac.update(part);
        }
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&digest[..TAG_SIZE]);
        tag
    }

    pub fn verify_tag(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        if tag.len() != TAG_SIZE {
            return false;
        }
        let expected = self.tag(parts);
        expected.ct_eq(tag).into()
    }

    /// The nonce is a pure function of header fields that are themselves
    /// covered by the tag, so a bit-exact retransmit reuses the same nonce by
    /// construction and never violates nonce uniqueness.
    pub fn nonce(request_id: u64, sequence: u16, flags: Flags) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..8].copy_from_slice(&request_id.to_be_bytes());
        nonce[8..10].copy_from_slice(&sequence.to_be_bytes());
        nonce[10] = flags.0 & FLAG_NONCE_MASK;
        nonce
    }

    /// Encrypts `buffer` in place and returns the detached Poly1305 tag.
    pub fn seal(
        &self,
        request_id: u64,
        sequence: u16,
        flags: Flags,
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<[u8; TAG_SIZE]> {
        let nonce = Self::nonce(request_id, sequence, flags);
        let tag = self
            .aead
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, buffer)
            .map_err(|e| Error::Other(e.to_string()))?;
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Decrypts `buffer` in place, verifying the detached tag against the
    /// associated data. Any mismatch is an authentication failure.
    pub fn open(
        &self,
        request_id: u64,
        sequence: u16,
        flags: Flags,
        aad: &[u8],
        buffer: &mut Vec<u8>,
        tag: &[u8],
    ) -> Result<()> {
        if tag.len() != TAG_SIZE {
            return Err(Error::ErrAuthFailed);
        }
        let nonce = Self::nonce(request_id, sequence, flags);
        self.aead
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                aad,
                buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::ErrAuthFailed)
    }
}
