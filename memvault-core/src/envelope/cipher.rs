//! Ciphertext wire format and AEAD primitives.
//!
//! Layout (all lengths big-endian):
//!
//! ```text
//! magic "MVLT1" | u16 identity_len | identity bytes
//! | 12-byte nonce | 32-byte aad_hash | AEAD ciphertext (incl. 16-byte tag)
//! ```
//!
//! `aad_hash = SHA-256(plaintext || identity_bytes)` and is, together with
//! the identity bytes, bound into the AEAD associated data, so flipping any
//! byte of identity, hash or ciphertext fails the tag check.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Wire-format magic, versioned.
pub const MAGIC: &[u8; 5] = b"MVLT1";

const NONCE_LEN: usize = 12;
const HASH_LEN: usize = 32;

/// A parsed-but-still-sealed ciphertext.
#[derive(Debug, Clone)]
pub struct SealedEnvelope {
    pub identity: String,
    pub nonce: [u8; NONCE_LEN],
    pub aad_hash: [u8; HASH_LEN],
    pub ciphertext: Vec<u8>,
}

/// `SHA-256(plaintext || identity_bytes)`.
#[must_use]
pub fn aad_hash(plaintext: &[u8], identity_bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(plaintext);
    hasher.update(identity_bytes);
    hasher.finalize().into()
}

fn aead_payload(identity_bytes: &[u8], hash: &[u8; HASH_LEN]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(identity_bytes.len() + HASH_LEN);
    aad.extend_from_slice(identity_bytes);
    aad.extend_from_slice(hash);
    aad
}

/// Seal a plaintext under a 32-byte data key and identity string.
pub fn seal(key: &[u8; 32], identity: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let identity_bytes = identity.as_bytes();
    let hash = aad_hash(plaintext, identity_bytes);
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let aad = aead_payload(identity_bytes, &hash);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| Error::EncryptionFailed("AEAD seal failed".into()))?;

    let identity_len = u16::try_from(identity_bytes.len())
        .map_err(|_| Error::EncryptionFailed("identity string too long".into()))?;

    let mut out =
        Vec::with_capacity(MAGIC.len() + 2 + identity_bytes.len() + NONCE_LEN + HASH_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&identity_len.to_be_bytes());
    out.extend_from_slice(identity_bytes);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&hash);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Parse the wire format without decrypting.
pub fn parse(bytes: &[u8]) -> Result<SealedEnvelope> {
    let too_short = || Error::InvalidCiphertext("truncated envelope".into());

    if bytes.len() < MAGIC.len() + 2 {
        return Err(too_short());
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::InvalidCiphertext("bad magic".into()));
    }
    let mut offset = MAGIC.len();
    let identity_len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
    offset += 2;

    if bytes.len() < offset + identity_len + NONCE_LEN + HASH_LEN {
        return Err(too_short());
    }
    let identity = std::str::from_utf8(&bytes[offset..offset + identity_len])
        .map_err(|_| Error::InvalidCiphertext("identity is not UTF-8".into()))?
        .to_string();
    offset += identity_len;

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[offset..offset + NONCE_LEN]);
    offset += NONCE_LEN;

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&bytes[offset..offset + HASH_LEN]);
    offset += HASH_LEN;

    Ok(SealedEnvelope {
        identity,
        nonce,
        aad_hash: hash,
        ciphertext: bytes[offset..].to_vec(),
    })
}

/// Open a parsed envelope with a 32-byte data key.
///
/// Tampering with identity, hash or ciphertext fails the AEAD tag check and
/// surfaces as [`Error::IntegrityError`]; a post-decrypt hash comparison
/// backstops the plaintext binding.
pub fn open(key: &[u8; 32], envelope: &SealedEnvelope) -> Result<Vec<u8>> {
    let identity_bytes = envelope.identity.as_bytes();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let aad = aead_payload(identity_bytes, &envelope.aad_hash);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| Error::IntegrityError)?;

    if aad_hash(&plaintext, identity_bytes) != envelope.aad_hash {
        return Err(Error::IntegrityError);
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal(&KEY, "self:0xa1", b"the plaintext").unwrap();
        let envelope = parse(&sealed).unwrap();
        assert_eq!(envelope.identity, "self:0xa1");
        let plaintext = open(&KEY, &envelope).unwrap();
        assert_eq!(plaintext, b"the plaintext");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let a = seal(&KEY, "self:0xa1", b"same").unwrap();
        let b = seal(&KEY, "self:0xa1", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_any_byte_fails_integrity() {
        let sealed = seal(&KEY, "self:0xa1", b"sensitive").unwrap();
        // Skip the magic and length prefix; every other byte participates in
        // either the AEAD tag or the structure checks.
        for i in MAGIC.len() + 2..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            let result = parse(&tampered).and_then(|env| open(&KEY, &env));
            assert!(result.is_err(), "byte {i} tamper must fail");
        }
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let sealed = seal(&KEY, "self:0xa1", b"secret").unwrap();
        let envelope = parse(&sealed).unwrap();
        let wrong = [8u8; 32];
        assert!(matches!(open(&wrong, &envelope), Err(Error::IntegrityError)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse(b"nope"),
            Err(Error::InvalidCiphertext(_))
        ));
        assert!(matches!(
            parse(b"XXXXX\x00\x04selfAAAABBBB"),
            Err(Error::InvalidCiphertext(_))
        ));
    }
}
