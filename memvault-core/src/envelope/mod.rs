//! Identity-based encryption envelope.
//!
//! Decryption requires a live session key for the content owner plus a
//! weighted quorum of agreeing key-server shares; the data key is derived
//! from the aggregated share, never stored. Pre-rotation ciphertexts remain
//! decryptable because rotation versions the backup key without changing
//! share derivation.
//!
//! - `cipher`: wire format and AEAD
//! - `session`: session-key lifecycle and the sign-challenge round
//! - `key_servers`: share fetch and quorum aggregation

pub mod cipher;
mod key_servers;
mod session;

pub use key_servers::{
    approval_message, fetch_quorum_share, AggregatedShare, FetchShareRequest, KeyServer,
    ServerHandle,
};
pub use session::{challenge_message, ChallengeSigner, SessionKey, SessionManager};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::identity::IbeIdentity;
use crate::types::{SealConfig, UserAddress};

type HmacSha256 = Hmac<Sha256>;

/// Output of [`SealEnvelope::encrypt`]: ciphertext plus the descriptor
/// fields the caller persists alongside it.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub bytes: Vec<u8>,
    pub identity: String,
    /// Hex `SHA-256(plaintext || identity_bytes)`.
    pub aad_hash: String,
}

/// Counters and sizes for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeStats {
    pub cached_sessions: usize,
    pub rotated_users: usize,
    pub encrypt_count: u64,
    pub decrypt_count: u64,
}

/// The identity-based encryption envelope.
pub struct SealEnvelope {
    servers: Vec<ServerHandle>,
    quorum: u32,
    sessions: SessionManager,
    key_server_timeout: Duration,
    /// Backup-key version per user; bumped on rotation.
    key_versions: Mutex<HashMap<String, u32>>,
    counters: Mutex<(u64, u64)>,
}

impl SealEnvelope {
    /// Build the envelope from config plus the host-supplied transports.
    ///
    /// `servers` must match `config.servers` (or be the default set when the
    /// config list is empty).
    pub fn new(
        config: &SealConfig,
        servers: Vec<ServerHandle>,
        signer: Arc<dyn ChallengeSigner>,
        clock: SharedClock,
        key_server_timeout: Duration,
    ) -> Result<Self> {
        if config.quorum == 0 {
            return Err(Error::Configuration("seal quorum must be positive".into()));
        }
        Ok(Self {
            servers,
            quorum: config.quorum,
            sessions: SessionManager::new(
                signer,
                clock,
                config.package_id.clone(),
                config.session_ttl_min,
            ),
            key_server_timeout,
            key_versions: Mutex::new(HashMap::new()),
            counters: Mutex::new((0, 0)),
        })
    }

    /// Seal a plaintext under `identity`.
    pub async fn encrypt(&self, plaintext: &[u8], identity: &IbeIdentity) -> Result<SealedBlob> {
        let key = self.data_key(identity, identity).await?;
        let identity_string = identity.to_identity_string();
        let bytes = cipher::seal(&key, &identity_string, plaintext)?;
        let aad_hash = hex::encode(cipher::aad_hash(plaintext, identity_string.as_bytes()));
        self.counters.lock().0 += 1;
        Ok(SealedBlob {
            bytes,
            identity: identity_string,
            aad_hash,
        })
    }

    /// Open a ciphertext on behalf of `requesting`.
    ///
    /// The permission predicate has already ruled on access by the time this
    /// runs; this method enforces the cryptographic path only.
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        requesting: &IbeIdentity,
    ) -> Result<Vec<u8>> {
        let envelope = cipher::parse(ciphertext)?;
        let identity = IbeIdentity::parse(&envelope.identity)
            .map_err(|_| Error::InvalidCiphertext("unparsable embedded identity".into()))?;
        let key = self.data_key(&identity, requesting).await?;
        let plaintext = cipher::open(&key, &envelope)?;
        self.counters.lock().1 += 1;
        Ok(plaintext)
    }

    /// Evict the user's session, bump the backup-key version and return it.
    /// Ciphertexts sealed before rotation remain decryptable. An optional
    /// TTL override applies to the user's future sessions.
    pub fn rotate(&self, user: &UserAddress, ttl_min: Option<u64>) -> u32 {
        if let Some(ttl_min) = ttl_min {
            self.sessions.set_ttl_override(user, ttl_min);
        }
        self.sessions.evict(user);
        let mut versions = self.key_versions.lock();
        let version = versions.entry(user.as_str().to_string()).or_insert(0);
        *version += 1;
        tracing::info!(user = %user, version = *version, "rotated backup key");
        *version
    }

    /// Current backup-key version for a user (0 = never rotated).
    #[must_use]
    pub fn key_version(&self, user: &UserAddress) -> u32 {
        self.key_versions
            .lock()
            .get(user.as_str())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> EnvelopeStats {
        let (encrypt_count, decrypt_count) = *self.counters.lock();
        EnvelopeStats {
            cached_sessions: self.sessions.cached_sessions(),
            rotated_users: self.key_versions.lock().len(),
            encrypt_count,
            decrypt_count,
        }
    }

    /// Session + quorum-share round, then data-key derivation.
    async fn data_key(
        &self,
        content_identity: &IbeIdentity,
        requesting: &IbeIdentity,
    ) -> Result<[u8; 32]> {
        let session = self.sessions.get_or_create(content_identity.user()).await?;
        let identity_bytes = content_identity.as_bytes();
        let request = FetchShareRequest {
            session_handle: session.handle,
            approval_message: approval_message(
                &content_identity.to_identity_string(),
                &requesting.to_identity_string(),
            ),
            identity_bytes: identity_bytes.clone(),
            requesting_identity: requesting.to_identity_string(),
        };

        let aggregated = fetch_quorum_share(
            &self.servers,
            &request,
            self.quorum,
            self.key_server_timeout,
        )
        .await?;

        Ok(derive_data_key(
            &aggregated.share,
            &session.package_id,
            &identity_bytes,
        ))
    }
}

/// `HMAC-SHA256(share, package_id || identity_bytes)` — the expand step
/// turning an aggregated share into the AEAD data key.
#[must_use]
pub fn derive_data_key(share: &[u8], package_id: &str, identity_bytes: &[u8]) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(share).expect("HMAC accepts arbitrary key lengths");
    mac.update(package_id.as_bytes());
    mac.update(identity_bytes);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_key_depends_on_all_inputs() {
        let base = derive_data_key(b"share", "0xf00d", b"self:0xa1");
        assert_ne!(base, derive_data_key(b"other", "0xf00d", b"self:0xa1"));
        assert_ne!(base, derive_data_key(b"share", "0xbeef", b"self:0xa1"));
        assert_ne!(base, derive_data_key(b"share", "0xf00d", b"self:0xb2"));
        assert_eq!(base, derive_data_key(b"share", "0xf00d", b"self:0xa1"));
    }
}
