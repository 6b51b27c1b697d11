//! Session-key lifecycle.
//!
//! A session key is a short-lived capability bound to
//! `(user_address, package_id)`. Creating one requires signing the SEAL
//! challenge; signing is delegated to a holder of the user's private key
//! through the narrow [`ChallengeSigner`] interface.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::types::UserAddress;

/// Signs session challenges on behalf of a user.
#[async_trait]
pub trait ChallengeSigner: Send + Sync {
    /// Sign the challenge bytes; the signature binds the session handle.
    async fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Short-lived decryption capability.
#[derive(Debug, Clone)]
pub struct SessionKey {
    /// Unforgeable handle quoted in fetch-share requests.
    pub handle: Uuid,
    pub address: UserAddress,
    pub package_id: String,
    pub ttl_min: u64,
    pub created_ms: i64,
    pub expires_at_ms: i64,
    /// Signature over the challenge message.
    pub signature: Vec<u8>,
}

impl SessionKey {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// The exact challenge text signed when a session is created.
#[must_use]
pub fn challenge_message(address: &UserAddress, package_id: &str, ttl_min: u64) -> String {
    format!(
        "Please sign this message to authenticate with SEAL:\n\n\
         Address: {address}\n\
         Package: {package_id}\n\
         TTL: {ttl_min} minutes"
    )
}

/// Caches one session per `(address, package_id)` and re-signs on expiry.
pub struct SessionManager {
    signer: Arc<dyn ChallengeSigner>,
    clock: SharedClock,
    package_id: String,
    ttl_min: u64,
    ttl_overrides: Mutex<HashMap<String, u64>>,
    sessions: Mutex<HashMap<String, SessionKey>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        signer: Arc<dyn ChallengeSigner>,
        clock: SharedClock,
        package_id: String,
        ttl_min: u64,
    ) -> Self {
        Self {
            signer,
            clock,
            package_id,
            ttl_min,
            ttl_overrides: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the session TTL for one address (applies to future
    /// sessions; used by key rotation).
    pub fn set_ttl_override(&self, address: &UserAddress, ttl_min: u64) {
        self.ttl_overrides
            .lock()
            .insert(address.as_str().to_string(), ttl_min);
    }

    /// Return a live session for `address`, running the sign-challenge round
    /// if none exists or the cached one expired.
    pub async fn get_or_create(&self, address: &UserAddress) -> Result<SessionKey> {
        let now = self.clock.now_ms();
        {
            let sessions = self.sessions.lock();
            if let Some(session) = sessions.get(address.as_str()) {
                if !session.is_expired(now) {
                    return Ok(session.clone());
                }
            }
        }
        self.create(address).await
    }

    async fn create(&self, address: &UserAddress) -> Result<SessionKey> {
        let ttl_min = self
            .ttl_overrides
            .lock()
            .get(address.as_str())
            .copied()
            .unwrap_or(self.ttl_min);
        let challenge = challenge_message(address, &self.package_id, ttl_min);
        let signature = self
            .signer
            .sign(challenge.as_bytes())
            .await
            .map_err(|_| Error::SessionExpired {
                address: address.to_string(),
            })?;

        let now = self.clock.now_ms();
        let session = SessionKey {
            handle: Uuid::new_v4(),
            address: address.clone(),
            package_id: self.package_id.clone(),
            ttl_min,
            created_ms: now,
            expires_at_ms: now + (ttl_min as i64) * 60_000,
            signature,
        };

        tracing::debug!(address = %address, handle = %session.handle, "created session key");
        self.sessions
            .lock()
            .insert(address.as_str().to_string(), session.clone());
        Ok(session)
    }

    /// Drop the cached session for `address` (used by `rotate`).
    pub fn evict(&self, address: &UserAddress) {
        self.sessions.lock().remove(address.as_str());
    }

    /// Number of cached (possibly expired) sessions.
    #[must_use]
    pub fn cached_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct CountingSigner(AtomicU32);

    #[async_trait]
    impl ChallengeSigner for CountingSigner {
        async fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(message.to_vec())
        }
    }

    #[test]
    fn challenge_text_is_stable() {
        let text = challenge_message(&UserAddress::new("0xa1b2"), "0xf00d", 60);
        assert_eq!(
            text,
            "Please sign this message to authenticate with SEAL:\n\n\
             Address: 0xa1b2\n\
             Package: 0xf00d\n\
             TTL: 60 minutes"
        );
    }

    #[tokio::test]
    async fn session_is_cached_until_expiry() {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000)));
        let signer = Arc::new(CountingSigner(AtomicU32::new(0)));
        let manager = SessionManager::new(
            signer.clone(),
            clock.clone(),
            "0xf00d".to_string(),
            60,
        );
        let user = UserAddress::new("0xa1");

        let first = manager.get_or_create(&user).await.unwrap();
        let second = manager.get_or_create(&user).await.unwrap();
        assert_eq!(first.handle, second.handle);
        assert_eq!(signer.0.load(Ordering::SeqCst), 1);

        // Advance past the TTL; a new sign round is required.
        clock.0.store(1_000 + 61 * 60_000, Ordering::SeqCst);
        let third = manager.get_or_create(&user).await.unwrap();
        assert_ne!(first.handle, third.handle);
        assert_eq!(signer.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evict_forces_resign() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let signer = Arc::new(CountingSigner(AtomicU32::new(0)));
        let manager =
            SessionManager::new(signer.clone(), clock, "0xf00d".to_string(), 60);
        let user = UserAddress::new("0xa1");

        manager.get_or_create(&user).await.unwrap();
        manager.evict(&user);
        manager.get_or_create(&user).await.unwrap();
        assert_eq!(signer.0.load(Ordering::SeqCst), 2);
    }
}
