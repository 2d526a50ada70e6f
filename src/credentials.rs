//! In-memory credential envelopes.
//!
//! Provider credentials from a submitted plan never reach disk: they are
//! sealed with a random per-process AEAD key, keyed by task id, and purged
//! when the task reaches a terminal state or the TTL lapses. Nothing in this
//! module logs or serializes a credential value.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::RanklabError;

struct Envelope {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    expires_at: Instant,
}

pub struct CredentialVault {
    key: LessSafeKey,
    nonce_counter: AtomicU64,
    ttl: Duration,
    entries: Mutex<HashMap<String, Envelope>>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("ttl", &self.ttl)
            .field("entries", &"[REDACTED]")
            .finish()
    }
}

impl CredentialVault {
    pub fn new(ttl: Duration) -> Result<Self, RanklabError> {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes)
            .map_err(|_| RanklabError::StorageUnavailable("credential vault: no entropy".into()))?;
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
            .map_err(|_| RanklabError::StorageUnavailable("credential vault: bad key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce_counter: AtomicU64::new(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Seal per-model credentials for a task. Overwrites any prior envelope
    /// for the same task id and restarts its TTL. An empty map still gets an
    /// envelope: `fetch` distinguishes "plan had no credentials" from
    /// "envelope expired".
    pub fn store(
        &self,
        task_id: &str,
        credentials: HashMap<String, String>,
    ) -> Result<(), RanklabError> {
        let plaintext = serde_json::to_vec(&credentials)
            .map_err(|e| RanklabError::StorageUnavailable(format!("vault encode: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.nonce_counter.fetch_add(1, Ordering::Relaxed).to_be_bytes());

        let mut buf = plaintext;
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(task_id.as_bytes()),
                &mut buf,
            )
            .map_err(|_| RanklabError::StorageUnavailable("vault seal failed".into()))?;

        let mut entries = lock(&self.entries);
        entries.insert(
            task_id.to_string(),
            Envelope {
                nonce,
                ciphertext: buf,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    /// Re-hydrate credentials for a task. Fails with `credentials_missing`
    /// when the envelope never existed, expired, or belongs to a previous
    /// process. The envelope stays in place for worker retries; terminal
    /// transitions purge it.
    pub fn fetch(&self, task_id: &str) -> Result<HashMap<String, String>, RanklabError> {
        let mut entries = lock(&self.entries);
        let missing = || RanklabError::CredentialsMissing {
            task_id: task_id.to_string(),
        };

        let envelope = entries.get(task_id).ok_or_else(missing)?;
        if envelope.expires_at <= Instant::now() {
            entries.remove(task_id);
            return Err(missing());
        }

        let mut buf = envelope.ciphertext.clone();
        let nonce = Nonce::assume_unique_for_key(envelope.nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(task_id.as_bytes()), &mut buf)
            .map_err(|_| missing())?;
        serde_json::from_slice(plaintext).map_err(|_| missing())
    }

    /// Remove a task's envelope. Called on every terminal transition.
    pub fn purge(&self, task_id: &str) {
        lock(&self.entries).remove(task_id);
    }

    /// Drop expired envelopes. Called opportunistically; correctness does
    /// not depend on it (fetch checks expiry itself).
    pub fn sweep(&self) {
        let now = Instant::now();
        lock(&self.entries).retain(|_, envelope| envelope.expires_at > now);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<'a>(
    entries: &'a Mutex<HashMap<String, Envelope>>,
) -> std::sync::MutexGuard<'a, HashMap<String, Envelope>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
