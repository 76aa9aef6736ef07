//! HMAC message authentication for inter-agent traffic.
//!
//! Outbound requests carry `X-Agent-Id`, `X-Timestamp`, `X-Nonce`, and
//! `X-Signature: HMAC-SHA256(key, "{method}\n{path}\n{ts}\n{nonce}\n{sha256(body)}")`.
//! Per-agent keys are derived from the master secret, so only their hash
//! ever reaches the graph. Verification is constant-time and answers every
//! failure identically; a bounded TTL replay cache rejects nonce reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::AgentId;
use crate::domain::ports::GraphStore;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between signer and verifier.
pub const MAX_SKEW_SECS: i64 = 300;

/// Replay cache TTL; equals the skew window so a nonce outlives its
/// timestamp validity.
pub const REPLAY_TTL: Duration = Duration::from_secs(300);

/// Upper bound on cached nonces.
pub const REPLAY_CAPACITY: usize = 4_096;

/// Derives per-agent signing keys from the master secret.
#[derive(Clone)]
pub struct KeyDerivation {
    secret: Arc<Vec<u8>>,
}

impl KeyDerivation {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
        }
    }

    /// `HMAC-SHA256(master_secret, agent_id)`. Deterministic, so every
    /// process derives the same key while only its hash is persisted.
    pub fn key_for(&self, agent: AgentId) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(agent.as_str().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Hex hash of an agent's derived key, matching `AgentKey.key_hash`.
    pub fn key_hash_for(&self, agent: AgentId) -> String {
        hex::encode(Sha256::digest(self.key_for(agent)))
    }
}

/// The string the signature covers.
fn canonical_string(method: &str, path: &str, timestamp: i64, nonce: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{method}\n{path}\n{timestamp}\n{nonce}\n{body_hash}")
}

fn compute_signature(key: &[u8], canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Headers attached to a signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub agent_id: AgentId,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

/// Signs outbound requests for one agent.
#[derive(Clone)]
pub struct MessageSigner {
    agent: AgentId,
    key: Vec<u8>,
}

impl MessageSigner {
    pub fn new(derivation: &KeyDerivation, agent: AgentId) -> Self {
        Self {
            agent,
            key: derivation.key_for(agent),
        }
    }

    pub fn sign(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders {
        let timestamp = Utc::now().timestamp();
        let nonce = Uuid::new_v4().simple().to_string();
        let canonical = canonical_string(method, path, timestamp, &nonce, body);
        SignedHeaders {
            agent_id: self.agent,
            timestamp,
            nonce,
            signature: compute_signature(&self.key, &canonical),
        }
    }
}

/// Bounded TTL store of recently seen nonces. Safe for concurrent
/// verifiers; the lock is held only for the map update.
pub struct ReplayCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_TTL, REPLAY_CAPACITY)
    }
}

impl ReplayCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Record a nonce. Returns false if it was already seen inside the TTL.
    pub fn insert(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("replay cache lock");
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        if seen.contains_key(nonce) {
            return false;
        }
        if seen.len() >= self.capacity {
            // Evict the oldest entry to stay bounded.
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(n, _)| n.clone())
            {
                seen.remove(&oldest);
            }
        }
        seen.insert(nonce.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("replay cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rejection counters exposed for operational visibility.
#[derive(Debug, Default)]
pub struct VerifierCounters {
    pub replay_rejected: AtomicU64,
    pub auth_rejected: AtomicU64,
}

/// Verifies inbound signed requests.
///
/// Every failure path returns an integrity error; the HTTP layer collapses
/// them all into one undifferentiated 401.
pub struct MessageVerifier {
    derivation: KeyDerivation,
    graph: Arc<dyn GraphStore>,
    replay: ReplayCache,
    pub counters: VerifierCounters,
}

impl MessageVerifier {
    pub fn new(derivation: KeyDerivation, graph: Arc<dyn GraphStore>) -> Self {
        Self {
            derivation,
            graph,
            replay: ReplayCache::default(),
            counters: VerifierCounters::default(),
        }
    }

    pub async fn verify(
        &self,
        agent_id: &str,
        timestamp: i64,
        nonce: &str,
        signature: &str,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> CoreResult<AgentId> {
        let Some(agent) = AgentId::from_str(agent_id) else {
            self.counters.auth_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SignatureInvalid);
        };

        // The sender must hold an active, unexpired key whose hash matches
        // the derived material.
        let key_row = self.graph.active_key(agent).await.map_err(|err| {
            tracing::warn!(error = %err, "key lookup failed during verification");
            CoreError::SignatureInvalid
        })?;
        let Some(key_row) = key_row else {
            self.counters.auth_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SignatureInvalid);
        };
        if key_row.key_hash != self.derivation.key_hash_for(agent) {
            self.counters.auth_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SignatureInvalid);
        }

        let skew = (Utc::now().timestamp() - timestamp).abs();
        if skew > MAX_SKEW_SECS {
            self.counters.auth_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SignatureInvalid);
        }

        let canonical = canonical_string(method, path, timestamp, nonce, body);
        let key = self.derivation.key_for(agent);
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(canonical.as_bytes());
        let decoded = hex::decode(signature).unwrap_or_default();
        if mac.verify_slice(&decoded).is_err() {
            self.counters.auth_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SignatureInvalid);
        }

        // Signature valid: now consume the nonce. Checking last keeps a
        // forged request from poisoning the cache.
        if !self.replay.insert(nonce) {
            self.counters.replay_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::Replay);
        }

        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryGraphStore;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    async fn verifier_with_keys() -> (KeyDerivation, MessageVerifier) {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        let derivation = KeyDerivation::new(SECRET.as_bytes().to_vec());
        for agent in AgentId::ALL {
            graph
                .upsert_agent_key(agent, &derivation.key_for(agent))
                .await
                .unwrap();
        }
        let verifier = MessageVerifier::new(derivation.clone(), graph);
        (derivation, verifier)
    }

    #[tokio::test]
    async fn test_round_trip_accepts() {
        let (derivation, verifier) = verifier_with_keys().await;
        let signer = MessageSigner::new(&derivation, AgentId::Main);
        let body = br#"{"task_id":"t"}"#;
        let headers = signer.sign("POST", "/agent/researcher/message", body);

        let agent = verifier
            .verify(
                headers.agent_id.as_str(),
                headers.timestamp,
                &headers.nonce,
                &headers.signature,
                "POST",
                "/agent/researcher/message",
                body,
            )
            .await
            .unwrap();
        assert_eq!(agent, AgentId::Main);
    }

    #[tokio::test]
    async fn test_altered_body_rejects() {
        let (derivation, verifier) = verifier_with_keys().await;
        let signer = MessageSigner::new(&derivation, AgentId::Main);
        let headers = signer.sign("POST", "/agent/researcher/message", b"original");

        let err = verifier
            .verify(
                headers.agent_id.as_str(),
                headers.timestamp,
                &headers.nonce,
                &headers.signature,
                "POST",
                "/agent/researcher/message",
                b"tampered",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SignatureInvalid));
        assert_eq!(verifier.counters.auth_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_replayed_nonce_rejects_and_counts() {
        let (derivation, verifier) = verifier_with_keys().await;
        let signer = MessageSigner::new(&derivation, AgentId::Main);
        let body = b"payload";
        let headers = signer.sign("POST", "/agent/ops/message", body);

        verifier
            .verify(
                headers.agent_id.as_str(),
                headers.timestamp,
                &headers.nonce,
                &headers.signature,
                "POST",
                "/agent/ops/message",
                body,
            )
            .await
            .unwrap();

        let err = verifier
            .verify(
                headers.agent_id.as_str(),
                headers.timestamp,
                &headers.nonce,
                &headers.signature,
                "POST",
                "/agent/ops/message",
                body,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Replay));
        assert_eq!(verifier.counters.replay_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejects() {
        let (derivation, verifier) = verifier_with_keys().await;
        let key = derivation.key_for(AgentId::Main);
        let timestamp = Utc::now().timestamp() - MAX_SKEW_SECS - 10;
        let nonce = Uuid::new_v4().simple().to_string();
        let canonical = canonical_string("POST", "/agent/ops/message", timestamp, &nonce, b"x");
        let signature = compute_signature(&key, &canonical);

        let err = verifier
            .verify("main", timestamp, &nonce, &signature, "POST", "/agent/ops/message", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SignatureInvalid));
    }

    #[tokio::test]
    async fn test_unknown_agent_rejects_uniformly() {
        let (_, verifier) = verifier_with_keys().await;
        let err = verifier
            .verify("intruder", Utc::now().timestamp(), "n", "00", "POST", "/x", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SignatureInvalid));
    }

    #[tokio::test]
    async fn test_wrong_method_or_path_rejects() {
        let (derivation, verifier) = verifier_with_keys().await;
        let signer = MessageSigner::new(&derivation, AgentId::Main);
        let headers = signer.sign("POST", "/agent/ops/message", b"x");

        let err = verifier
            .verify(
                headers.agent_id.as_str(),
                headers.timestamp,
                &headers.nonce,
                &headers.signature,
                "POST",
                "/agent/writer/message",
                b"x",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SignatureInvalid));
    }

    #[test]
    fn test_replay_cache_bounds() {
        let cache = ReplayCache::new(Duration::from_secs(300), 3);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        assert!(!cache.insert("a"), "duplicate rejected");

        // Capacity bound: inserting a fourth evicts the oldest.
        assert!(cache.insert("d"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_replay_cache_ttl_expiry() {
        let cache = ReplayCache::new(Duration::from_millis(1), 10);
        assert!(cache.insert("n"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.insert("n"), "expired nonce is fresh again");
    }

    #[test]
    fn test_key_derivation_is_per_agent() {
        let derivation = KeyDerivation::new(SECRET.as_bytes().to_vec());
        assert_ne!(
            derivation.key_for(AgentId::Main),
            derivation.key_for(AgentId::Ops)
        );
        assert_eq!(
            derivation.key_hash_for(AgentId::Main),
            derivation.key_hash_for(AgentId::Main)
        );
    }
}
