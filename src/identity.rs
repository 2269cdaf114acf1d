// =============================================================================
// Identity Vault — per-agent ED25519 identity, signing, verification
// =============================================================================
//
// Each strategy agent gets an ED25519 keypair generated at process start.
// SECURITY: private keys live only in this struct's memory; the registry
// document carries the public key alone, and nothing here implements
// Serialize for the key material.
//
// Signatures cover a canonical rendering of the payload (sorted keys, no
// whitespace) plus the nonce and timestamp, so tampering with any signed
// field breaks verification. Nonces are tracked in bounded LRU sets; a
// nonce seen twice is a replay and the signal is dropped, never retried.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult, SecurityViolation};
use crate::store::{agent_registry_path, set_doc, Store};

/// Bound on each nonce set. Old entries are evicted in insertion order.
const NONCE_LRU_CAPACITY: usize = 4096;

/// Public identity record persisted to the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyIdentity {
    pub agent_id: String,
    /// Hex-encoded ED25519 public key (64 chars).
    pub public_key: String,
    pub status: String,
    pub registered_at: DateTime<Utc>,
}

/// Detached signature attached to an orchestrated signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSignature {
    pub agent_id: String,
    /// Hex-encoded 64-byte ED25519 signature.
    pub signature: String,
    pub nonce: String,
    pub signed_at: DateTime<Utc>,
    /// First 16 hex chars of SHA-256 over the raw public key.
    pub cert_id: String,
}

// =============================================================================
// Canonical payload form
// =============================================================================

/// Render a JSON value canonically: object keys sorted, no whitespace.
///
/// Both signer and verifier derive the signed message through this function,
/// so two structurally equal payloads always produce the same bytes.
pub fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string keys always serialise"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar JSON always serialises"),
    }
}

fn signing_message(payload: &Value, nonce: &str, signed_at: &DateTime<Utc>) -> Vec<u8> {
    format!(
        "{}\n{}\n{}",
        canonical_json(payload),
        nonce,
        signed_at.to_rfc3339()
    )
    .into_bytes()
}

// =============================================================================
// Bounded nonce set
// =============================================================================

struct NonceLru {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NonceLru {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, nonce: &str) -> bool {
        self.seen.contains(nonce)
    }

    /// Insert a nonce. Returns `false` when it was already present.
    fn insert(&mut self, nonce: String) -> bool {
        if self.seen.contains(&nonce) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(nonce.clone());
        self.seen.insert(nonce);
        true
    }
}

// =============================================================================
// Vault
// =============================================================================

struct VaultInner {
    keys: HashMap<String, SigningKey>,
    identities: HashMap<String, StrategyIdentity>,
    issued_nonces: NonceLru,
    consumed_nonces: NonceLru,
}

/// Process-scoped identity vault. Safe for concurrent use.
pub struct IdentityVault {
    session_id: String,
    inner: RwLock<VaultInner>,
}

impl IdentityVault {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            inner: RwLock::new(VaultInner {
                keys: HashMap::new(),
                identities: HashMap::new(),
                issued_nonces: NonceLru::new(NONCE_LRU_CAPACITY),
                consumed_nonces: NonceLru::new(NONCE_LRU_CAPACITY),
            }),
        }
    }

    /// Stable identifier for this process's signing session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Idempotently create (or return) the identity for `agent_id` and
    /// upsert its public record into the agent registry.
    pub async fn register_or_load(
        &self,
        store: &dyn Store,
        agent_id: &str,
    ) -> CoreResult<StrategyIdentity> {
        let identity = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.identities.get(agent_id) {
                existing.clone()
            } else {
                let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
                let verifying_key = signing_key.verifying_key();
                let identity = StrategyIdentity {
                    agent_id: agent_id.to_string(),
                    public_key: hex::encode(verifying_key.to_bytes()),
                    status: "active".to_string(),
                    registered_at: Utc::now(),
                };
                inner.keys.insert(agent_id.to_string(), signing_key);
                inner
                    .identities
                    .insert(agent_id.to_string(), identity.clone());
                info!(agent_id, cert_id = %cert_id_for(&verifying_key), "agent identity generated");
                identity
            }
        };

        set_doc(store, &agent_registry_path(agent_id), &identity).await?;
        Ok(identity)
    }

    /// The public identity for `agent_id`, if registered.
    pub fn identity(&self, agent_id: &str) -> Option<StrategyIdentity> {
        self.inner.read().identities.get(agent_id).cloned()
    }

    // ── Signing ─────────────────────────────────────────────────────────

    /// Produce a detached signature over `payload` for `agent_id`.
    pub fn sign(&self, agent_id: &str, payload: &Value) -> CoreResult<SignalSignature> {
        let mut inner = self.inner.write();

        let key = inner
            .keys
            .get(agent_id)
            .ok_or_else(|| SecurityViolation::UnknownAgent(agent_id.to_string()))?;

        let nonce = Uuid::new_v4().to_string();
        let signed_at = Utc::now();
        let message = signing_message(payload, &nonce, &signed_at);
        let signature: Signature = key.sign(&message);
        let cert_id = cert_id_for(&key.verifying_key());

        // Nonces are random; a collision here means something is badly
        // wrong upstream of us, so surface it rather than papering over.
        if !inner.issued_nonces.insert(nonce.clone()) {
            return Err(SecurityViolation::ReplayedNonce {
                agent_id: agent_id.to_string(),
                nonce,
            }
            .into());
        }

        Ok(SignalSignature {
            agent_id: agent_id.to_string(),
            signature: hex::encode(signature.to_bytes()),
            nonce,
            signed_at,
            cert_id,
        })
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Verify a detached signature against the canonical payload, then mark
    /// its nonce consumed. Each signature validates at most once per process.
    pub fn verify(&self, payload: &Value, sig: &SignalSignature) -> CoreResult<()> {
        let mut inner = self.inner.write();

        let identity = inner
            .identities
            .get(&sig.agent_id)
            .ok_or_else(|| SecurityViolation::UnknownAgent(sig.agent_id.clone()))?;

        let key_bytes: [u8; 32] = hex::decode(&identity.public_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SecurityViolation::BadSignature(sig.agent_id.clone()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| SecurityViolation::BadSignature(sig.agent_id.clone()))?;

        let sig_bytes: [u8; 64] = hex::decode(&sig.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SecurityViolation::BadSignature(sig.agent_id.clone()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        let message = signing_message(payload, &sig.nonce, &sig.signed_at);
        verifying_key
            .verify(&message, &signature)
            .map_err(|_| SecurityViolation::BadSignature(sig.agent_id.clone()))?;

        if inner.consumed_nonces.contains(&sig.nonce) {
            warn!(agent_id = %sig.agent_id, nonce = %sig.nonce, "nonce replay detected");
            return Err(SecurityViolation::ReplayedNonce {
                agent_id: sig.agent_id.clone(),
                nonce: sig.nonce.clone(),
            }
            .into());
        }
        inner.consumed_nonces.insert(sig.nonce.clone());

        Ok(())
    }

    /// Persist a security violation to the shared security log.
    pub async fn log_violation(
        &self,
        store: &dyn Store,
        violation: &SecurityViolation,
        context: &str,
    ) -> CoreResult<()> {
        let id = Uuid::new_v4().to_string();
        let doc = serde_json::json!({
            "kind": violation.kind(),
            "detail": violation.to_string(),
            "context": context,
            "session_id": self.session_id,
            "ts": Utc::now().to_rfc3339(),
        });
        store
            .set(&crate::store::security_violation_path(&id), doc)
            .await
    }
}

impl Default for IdentityVault {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdentityVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("IdentityVault")
            .field("session_id", &self.session_id)
            .field("agents", &inner.identities.len())
            .finish()
    }
}

fn cert_id_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(digest)[..16].to_string()
}
