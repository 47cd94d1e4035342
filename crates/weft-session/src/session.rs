//! Session manager
//!
//! Allocates local session ids, installs secure sessions from CASE key
//! material, and keeps resumption records (persisted through storage) so
//! later handshakes can take the Sigma2Resume shortcut.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use weft_core::crypto;
use weft_core::storage::StorageContext;
use weft_core::types::{FabricIndex, NodeId, SessionId};
use weft_core::{Error, Result};

/// Storage context holding resumption records.
pub const STORAGE_CONTEXT: &str = "sessions";

const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
const SESSION_RESUMPTION_KEYS_INFO: &[u8] = b"SessionResumptionKeys";

/// MRP-style session parameters advertised during establishment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub session_idle_interval_ms: u32,
    pub session_active_interval_ms: u32,
    pub session_active_threshold_ms: u16,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            session_idle_interval_ms: 500,
            session_active_interval_ms: 300,
            session_active_threshold_ms: 4000,
        }
    }
}

/// Symmetric key material for one direction pair plus the attestation
/// challenge, as derived from the CASE secrets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    pub encrypt_key: [u8; 16],
    pub decrypt_key: [u8; 16],
    pub attestation_challenge: [u8; 16],
}

/// Derive the three session keys. The initiator encrypts with the I2R key;
/// the responder mirrors.
pub fn derive_session_keys(
    shared_secret: &[u8],
    salt: &[u8],
    is_initiator: bool,
    resumption: bool,
) -> Result<SessionKeys> {
    let info = if resumption {
        SESSION_RESUMPTION_KEYS_INFO
    } else {
        SESSION_KEYS_INFO
    };
    let mut okm = [0u8; 48];
    crypto::hkdf_sha256(salt, shared_secret, info, &mut okm).map_err(Error::Crypto)?;

    let mut i2r = [0u8; 16];
    let mut r2i = [0u8; 16];
    let mut attestation_challenge = [0u8; 16];
    i2r.copy_from_slice(&okm[..16]);
    r2i.copy_from_slice(&okm[16..32]);
    attestation_challenge.copy_from_slice(&okm[32..]);

    let (encrypt_key, decrypt_key) = if is_initiator { (i2r, r2i) } else { (r2i, i2r) };
    Ok(SessionKeys {
        encrypt_key,
        decrypt_key,
        attestation_challenge,
    })
}

/// An installed secure session.
#[derive(Debug)]
pub struct SecureSession {
    pub id: SessionId,
    pub peer_session_id: SessionId,
    pub fabric_index: FabricIndex,
    pub peer_node_id: NodeId,
    pub keys: SessionKeys,
    pub is_initiator: bool,
    pub is_resumption: bool,
    pub peer_session_parameters: SessionParameters,
    pub case_authenticated_tags: Vec<u32>,
    outbound_counter: AtomicU32,
}

impl SecureSession {
    /// Allocate the next outbound message counter.
    pub fn next_message_counter(&self) -> u32 {
        self.outbound_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// AEAD nonce: security flags, counter (LE), source node id (LE).
    fn nonce(counter: u32, source_node_id: NodeId) -> [u8; crypto::AEAD_NONCE_LEN] {
        let mut nonce = [0u8; crypto::AEAD_NONCE_LEN];
        nonce[1..5].copy_from_slice(&counter.to_le_bytes());
        nonce[5..].copy_from_slice(&source_node_id.0.to_le_bytes());
        nonce
    }

    /// Protect an outbound payload; output carries the AEAD tag.
    pub fn encrypt(
        &self,
        counter: u32,
        source_node_id: NodeId,
        aad: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        crypto::aes128_ccm_encrypt(
            &self.keys.encrypt_key,
            &Self::nonce(counter, source_node_id),
            aad,
            payload,
        )
        .map_err(Error::Crypto)
    }

    /// Open an inbound payload.
    pub fn decrypt(
        &self,
        counter: u32,
        source_node_id: NodeId,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        crypto::aes128_ccm_decrypt(
            &self.keys.decrypt_key,
            &Self::nonce(counter, source_node_id),
            aad,
            ciphertext,
        )
        .map_err(Error::Crypto)
    }
}

/// Evictable CASE resumption state for one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumptionRecord {
    pub fabric_index: u8,
    pub peer_node_id: u64,
    pub shared_secret: [u8; 32],
    pub resumption_id: [u8; 16],
    pub session_parameters: SessionParameters,
    pub case_authenticated_tags: Vec<u32>,
}

/// Owns session ids, live sessions and resumption records.
pub struct SessionManager {
    storage: StorageContext,
    next_session_id: Mutex<u16>,
    sessions: RwLock<HashMap<SessionId, Arc<SecureSession>>>,
    resumption_records: RwLock<HashMap<(FabricIndex, NodeId), ResumptionRecord>>,
}

fn resumption_key(fabric_index: FabricIndex, peer_node_id: NodeId) -> String {
    format!("resumption-{}-{:016X}", fabric_index.0, peer_node_id.0)
}

impl SessionManager {
    /// Create a manager, loading persisted resumption records.
    pub fn new(storage: StorageContext) -> Result<Self> {
        let mut records = HashMap::new();
        for key in storage.keys()? {
            if !key.starts_with("resumption-") {
                continue;
            }
            if let Some(record) = storage.get_record::<ResumptionRecord>(&key)? {
                records.insert(
                    (FabricIndex(record.fabric_index), NodeId(record.peer_node_id)),
                    record,
                );
            }
        }
        if !records.is_empty() {
            info!(count = records.len(), "loaded resumption records");
        }
        Ok(Self {
            storage,
            next_session_id: Mutex::new(1),
            sessions: RwLock::new(HashMap::new()),
            resumption_records: RwLock::new(records),
        })
    }

    /// Allocate a fresh non-zero session id, skipping ids still in use.
    pub fn allocate_session_id(&self) -> SessionId {
        let mut next = self.next_session_id.lock();
        let sessions = self.sessions.read();
        loop {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            let id = SessionId(candidate);
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Install a session derived from CASE key material.
    #[allow(clippy::too_many_arguments)]
    pub fn install_session(
        &self,
        id: SessionId,
        peer_session_id: SessionId,
        fabric_index: FabricIndex,
        peer_node_id: NodeId,
        shared_secret: &[u8],
        salt: &[u8],
        is_initiator: bool,
        is_resumption: bool,
        peer_session_parameters: SessionParameters,
        case_authenticated_tags: Vec<u32>,
    ) -> Result<Arc<SecureSession>> {
        let keys = derive_session_keys(shared_secret, salt, is_initiator, is_resumption)?;
        let session = Arc::new(SecureSession {
            id,
            peer_session_id,
            fabric_index,
            peer_node_id,
            keys,
            is_initiator,
            is_resumption,
            peer_session_parameters,
            case_authenticated_tags,
            outbound_counter: AtomicU32::new(1),
        });
        self.sessions.write().insert(id, session.clone());
        debug!(
            session = id.0,
            peer_session = peer_session_id.0,
            peer = %peer_node_id,
            resumption = is_resumption,
            "session installed"
        );
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<SecureSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Drop a session; its id becomes reusable.
    pub fn remove_session(&self, id: SessionId) {
        self.sessions.write().remove(&id);
    }

    pub fn find_resumption_record(
        &self,
        fabric_index: FabricIndex,
        peer_node_id: NodeId,
    ) -> Option<ResumptionRecord> {
        self.resumption_records
            .read()
            .get(&(fabric_index, peer_node_id))
            .cloned()
    }

    /// Find a record by the resumption id a peer presented.
    pub fn find_resumption_record_by_id(&self, resumption_id: &[u8; 16]) -> Option<ResumptionRecord> {
        self.resumption_records
            .read()
            .values()
            .find(|r| &r.resumption_id == resumption_id)
            .cloned()
    }

    /// Store or replace a resumption record and persist it.
    pub fn save_resumption_record(&self, record: ResumptionRecord) -> Result<()> {
        let key = resumption_key(FabricIndex(record.fabric_index), NodeId(record.peer_node_id));
        self.storage.set_record(&key, &record)?;
        self.resumption_records.write().insert(
            (FabricIndex(record.fabric_index), NodeId(record.peer_node_id)),
            record,
        );
        Ok(())
    }

    /// Evict a resumption record.
    pub fn remove_resumption_record(
        &self,
        fabric_index: FabricIndex,
        peer_node_id: NodeId,
    ) -> Result<()> {
        self.storage
            .delete(&resumption_key(fabric_index, peer_node_id))?;
        self.resumption_records
            .write()
            .remove(&(fabric_index, peer_node_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::storage::MemoryStorage;

    fn manager() -> SessionManager {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT);
        SessionManager::new(storage).unwrap()
    }

    #[test]
    fn test_session_ids_are_unique_and_non_zero() {
        let manager = manager();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = manager.allocate_session_id();
            assert_ne!(id.0, 0);
            assert!(seen.insert(id));
            // Keep the id occupied so it cannot be handed out again.
            manager
                .install_session(
                    id,
                    SessionId(1),
                    FabricIndex(1),
                    NodeId(1),
                    &[0; 32],
                    &[],
                    true,
                    false,
                    SessionParameters::default(),
                    Vec::new(),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_key_derivation_mirrors_roles() {
        let secret = [9u8; 32];
        let salt = [1u8; 16];
        let initiator = derive_session_keys(&secret, &salt, true, false).unwrap();
        let responder = derive_session_keys(&secret, &salt, false, false).unwrap();

        assert_eq!(initiator.encrypt_key, responder.decrypt_key);
        assert_eq!(initiator.decrypt_key, responder.encrypt_key);
        assert_eq!(
            initiator.attestation_challenge,
            responder.attestation_challenge
        );
        assert_ne!(initiator.encrypt_key, initiator.decrypt_key);
    }

    #[test]
    fn test_resumption_info_changes_keys() {
        let secret = [9u8; 32];
        let salt = [1u8; 16];
        let full = derive_session_keys(&secret, &salt, true, false).unwrap();
        let resumed = derive_session_keys(&secret, &salt, true, true).unwrap();
        assert_ne!(full.encrypt_key, resumed.encrypt_key);
    }

    #[test]
    fn test_message_protection_roundtrip() {
        let manager = manager();
        let secret = [5u8; 32];
        let salt = [6u8; 16];
        let initiator = manager
            .install_session(
                SessionId(10),
                SessionId(20),
                FabricIndex(1),
                NodeId(2),
                &secret,
                &salt,
                true,
                false,
                SessionParameters::default(),
                Vec::new(),
            )
            .unwrap();
        let responder = manager
            .install_session(
                SessionId(20),
                SessionId(10),
                FabricIndex(1),
                NodeId(1),
                &secret,
                &salt,
                false,
                false,
                SessionParameters::default(),
                Vec::new(),
            )
            .unwrap();

        let counter = initiator.next_message_counter();
        let aad = b"header";
        let ciphertext = initiator
            .encrypt(counter, NodeId(1), aad, b"interaction payload")
            .unwrap();
        let plaintext = responder.decrypt(counter, NodeId(1), aad, &ciphertext).unwrap();
        assert_eq!(plaintext, b"interaction payload");

        // A different counter breaks the nonce and fails authentication.
        assert!(responder
            .decrypt(counter + 1, NodeId(1), aad, &ciphertext)
            .is_err());

        // Counters advance monotonically.
        assert!(initiator.next_message_counter() > counter);
    }

    #[test]
    fn test_resumption_records_persist() {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT);
        let record = ResumptionRecord {
            fabric_index: 1,
            peer_node_id: 0x55,
            shared_secret: [2; 32],
            resumption_id: [3; 16],
            session_parameters: SessionParameters::default(),
            case_authenticated_tags: vec![0x0001_0001],
        };

        {
            let manager = SessionManager::new(storage.clone()).unwrap();
            manager.save_resumption_record(record.clone()).unwrap();
        }

        // A new manager over the same storage sees the record.
        let manager = SessionManager::new(storage).unwrap();
        let loaded = manager
            .find_resumption_record(FabricIndex(1), NodeId(0x55))
            .unwrap();
        assert_eq!(loaded.resumption_id, record.resumption_id);
        assert_eq!(
            manager
                .find_resumption_record_by_id(&[3; 16])
                .unwrap()
                .peer_node_id,
            0x55
        );

        manager
            .remove_resumption_record(FabricIndex(1), NodeId(0x55))
            .unwrap();
        assert!(manager
            .find_resumption_record(FabricIndex(1), NodeId(0x55))
            .is_none());
    }
}
