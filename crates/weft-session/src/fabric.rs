//! Fabric identity
//!
//! A passive aggregate binding identity, credentials and addressing for
//! one fabric membership. Key derivations follow the Matter group-key
//! schema: the operational identity protection key is derived from the
//! fabric IPK with the compressed fabric id as salt.

use parking_lot::RwLock;
use std::collections::HashMap;
use weft_cert::{CertificateError, MatterCertificate};
use weft_core::crypto::{self, KeyPair};
use weft_core::types::{FabricId, FabricIndex, NodeId, PeerAddress, VendorId};
use weft_core::{Error, Result};

const COMPRESSED_FABRIC_INFO: &[u8] = b"CompressedFabric";
const GROUP_KEY_INFO: &[u8] = b"GroupKey v1.0";

/// Result of walking a peer's operational certificate chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    pub node_id: NodeId,
    pub case_authenticated_tags: Vec<u32>,
    pub public_key: Vec<u8>,
}

/// One fabric membership with its credentials and group secrets.
pub struct Fabric {
    pub fabric_index: FabricIndex,
    pub fabric_id: FabricId,
    pub node_id: NodeId,
    pub root_node_id: NodeId,
    pub root_vendor_id: VendorId,
    pub label: String,
    key_pair: KeyPair,
    root_public_key: Vec<u8>,
    root_cert: Vec<u8>,
    intermediate_ca_cert: Option<Vec<u8>>,
    operational_cert: Vec<u8>,
    identity_protection_key: [u8; 16],
    operational_identity_protection_key: [u8; 16],
    compressed_fabric_id: [u8; 8],
    addresses: RwLock<HashMap<NodeId, PeerAddress>>,
}

impl Fabric {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric_index: FabricIndex,
        fabric_id: FabricId,
        node_id: NodeId,
        root_node_id: NodeId,
        root_vendor_id: VendorId,
        label: impl Into<String>,
        key_pair: KeyPair,
        root_cert: Vec<u8>,
        intermediate_ca_cert: Option<Vec<u8>>,
        operational_cert: Vec<u8>,
        identity_protection_key: [u8; 16],
    ) -> Result<Self> {
        let root_public_key = MatterCertificate::parse_tlv(&root_cert)
            .map_err(Error::from)?
            .public_key;

        // CompressedFabricID = HKDF(root public key sans point tag,
        // salt = fabric id BE, "CompressedFabric", 8 bytes).
        let mut compressed_fabric_id = [0u8; 8];
        crypto::hkdf_sha256(
            &fabric_id.0.to_be_bytes(),
            &root_public_key[1..],
            COMPRESSED_FABRIC_INFO,
            &mut compressed_fabric_id,
        )
        .map_err(Error::Crypto)?;

        let mut operational_identity_protection_key = [0u8; 16];
        crypto::hkdf_sha256(
            &compressed_fabric_id,
            &identity_protection_key,
            GROUP_KEY_INFO,
            &mut operational_identity_protection_key,
        )
        .map_err(Error::Crypto)?;

        Ok(Self {
            fabric_index,
            fabric_id,
            node_id,
            root_node_id,
            root_vendor_id,
            label: label.into(),
            key_pair,
            root_public_key,
            root_cert,
            intermediate_ca_cert,
            operational_cert,
            identity_protection_key,
            operational_identity_protection_key,
            compressed_fabric_id,
            addresses: RwLock::new(HashMap::new()),
        })
    }

    pub fn root_public_key(&self) -> &[u8] {
        &self.root_public_key
    }

    pub fn root_cert(&self) -> &[u8] {
        &self.root_cert
    }

    pub fn intermediate_ca_cert(&self) -> Option<&[u8]> {
        self.intermediate_ca_cert.as_deref()
    }

    /// This node's NOC in Matter TLV form.
    pub fn operational_cert(&self) -> &[u8] {
        &self.operational_cert
    }

    pub fn identity_protection_key(&self) -> &[u8; 16] {
        &self.identity_protection_key
    }

    /// The HKDF-derived key actually used in CASE salts.
    pub fn operational_identity_protection_key(&self) -> &[u8; 16] {
        &self.operational_identity_protection_key
    }

    pub fn compressed_fabric_id(&self) -> &[u8; 8] {
        &self.compressed_fabric_id
    }

    /// Compressed fabric id as the u64 used in DNS-SD instance names.
    pub fn global_id(&self) -> u64 {
        u64::from_be_bytes(self.compressed_fabric_id)
    }

    /// Sign with the operational key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.key_pair.sign(data)
    }

    /// ECDH with the operational key (used during commissioning flows).
    pub fn ecdh(&self, peer_public_key: &[u8]) -> Result<[u8; 32]> {
        self.key_pair.ecdh(peer_public_key).map_err(Error::Crypto)
    }

    /// The CASE destination id for a peer, keyed by the operational IPK.
    pub fn destination_id(&self, initiator_random: &[u8; 32], peer_node_id: NodeId) -> Result<[u8; 32]> {
        let mut message =
            Vec::with_capacity(32 + self.root_public_key.len() + 16);
        message.extend_from_slice(initiator_random);
        message.extend_from_slice(&self.root_public_key);
        message.extend_from_slice(&self.fabric_id.0.to_le_bytes());
        message.extend_from_slice(&peer_node_id.0.to_le_bytes());
        crypto::hmac_sha256(&self.operational_identity_protection_key, &message)
            .map_err(Error::Crypto)
    }

    /// Record where a fabric member can be reached.
    pub fn set_address(&self, node_id: NodeId, address: PeerAddress) {
        self.addresses.write().insert(node_id, address);
    }

    /// Last known address of a fabric member.
    pub fn address_of(&self, node_id: NodeId) -> Option<PeerAddress> {
        self.addresses.read().get(&node_id).copied()
    }

    /// Walk a peer's certificate chain back to this fabric's root and
    /// check fabric-id consistency. Returns the authenticated identity.
    pub fn verify_credentials(
        &self,
        peer_noc: &[u8],
        peer_icac: Option<&[u8]>,
    ) -> Result<PeerCredentials> {
        let noc = MatterCertificate::parse_tlv(peer_noc).map_err(Error::from)?;

        let signer_public_key = match peer_icac {
            Some(icac_bytes) => {
                let icac = MatterCertificate::parse_tlv(icac_bytes).map_err(Error::from)?;
                icac.verify_signature(&self.root_public_key)
                    .map_err(|_| chain_error("ICAC does not chain to the fabric root"))?;
                if let Some(icac_fabric) = icac.subject.fabric_id() {
                    if icac_fabric != self.fabric_id.0 {
                        return Err(Error::UnexpectedData(
                            "ICAC bound to a different fabric".into(),
                        ));
                    }
                }
                icac.public_key
            }
            None => self.root_public_key.clone(),
        };

        noc.verify_signature(&signer_public_key)
            .map_err(|_| chain_error("NOC signature does not verify"))?;

        let noc_fabric = noc
            .subject
            .fabric_id()
            .ok_or_else(|| Error::UnexpectedData("NOC subject lacks a fabric id".into()))?;
        if noc_fabric != self.fabric_id.0 {
            return Err(Error::UnexpectedData(
                "NOC bound to a different fabric".into(),
            ));
        }
        let node_id = noc
            .subject
            .node_id()
            .ok_or_else(|| Error::UnexpectedData("NOC subject lacks a node id".into()))?;

        Ok(PeerCredentials {
            node_id: NodeId(node_id),
            case_authenticated_tags: noc.subject.case_authenticated_tags(),
            public_key: noc.public_key,
        })
    }
}

fn chain_error(message: &str) -> Error {
    CertificateError::Malformed(message.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_cert::ca::{CertificateAuthority, STORAGE_CONTEXT};
    use weft_core::storage::{MemoryStorage, StorageContext};

    pub(crate) fn make_fabric(
        ca: &CertificateAuthority,
        fabric_id: FabricId,
        node_id: NodeId,
        ipk: [u8; 16],
    ) -> Fabric {
        let key_pair = KeyPair::generate();
        let noc = ca
            .generate_noc(&key_pair.public_key(), fabric_id, node_id, &[])
            .unwrap();
        Fabric::new(
            FabricIndex(1),
            fabric_id,
            node_id,
            NodeId(0),
            VendorId(0xFFF1),
            "test",
            key_pair,
            ca.root_cert_bytes().to_vec(),
            ca.icac_cert_bytes().map(|b| b.to_vec()),
            noc.signed_tlv().unwrap(),
            ipk,
        )
        .unwrap()
    }

    fn make_ca() -> CertificateAuthority {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT);
        CertificateAuthority::load_or_create(storage, Some(false)).unwrap()
    }

    #[test]
    fn test_destination_id_is_deterministic() {
        let ca = make_ca();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let random = [3u8; 32];

        let a = fabric.destination_id(&random, NodeId(2)).unwrap();
        let b = fabric.destination_id(&random, NodeId(2)).unwrap();
        assert_eq!(a, b);

        let c = fabric.destination_id(&random, NodeId(3)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_same_root_same_global_id() {
        let ca = make_ca();
        let a = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let b = make_fabric(&ca, FabricId(0x18), NodeId(2), [7; 16]);
        assert_eq!(a.global_id(), b.global_id());

        let c = make_fabric(&ca, FabricId(0x19), NodeId(1), [7; 16]);
        assert_ne!(a.global_id(), c.global_id());
    }

    #[test]
    fn test_verify_credentials_accepts_fabric_member() {
        let ca = make_ca();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let peer = make_fabric(&ca, FabricId(0x18), NodeId(2), [7; 16]);

        let credentials = fabric
            .verify_credentials(peer.operational_cert(), None)
            .unwrap();
        assert_eq!(credentials.node_id, NodeId(2));
        assert!(credentials.case_authenticated_tags.is_empty());
    }

    #[test]
    fn test_verify_credentials_rejects_foreign_fabric() {
        let ca = make_ca();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let foreign = make_fabric(&ca, FabricId(0x99), NodeId(2), [7; 16]);

        let err = fabric
            .verify_credentials(foreign.operational_cert(), None)
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedData(_)));
    }

    #[test]
    fn test_verify_credentials_rejects_foreign_root() {
        let ca = make_ca();
        let other_ca = make_ca();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let imposter = make_fabric(&other_ca, FabricId(0x18), NodeId(2), [7; 16]);

        assert!(fabric
            .verify_credentials(imposter.operational_cert(), None)
            .is_err());
    }

    #[test]
    fn test_three_tier_chain_verifies() {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT);
        let ca = CertificateAuthority::load_or_create(storage, Some(true)).unwrap();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        let peer = make_fabric(&ca, FabricId(0x18), NodeId(2), [7; 16]);

        let credentials = fabric
            .verify_credentials(peer.operational_cert(), peer.intermediate_ca_cert())
            .unwrap();
        assert_eq!(credentials.node_id, NodeId(2));
    }

    #[test]
    fn test_address_book() {
        let ca = make_ca();
        let fabric = make_fabric(&ca, FabricId(0x18), NodeId(1), [7; 16]);
        assert!(fabric.address_of(NodeId(2)).is_none());

        let addr = PeerAddress::udp("[fe80::1]:5540".parse().unwrap());
        fabric.set_address(NodeId(2), addr);
        assert_eq!(fabric.address_of(NodeId(2)), Some(addr));
    }
}
