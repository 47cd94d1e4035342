//! Certificate authority
//!
//! Owns the root material for a controller-side fabric and mints node
//! operational certificates. State is persisted in the `"certificates"`
//! storage context and reloaded on construction; a CA is never
//! reconfigured between 2-tier and 3-tier after first initialization.

use crate::cert::{
    key_identifier, key_usage, BasicConstraints, DistinguishedName, DnField, ExtendedKeyUsage,
    Extensions, MatterCertificate, KEY_IDENTIFIER_LEN,
};
use parking_lot::Mutex;
use tracing::info;
use weft_core::crypto::KeyPair;
use weft_core::storage::StorageContext;
use weft_core::types::{
    validate_case_authenticated_tags, CaseAuthenticatedTag, FabricId, MatterEpochSecs, NodeId,
};
use weft_core::{Error, Result};

/// Storage context holding CA state.
pub const STORAGE_CONTEXT: &str = "certificates";

const KEY_ROOT_CERT_ID: &str = "rootCertId";
const KEY_ROOT_KEY_PAIR: &str = "rootKeyPair";
const KEY_ROOT_KEY_IDENTIFIER: &str = "rootKeyIdentifier";
const KEY_ROOT_CERT_BYTES: &str = "rootCertBytes";
const KEY_NEXT_CERTIFICATE_ID: &str = "nextCertificateId";
const KEY_ICAC_CERT_ID: &str = "icacCertId";
const KEY_ICAC_KEY_PAIR: &str = "icacKeyPair";
const KEY_ICAC_KEY_IDENTIFIER: &str = "icacKeyIdentifier";
const KEY_ICAC_CERT_BYTES: &str = "icacCertBytes";

/// Certificate validity window: one second of clock-skew slack back, ten
/// years forward.
const VALIDITY_SLACK_SECS: u64 = 1;
const VALIDITY_SECS: u64 = 315_576_000;

#[derive(Debug)]
struct IntermediateCa {
    cert_id: u64,
    key_pair: KeyPair,
    key_identifier: [u8; KEY_IDENTIFIER_LEN],
    cert_bytes: Vec<u8>,
}

/// Controller-side certificate authority.
#[derive(Debug)]
pub struct CertificateAuthority {
    storage: StorageContext,
    root_cert_id: u64,
    root_key_pair: Option<KeyPair>,
    root_key_identifier: [u8; KEY_IDENTIFIER_LEN],
    root_cert_bytes: Vec<u8>,
    next_certificate_id: Mutex<u64>,
    icac: Option<IntermediateCa>,
}

fn serial_bytes(cert_id: u64) -> Vec<u8> {
    let bytes = cert_id.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    bytes[start..].to_vec()
}

fn validity_window() -> (MatterEpochSecs, MatterEpochSecs) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (
        MatterEpochSecs::from_unix(now - VALIDITY_SLACK_SECS),
        MatterEpochSecs::from_unix(now + VALIDITY_SECS),
    )
}

fn load_key_identifier(bytes: Vec<u8>) -> Result<[u8; KEY_IDENTIFIER_LEN]> {
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Implementation("stored key identifier has wrong length".into()))
}

impl CertificateAuthority {
    /// Load the CA from storage, or generate and persist a fresh one.
    ///
    /// `require_icac` selects 2-tier (`Some(false)`) or 3-tier
    /// (`Some(true)`); `None` accepts whatever storage holds (3-tier only
    /// for a fresh CA when explicitly requested). A conflict between the
    /// requested tier and stored state is an implementation error.
    pub fn load_or_create(storage: StorageContext, require_icac: Option<bool>) -> Result<Self> {
        if storage.get(KEY_ROOT_CERT_ID)?.is_some() {
            return Self::load(storage, require_icac);
        }
        Self::generate(storage, require_icac.unwrap_or(false))
    }

    fn load(storage: StorageContext, require_icac: Option<bool>) -> Result<Self> {
        let root_cert_id: u64 = storage
            .get_record(KEY_ROOT_CERT_ID)?
            .ok_or_else(|| Error::Implementation("missing rootCertId".into()))?;
        let root_key_pair = match storage.get(KEY_ROOT_KEY_PAIR)? {
            Some(bytes) => Some(KeyPair::from_bytes(&bytes).map_err(Error::Crypto)?),
            None => None,
        };
        let root_key_identifier = load_key_identifier(
            storage
                .get(KEY_ROOT_KEY_IDENTIFIER)?
                .ok_or_else(|| Error::Implementation("missing rootKeyIdentifier".into()))?,
        )?;
        let root_cert_bytes = storage
            .get(KEY_ROOT_CERT_BYTES)?
            .ok_or_else(|| Error::Implementation("missing rootCertBytes".into()))?;
        let next_certificate_id: u64 = storage
            .get_record(KEY_NEXT_CERTIFICATE_ID)?
            .ok_or_else(|| Error::Implementation("missing nextCertificateId".into()))?;

        let icac = match storage.get_record::<u64>(KEY_ICAC_CERT_ID)? {
            Some(cert_id) => {
                let key_pair = KeyPair::from_bytes(
                    &storage
                        .get(KEY_ICAC_KEY_PAIR)?
                        .ok_or_else(|| Error::Implementation("missing icacKeyPair".into()))?,
                )
                .map_err(Error::Crypto)?;
                let key_identifier = load_key_identifier(
                    storage
                        .get(KEY_ICAC_KEY_IDENTIFIER)?
                        .ok_or_else(|| Error::Implementation("missing icacKeyIdentifier".into()))?,
                )?;
                let cert_bytes = storage
                    .get(KEY_ICAC_CERT_BYTES)?
                    .ok_or_else(|| Error::Implementation("missing icacCertBytes".into()))?;
                Some(IntermediateCa {
                    cert_id,
                    key_pair,
                    key_identifier,
                    cert_bytes,
                })
            }
            None => None,
        };

        if let Some(required) = require_icac {
            if required != icac.is_some() {
                return Err(Error::Implementation(format!(
                    "stored CA is {}-tier but {}-tier was requested",
                    if icac.is_some() { 3 } else { 2 },
                    if required { 3 } else { 2 },
                )));
            }
        }
        if icac.is_none() && root_key_pair.is_none() {
            return Err(Error::Implementation(
                "2-tier CA requires the root key pair".into(),
            ));
        }

        info!(root_cert_id, tier = if icac.is_some() { 3 } else { 2 }, "certificate authority loaded");
        Ok(Self {
            storage,
            root_cert_id,
            root_key_pair,
            root_key_identifier,
            root_cert_bytes,
            next_certificate_id: Mutex::new(next_certificate_id),
            icac,
        })
    }

    fn generate(storage: StorageContext, with_icac: bool) -> Result<Self> {
        let root_cert_id = 0u64;
        let root_key_pair = KeyPair::generate();
        let root_public_key = root_key_pair.public_key().to_vec();
        let root_key_identifier = key_identifier(&root_public_key);
        let (not_before, not_after) = validity_window();

        let mut root_cert = MatterCertificate::build(
            serial_bytes(root_cert_id),
            DistinguishedName::new(vec![DnField::RcacId(root_cert_id)]),
            DistinguishedName::new(vec![DnField::RcacId(root_cert_id)]),
            not_before,
            not_after,
            root_public_key,
            Extensions {
                basic_constraints: Some(BasicConstraints {
                    is_ca: true,
                    path_len: None,
                }),
                key_usage: Some(key_usage::KEY_CERT_SIGN | key_usage::CRL_SIGN),
                extended_key_usage: None,
                subject_key_identifier: Some(root_key_identifier),
                authority_key_identifier: Some(root_key_identifier),
                future_extensions: Vec::new(),
            },
        );
        root_cert
            .sign(&root_key_pair)
            .map_err(Error::from)?;
        let root_cert_bytes = root_cert.signed_tlv().map_err(Error::from)?;

        let mut next_certificate_id = 1u64;
        let icac = if with_icac {
            let cert_id = next_certificate_id;
            next_certificate_id += 1;
            let key_pair = KeyPair::generate();
            let public_key = key_pair.public_key().to_vec();
            let icac_key_identifier = key_identifier(&public_key);
            let mut cert = MatterCertificate::build(
                serial_bytes(cert_id),
                DistinguishedName::new(vec![DnField::RcacId(root_cert_id)]),
                DistinguishedName::new(vec![DnField::IcacId(cert_id)]),
                not_before,
                not_after,
                public_key,
                Extensions {
                    basic_constraints: Some(BasicConstraints {
                        is_ca: true,
                        path_len: None,
                    }),
                    key_usage: Some(key_usage::KEY_CERT_SIGN | key_usage::CRL_SIGN),
                    extended_key_usage: None,
                    subject_key_identifier: Some(icac_key_identifier),
                    authority_key_identifier: Some(root_key_identifier),
                    future_extensions: Vec::new(),
                },
            );
            cert.sign(&root_key_pair).map_err(Error::from)?;
            let cert_bytes = cert.signed_tlv().map_err(Error::from)?;
            Some(IntermediateCa {
                cert_id,
                key_pair,
                key_identifier: icac_key_identifier,
                cert_bytes,
            })
        } else {
            None
        };

        storage.set_record(KEY_ROOT_CERT_ID, &root_cert_id)?;
        storage.set(KEY_ROOT_KEY_PAIR, &root_key_pair.to_bytes())?;
        storage.set(KEY_ROOT_KEY_IDENTIFIER, &root_key_identifier)?;
        storage.set(KEY_ROOT_CERT_BYTES, &root_cert_bytes)?;
        storage.set_record(KEY_NEXT_CERTIFICATE_ID, &next_certificate_id)?;
        if let Some(icac) = &icac {
            storage.set_record(KEY_ICAC_CERT_ID, &icac.cert_id)?;
            storage.set(KEY_ICAC_KEY_PAIR, &icac.key_pair.to_bytes())?;
            storage.set(KEY_ICAC_KEY_IDENTIFIER, &icac.key_identifier)?;
            storage.set(KEY_ICAC_CERT_BYTES, &icac.cert_bytes)?;
        }

        info!(tier = if with_icac { 3 } else { 2 }, "certificate authority generated");
        Ok(Self {
            storage,
            root_cert_id,
            root_key_pair: Some(root_key_pair),
            root_key_identifier,
            root_cert_bytes,
            next_certificate_id: Mutex::new(next_certificate_id),
            icac,
        })
    }

    pub fn root_cert_id(&self) -> u64 {
        self.root_cert_id
    }

    pub fn root_key_identifier(&self) -> &[u8; KEY_IDENTIFIER_LEN] {
        &self.root_key_identifier
    }

    /// The signed root certificate in Matter TLV form.
    pub fn root_cert_bytes(&self) -> &[u8] {
        &self.root_cert_bytes
    }

    pub fn root_cert(&self) -> Result<MatterCertificate> {
        MatterCertificate::parse_tlv(&self.root_cert_bytes).map_err(Error::from)
    }

    pub fn has_icac(&self) -> bool {
        self.icac.is_some()
    }

    /// The signed intermediate certificate, when running 3-tier.
    pub fn icac_cert_bytes(&self) -> Option<&[u8]> {
        self.icac.as_ref().map(|i| i.cert_bytes.as_slice())
    }

    /// Mint a node operational certificate for a device public key.
    ///
    /// The NOC is signed by the ICAC when present, otherwise by the root.
    pub fn generate_noc(
        &self,
        public_key: &[u8],
        fabric_id: FabricId,
        node_id: NodeId,
        tags: &[CaseAuthenticatedTag],
    ) -> Result<MatterCertificate> {
        if !validate_case_authenticated_tags(tags) {
            return Err(Error::MalformedRequest(
                "invalid CASE authenticated tags".into(),
            ));
        }

        let cert_id = {
            let mut next = self.next_certificate_id.lock();
            let id = *next;
            *next += 1;
            self.storage.set_record(KEY_NEXT_CERTIFICATE_ID, &*next)?;
            id
        };

        let (issuer, signing_key, signer_key_identifier) = match &self.icac {
            Some(icac) => (
                DistinguishedName::new(vec![DnField::IcacId(icac.cert_id)]),
                &icac.key_pair,
                icac.key_identifier,
            ),
            None => (
                DistinguishedName::new(vec![DnField::RcacId(self.root_cert_id)]),
                self.root_key_pair.as_ref().ok_or_else(|| {
                    Error::Implementation("2-tier CA requires the root key pair".into())
                })?,
                self.root_key_identifier,
            ),
        };

        let mut subject = vec![DnField::FabricId(fabric_id.0), DnField::NodeId(node_id.0)];
        for tag in tags {
            subject.push(DnField::CaseAuthenticatedTag(tag.0));
        }

        let (not_before, not_after) = validity_window();
        let mut noc = MatterCertificate::build(
            serial_bytes(cert_id),
            issuer,
            DistinguishedName::new(subject),
            not_before,
            not_after,
            public_key.to_vec(),
            Extensions {
                basic_constraints: Some(BasicConstraints {
                    is_ca: false,
                    path_len: None,
                }),
                key_usage: Some(key_usage::DIGITAL_SIGNATURE),
                extended_key_usage: Some(vec![
                    ExtendedKeyUsage::ServerAuth,
                    ExtendedKeyUsage::ClientAuth,
                ]),
                subject_key_identifier: Some(key_identifier(public_key)),
                authority_key_identifier: Some(signer_key_identifier),
                future_extensions: Vec::new(),
            },
        );
        noc.sign(signing_key).map_err(Error::from)?;
        Ok(noc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::storage::MemoryStorage;

    fn storage() -> StorageContext {
        StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT)
    }

    #[test]
    fn test_two_tier_mint_and_verify() {
        let ca = CertificateAuthority::load_or_create(storage(), Some(false)).unwrap();
        let device = KeyPair::generate();

        let noc = ca
            .generate_noc(
                &device.public_key(),
                FabricId(0x456789ABCDEF1234),
                NodeId(1),
                &[],
            )
            .unwrap();

        assert_eq!(noc.issuer.rcac_id(), Some(ca.root_cert_id()));
        assert_eq!(
            noc.extensions.authority_key_identifier.as_ref().unwrap(),
            ca.root_key_identifier()
        );
        assert_eq!(noc.subject.fabric_id(), Some(0x456789ABCDEF1234));
        assert_eq!(noc.subject.node_id(), Some(1));

        let root = ca.root_cert().unwrap();
        noc.verify_signature(&root.public_key).unwrap();
        // The root is self-signed.
        root.verify_signature(&root.public_key).unwrap();
    }

    #[test]
    fn test_three_tier_mint() {
        let ca = CertificateAuthority::load_or_create(storage(), Some(true)).unwrap();
        let device = KeyPair::generate();

        let noc = ca
            .generate_noc(&device.public_key(), FabricId(0x10), NodeId(2), &[])
            .unwrap();
        let icac = MatterCertificate::parse_tlv(ca.icac_cert_bytes().unwrap()).unwrap();
        let root = ca.root_cert().unwrap();

        assert_eq!(noc.issuer.icac_id(), icac.subject.icac_id());
        assert_eq!(icac.issuer.rcac_id(), Some(ca.root_cert_id()));
        noc.verify_signature(&icac.public_key).unwrap();
        icac.verify_signature(&root.public_key).unwrap();
    }

    #[test]
    fn test_tier_conflict_is_implementation_error() {
        let storage = storage();
        CertificateAuthority::load_or_create(storage.clone(), Some(false)).unwrap();

        let err = CertificateAuthority::load_or_create(storage, Some(true)).unwrap_err();
        assert!(matches!(err, Error::Implementation(_)));
    }

    #[test]
    fn test_reload_preserves_state() {
        let storage = storage();
        let first = CertificateAuthority::load_or_create(storage.clone(), Some(false)).unwrap();
        let device = KeyPair::generate();
        let noc_a = first
            .generate_noc(&device.public_key(), FabricId(1), NodeId(1), &[])
            .unwrap();

        let second = CertificateAuthority::load_or_create(storage, None).unwrap();
        assert_eq!(second.root_cert_id(), first.root_cert_id());
        assert_eq!(second.root_cert_bytes(), first.root_cert_bytes());

        // Certificate ids keep counting monotonically across reloads.
        let noc_b = second
            .generate_noc(&device.public_key(), FabricId(1), NodeId(2), &[])
            .unwrap();
        assert!(noc_b.serial_number > noc_a.serial_number);
    }

    #[test]
    fn test_noc_carries_case_authenticated_tags() {
        let ca = CertificateAuthority::load_or_create(storage(), None).unwrap();
        let device = KeyPair::generate();
        let tags = [
            CaseAuthenticatedTag(0x0001_0001),
            CaseAuthenticatedTag(0x0002_0003),
        ];

        let noc = ca
            .generate_noc(&device.public_key(), FabricId(1), NodeId(1), &tags)
            .unwrap();
        assert_eq!(
            noc.subject.case_authenticated_tags(),
            vec![0x0001_0001, 0x0002_0003]
        );

        // Invalid tag set (zero version) is rejected.
        let err = ca
            .generate_noc(
                &device.public_key(),
                FabricId(1),
                NodeId(1),
                &[CaseAuthenticatedTag(0x0001_0000)],
            )
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
    }
}
