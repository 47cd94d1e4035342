//! Matter TLV face of the certificate record
//!
//! The signed TLV form wraps the TBS fields followed by the raw signature.
//! Re-encoding a parsed certificate reproduces the original bytes, which
//! the commissioning flows rely on when hashing certificate payloads.

use crate::cert::{
    BasicConstraints, DistinguishedName, DnField, ExtendedKeyUsage, Extensions,
    MatterCertificate,
};
use crate::error::CertificateError;
use weft_core::tlv::{Tag, TlvElement, TlvValue};
use weft_core::types::MatterEpochSecs;

// Top-level context tags.
const TAG_SERIAL_NUMBER: u8 = 1;
const TAG_SIGNATURE_ALGORITHM: u8 = 2;
const TAG_ISSUER: u8 = 3;
const TAG_NOT_BEFORE: u8 = 4;
const TAG_NOT_AFTER: u8 = 5;
const TAG_SUBJECT: u8 = 6;
const TAG_PUBLIC_KEY_ALGORITHM: u8 = 7;
const TAG_ELLIPTIC_CURVE_ID: u8 = 8;
const TAG_PUBLIC_KEY: u8 = 9;
const TAG_EXTENSIONS: u8 = 10;
const TAG_SIGNATURE: u8 = 11;

// Distinguished-name context tags.
const DN_COMMON_NAME: u8 = 1;
const DN_NODE_ID: u8 = 17;
const DN_FIRMWARE_SIGNING_ID: u8 = 18;
const DN_ICAC_ID: u8 = 19;
const DN_RCAC_ID: u8 = 20;
const DN_FABRIC_ID: u8 = 21;
const DN_NOC_CAT: u8 = 22;

// Extension context tags.
const EXT_BASIC_CONSTRAINTS: u8 = 1;
const EXT_KEY_USAGE: u8 = 2;
const EXT_EXTENDED_KEY_USAGE: u8 = 3;
const EXT_SUBJECT_KEY_ID: u8 = 4;
const EXT_AUTHORITY_KEY_ID: u8 = 5;
const EXT_FUTURE: u8 = 6;

const SIG_ALGO_ECDSA_SHA256: u64 = 1;
const PUBKEY_ALGO_EC: u64 = 1;
const CURVE_PRIME256V1: u64 = 1;

fn dn_to_tlv(dn: &DistinguishedName, tag: Tag) -> Result<TlvElement, CertificateError> {
    let mut items = Vec::new();
    for field in &dn.fields {
        items.push(match field {
            DnField::CommonName(name) => TlvElement::utf8(Tag::Context(DN_COMMON_NAME), name.clone()),
            DnField::NodeId(v) => TlvElement::unsigned(Tag::Context(DN_NODE_ID), *v),
            DnField::FirmwareSigningId(v) => {
                TlvElement::unsigned(Tag::Context(DN_FIRMWARE_SIGNING_ID), *v)
            }
            DnField::IcacId(v) => TlvElement::unsigned(Tag::Context(DN_ICAC_ID), *v),
            DnField::RcacId(v) => TlvElement::unsigned(Tag::Context(DN_RCAC_ID), *v),
            DnField::FabricId(v) => TlvElement::unsigned(Tag::Context(DN_FABRIC_ID), *v),
            DnField::CaseAuthenticatedTag(v) => {
                TlvElement::unsigned(Tag::Context(DN_NOC_CAT), *v as u64)
            }
            DnField::VendorId(_) | DnField::ProductId(_) => {
                return Err(CertificateError::Malformed(
                    "attestation DN fields have no TLV encoding".into(),
                ))
            }
        });
    }
    Ok(TlvElement::list(tag, items))
}

fn dn_from_tlv(element: &TlvElement) -> Result<DistinguishedName, CertificateError> {
    let mut fields = Vec::new();
    for item in element.as_list()? {
        let tag = match item.tag {
            Tag::Context(n) => n,
            _ => {
                return Err(CertificateError::Malformed(
                    "DN entry without context tag".into(),
                ))
            }
        };
        fields.push(match tag {
            DN_COMMON_NAME => DnField::CommonName(item.as_utf8()?.to_string()),
            DN_NODE_ID => DnField::NodeId(item.as_unsigned()?),
            DN_FIRMWARE_SIGNING_ID => DnField::FirmwareSigningId(item.as_unsigned()?),
            DN_ICAC_ID => DnField::IcacId(item.as_unsigned()?),
            DN_RCAC_ID => DnField::RcacId(item.as_unsigned()?),
            DN_FABRIC_ID => DnField::FabricId(item.as_unsigned()?),
            DN_NOC_CAT => DnField::CaseAuthenticatedTag(item.as_unsigned()? as u32),
            other => {
                return Err(CertificateError::Malformed(format!(
                    "unsupported DN TLV tag {other}"
                )))
            }
        });
    }
    Ok(DistinguishedName { fields })
}

fn extensions_to_tlv(extensions: &Extensions) -> TlvElement {
    let mut items = Vec::new();
    if let Some(bc) = &extensions.basic_constraints {
        let mut fields = vec![TlvElement::boolean(Tag::Context(1), bc.is_ca)];
        if let Some(path_len) = bc.path_len {
            fields.push(TlvElement::unsigned(Tag::Context(2), path_len as u64));
        }
        items.push(TlvElement::structure(
            Tag::Context(EXT_BASIC_CONSTRAINTS),
            fields,
        ));
    }
    if let Some(ku) = extensions.key_usage {
        items.push(TlvElement::unsigned(Tag::Context(EXT_KEY_USAGE), ku as u64));
    }
    if let Some(eku) = &extensions.extended_key_usage {
        items.push(TlvElement::array(
            Tag::Context(EXT_EXTENDED_KEY_USAGE),
            eku.iter()
                .map(|e| TlvElement::unsigned(Tag::Anonymous, e.code() as u64))
                .collect(),
        ));
    }
    if let Some(ski) = &extensions.subject_key_identifier {
        items.push(TlvElement::bytes(Tag::Context(EXT_SUBJECT_KEY_ID), ski.to_vec()));
    }
    if let Some(aki) = &extensions.authority_key_identifier {
        items.push(TlvElement::bytes(
            Tag::Context(EXT_AUTHORITY_KEY_ID),
            aki.to_vec(),
        ));
    }
    for raw in &extensions.future_extensions {
        items.push(TlvElement::bytes(Tag::Context(EXT_FUTURE), raw.clone()));
    }
    TlvElement::list(Tag::Context(TAG_EXTENSIONS), items)
}

fn extensions_from_tlv(element: &TlvElement) -> Result<Extensions, CertificateError> {
    let mut out = Extensions::default();
    for item in element.as_list()? {
        match item.tag {
            Tag::Context(EXT_BASIC_CONSTRAINTS) => {
                let is_ca = item.expect_field(1)?.as_bool()?;
                let path_len = match item.field(2) {
                    Some(f) => Some(f.as_unsigned()? as u8),
                    None => None,
                };
                out.basic_constraints = Some(BasicConstraints { is_ca, path_len });
            }
            Tag::Context(EXT_KEY_USAGE) => out.key_usage = Some(item.as_unsigned()? as u16),
            Tag::Context(EXT_EXTENDED_KEY_USAGE) => {
                let mut purposes = Vec::new();
                for code in item.as_array()? {
                    purposes.push(ExtendedKeyUsage::from_code(code.as_unsigned()? as u8)?);
                }
                out.extended_key_usage = Some(purposes);
            }
            Tag::Context(EXT_SUBJECT_KEY_ID) => {
                out.subject_key_identifier = Some(fixed_id(item.as_bytes()?)?);
            }
            Tag::Context(EXT_AUTHORITY_KEY_ID) => {
                out.authority_key_identifier = Some(fixed_id(item.as_bytes()?)?);
            }
            Tag::Context(EXT_FUTURE) => {
                out.future_extensions.push(item.as_bytes()?.to_vec());
            }
            _ => {
                return Err(CertificateError::Malformed(
                    "unsupported extension TLV tag".into(),
                ))
            }
        }
    }
    Ok(out)
}

fn fixed_id(bytes: &[u8]) -> Result<[u8; 20], CertificateError> {
    if bytes.len() != 20 {
        return Err(CertificateError::Malformed(
            "key identifier must be 20 bytes".into(),
        ));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl MatterCertificate {
    /// The signed Matter TLV form: TBS fields followed by the signature.
    pub fn signed_tlv(&self) -> Result<Vec<u8>, CertificateError> {
        let signature = self.signature.as_ref().ok_or(CertificateError::NotSigned)?;
        let fields = vec![
            TlvElement::bytes(Tag::Context(TAG_SERIAL_NUMBER), self.serial_number.clone()),
            TlvElement::unsigned(Tag::Context(TAG_SIGNATURE_ALGORITHM), SIG_ALGO_ECDSA_SHA256),
            dn_to_tlv(&self.issuer, Tag::Context(TAG_ISSUER))?,
            TlvElement::unsigned(Tag::Context(TAG_NOT_BEFORE), self.not_before.0 as u64),
            TlvElement::unsigned(Tag::Context(TAG_NOT_AFTER), self.not_after.0 as u64),
            dn_to_tlv(&self.subject, Tag::Context(TAG_SUBJECT))?,
            TlvElement::unsigned(Tag::Context(TAG_PUBLIC_KEY_ALGORITHM), PUBKEY_ALGO_EC),
            TlvElement::unsigned(Tag::Context(TAG_ELLIPTIC_CURVE_ID), CURVE_PRIME256V1),
            TlvElement::bytes(Tag::Context(TAG_PUBLIC_KEY), self.public_key.clone()),
            extensions_to_tlv(&self.extensions),
            TlvElement::bytes(Tag::Context(TAG_SIGNATURE), signature.clone()),
        ];
        Ok(TlvElement::structure(Tag::Anonymous, fields).encode())
    }

    /// Parse the signed Matter TLV form.
    pub fn parse_tlv(bytes: &[u8]) -> Result<Self, CertificateError> {
        let root = TlvElement::decode(bytes)?;
        if !matches!(root.value, TlvValue::Struct(_)) {
            return Err(CertificateError::Malformed(
                "certificate TLV is not a struct".into(),
            ));
        }

        if root.expect_field(TAG_SIGNATURE_ALGORITHM)?.as_unsigned()? != SIG_ALGO_ECDSA_SHA256 {
            return Err(CertificateError::UnsupportedAlgorithm);
        }
        if root.expect_field(TAG_PUBLIC_KEY_ALGORITHM)?.as_unsigned()? != PUBKEY_ALGO_EC {
            return Err(CertificateError::UnsupportedAlgorithm);
        }
        if root.expect_field(TAG_ELLIPTIC_CURVE_ID)?.as_unsigned()? != CURVE_PRIME256V1 {
            return Err(CertificateError::UnsupportedAlgorithm);
        }

        let signature = root.expect_field(TAG_SIGNATURE)?.as_bytes()?.to_vec();
        if signature.len() != 64 {
            return Err(CertificateError::Malformed(
                "signature must be 64 bytes".into(),
            ));
        }

        Ok(Self {
            serial_number: root.expect_field(TAG_SERIAL_NUMBER)?.as_bytes()?.to_vec(),
            issuer: dn_from_tlv(root.expect_field(TAG_ISSUER)?)?,
            subject: dn_from_tlv(root.expect_field(TAG_SUBJECT)?)?,
            not_before: MatterEpochSecs(root.expect_field(TAG_NOT_BEFORE)?.as_unsigned()? as u32),
            not_after: MatterEpochSecs(root.expect_field(TAG_NOT_AFTER)?.as_unsigned()? as u32),
            public_key: root.expect_field(TAG_PUBLIC_KEY)?.as_bytes()?.to_vec(),
            extensions: extensions_from_tlv(root.expect_field(TAG_EXTENSIONS)?)?,
            signature: Some(signature),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{key_identifier, key_usage, RequiredExtensions};
    use weft_core::crypto::KeyPair;

    fn signed_sample() -> (MatterCertificate, KeyPair) {
        let key = KeyPair::generate();
        let public_key = key.public_key().to_vec();
        let id = key_identifier(&public_key);
        let mut cert = MatterCertificate::build(
            vec![0x05],
            DistinguishedName::new(vec![DnField::RcacId(0)]),
            DistinguishedName::new(vec![
                DnField::FabricId(0x1234),
                DnField::NodeId(0x55),
                DnField::CaseAuthenticatedTag(0x0001_0001),
            ]),
            MatterEpochSecs(1000),
            MatterEpochSecs(2000),
            public_key,
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
                subject_key_identifier: Some(id),
                authority_key_identifier: Some(id),
                future_extensions: Vec::new(),
            },
        );
        cert.sign(&key).unwrap();
        (cert, key)
    }

    #[test]
    fn test_tlv_roundtrip_is_byte_exact() {
        let (cert, _key) = signed_sample();
        let tlv = cert.signed_tlv().unwrap();
        let parsed = MatterCertificate::parse_tlv(&tlv).unwrap();
        assert_eq!(parsed, cert);
        // Re-encoding the parsed certificate reproduces the bytes.
        assert_eq!(parsed.signed_tlv().unwrap(), tlv);
    }

    #[test]
    fn test_tlv_and_der_faces_agree() {
        let (cert, key) = signed_sample();
        let from_tlv = MatterCertificate::parse_tlv(&cert.signed_tlv().unwrap()).unwrap();
        let from_der = MatterCertificate::parse_der(
            &cert.signed_der().unwrap(),
            RequiredExtensions::standard(),
        )
        .unwrap();
        assert_eq!(from_tlv, from_der);
        from_tlv.verify_signature(&key.public_key()).unwrap();
    }

    #[test]
    fn test_unsigned_certificate_has_no_tlv() {
        let (cert, _key) = signed_sample();
        let mut unsigned = cert.clone();
        unsigned.signature = None;
        assert!(matches!(
            unsigned.signed_tlv(),
            Err(CertificateError::NotSigned)
        ));
    }

    #[test]
    fn test_bad_signature_length_rejected() {
        let (cert, _key) = signed_sample();
        let mut truncated = cert.clone();
        truncated.signature = Some(vec![0; 63]);
        // Encoding itself succeeds; parsing rejects the length.
        let bytes = truncated.signed_tlv().unwrap();
        assert!(MatterCertificate::parse_tlv(&bytes).is_err());
    }
}
