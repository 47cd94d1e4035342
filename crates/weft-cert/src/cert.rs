//! Matter certificate record and its ASN.1 DER face
//!
//! One in-memory record with two wire encodings; the TLV face lives in
//! [`crate::tlv_cert`]. Signing always happens over the unsigned DER form,
//! whichever encoding later carries the certificate.

use crate::datetime::{decode_time, encode_time};
use crate::der::{self, DerReader};
use crate::error::CertificateError;
use crate::oid;
use const_oid::ObjectIdentifier;
use weft_core::crypto::{self, KeyPair};
use weft_core::types::MatterEpochSecs;

/// Matter caps the DER encoding of an operational certificate.
pub const MAX_SIGNED_DER_LEN: usize = 600;

/// Length of a subject/authority key identifier.
pub const KEY_IDENTIFIER_LEN: usize = 20;

/// Key usage named bits (bit n of the value = named bit n).
pub mod key_usage {
    pub const DIGITAL_SIGNATURE: u16 = 1 << 0;
    pub const NON_REPUDIATION: u16 = 1 << 1;
    pub const KEY_ENCIPHERMENT: u16 = 1 << 2;
    pub const DATA_ENCIPHERMENT: u16 = 1 << 3;
    pub const KEY_AGREEMENT: u16 = 1 << 4;
    pub const KEY_CERT_SIGN: u16 = 1 << 5;
    pub const CRL_SIGN: u16 = 1 << 6;
    pub const ENCIPHER_ONLY: u16 = 1 << 7;
    pub const DECIPHER_ONLY: u16 = 1 << 8;
}

/// First 20 bytes of SHA-256 over the raw EC public key.
pub fn key_identifier(public_key: &[u8]) -> [u8; KEY_IDENTIFIER_LEN] {
    let digest = crypto::sha256(public_key);
    let mut out = [0u8; KEY_IDENTIFIER_LEN];
    out.copy_from_slice(&digest[..KEY_IDENTIFIER_LEN]);
    out
}

// =============================================================================
// DISTINGUISHED NAMES
// =============================================================================

/// One distinguished-name attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DnField {
    CommonName(String),
    NodeId(u64),
    FabricId(u64),
    IcacId(u64),
    RcacId(u64),
    FirmwareSigningId(u64),
    VendorId(u16),
    ProductId(u16),
    CaseAuthenticatedTag(u32),
}

impl DnField {
    fn oid(&self) -> ObjectIdentifier {
        match self {
            DnField::CommonName(_) => oid::COMMON_NAME,
            DnField::NodeId(_) => oid::MATTER_NODE_ID,
            DnField::FabricId(_) => oid::MATTER_FABRIC_ID,
            DnField::IcacId(_) => oid::MATTER_ICAC_ID,
            DnField::RcacId(_) => oid::MATTER_RCAC_ID,
            DnField::FirmwareSigningId(_) => oid::MATTER_FIRMWARE_SIGNING_ID,
            DnField::VendorId(_) => oid::MATTER_VENDOR_ID,
            DnField::ProductId(_) => oid::MATTER_PRODUCT_ID,
            DnField::CaseAuthenticatedTag(_) => oid::MATTER_CASE_AUTHENTICATED_TAG,
        }
    }

    /// DN value as the fixed-width uppercase hex string DER carries.
    fn der_value(&self) -> String {
        match self {
            DnField::CommonName(name) => name.clone(),
            DnField::NodeId(v) | DnField::FabricId(v) | DnField::FirmwareSigningId(v) => {
                format!("{v:016X}")
            }
            DnField::IcacId(v) | DnField::RcacId(v) => format!("{v:08X}"),
            DnField::CaseAuthenticatedTag(v) => format!("{v:08X}"),
            DnField::VendorId(v) | DnField::ProductId(v) => format!("{v:04X}"),
        }
    }
}

/// Ordered distinguished name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub fields: Vec<DnField>,
}

impl DistinguishedName {
    pub fn new(fields: Vec<DnField>) -> Self {
        Self { fields }
    }

    pub fn node_id(&self) -> Option<u64> {
        self.fields.iter().find_map(|f| match f {
            DnField::NodeId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn fabric_id(&self) -> Option<u64> {
        self.fields.iter().find_map(|f| match f {
            DnField::FabricId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn rcac_id(&self) -> Option<u64> {
        self.fields.iter().find_map(|f| match f {
            DnField::RcacId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn icac_id(&self) -> Option<u64> {
        self.fields.iter().find_map(|f| match f {
            DnField::IcacId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn case_authenticated_tags(&self) -> Vec<u32> {
        self.fields
            .iter()
            .filter_map(|f| match f {
                DnField::CaseAuthenticatedTag(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn to_der(&self) -> Vec<u8> {
        let rdns: Vec<Vec<u8>> = self
            .fields
            .iter()
            .map(|field| {
                der::set(&[der::sequence(&[
                    der::oid(field.oid().as_bytes()),
                    der::utf8_string(&field.der_value()),
                ])])
            })
            .collect();
        der::sequence(&rdns)
    }

    fn from_der(content: &[u8]) -> Result<Self, CertificateError> {
        let mut fields = Vec::new();
        let mut rdns = DerReader::new(content);
        while !rdns.is_empty() {
            let set_content = rdns.expect(der::TAG_SET)?;
            let mut set_reader = DerReader::new(set_content);
            let mut attr = set_reader.expect_sequence()?;
            let attr_oid = attr.expect_oid()?;
            let (value_tag, value_bytes) = attr.read_any()?;
            if value_tag != der::TAG_UTF8_STRING
                && value_tag != der::TAG_PRINTABLE_STRING
                && value_tag != der::TAG_IA5_STRING
            {
                return Err(CertificateError::Malformed(
                    "unsupported DN value encoding".into(),
                ));
            }
            let value = std::str::from_utf8(value_bytes)
                .map_err(|_| CertificateError::Malformed("DN value is not utf-8".into()))?;
            fields.push(decode_dn_field(attr_oid, value)?);
        }
        Ok(Self { fields })
    }
}

fn parse_hex_u64(value: &str, width: usize) -> Result<u64, CertificateError> {
    if value.len() != width {
        return Err(CertificateError::Malformed(format!(
            "DN value {value:?} is not {width} hex chars"
        )));
    }
    u64::from_str_radix(value, 16)
        .map_err(|_| CertificateError::Malformed(format!("DN value {value:?} is not hex")))
}

fn decode_dn_field(attr_oid: &[u8], value: &str) -> Result<DnField, CertificateError> {
    Ok(if attr_oid == oid::COMMON_NAME.as_bytes() {
        DnField::CommonName(value.to_string())
    } else if attr_oid == oid::MATTER_NODE_ID.as_bytes() {
        DnField::NodeId(parse_hex_u64(value, 16)?)
    } else if attr_oid == oid::MATTER_FABRIC_ID.as_bytes() {
        DnField::FabricId(parse_hex_u64(value, 16)?)
    } else if attr_oid == oid::MATTER_FIRMWARE_SIGNING_ID.as_bytes() {
        DnField::FirmwareSigningId(parse_hex_u64(value, 16)?)
    } else if attr_oid == oid::MATTER_ICAC_ID.as_bytes() {
        DnField::IcacId(parse_hex_u64(value, 8)?)
    } else if attr_oid == oid::MATTER_RCAC_ID.as_bytes() {
        DnField::RcacId(parse_hex_u64(value, 8)?)
    } else if attr_oid == oid::MATTER_CASE_AUTHENTICATED_TAG.as_bytes() {
        DnField::CaseAuthenticatedTag(parse_hex_u64(value, 8)? as u32)
    } else if attr_oid == oid::MATTER_VENDOR_ID.as_bytes() {
        DnField::VendorId(parse_hex_u64(value, 4)? as u16)
    } else if attr_oid == oid::MATTER_PRODUCT_ID.as_bytes() {
        DnField::ProductId(parse_hex_u64(value, 4)? as u16)
    } else {
        return Err(CertificateError::Malformed(format!(
            "unsupported DN attribute oid {}",
            hex::encode(attr_oid)
        )));
    })
}

// =============================================================================
// EXTENSIONS
// =============================================================================

/// basicConstraints extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BasicConstraints {
    pub is_ca: bool,
    pub path_len: Option<u8>,
}

/// Extended key usage purposes with their Matter TLV codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtendedKeyUsage {
    ServerAuth = 1,
    ClientAuth = 2,
    CodeSigning = 3,
    EmailProtection = 4,
    TimeStamping = 5,
    OcspSigning = 6,
}

impl ExtendedKeyUsage {
    fn oid(&self) -> ObjectIdentifier {
        match self {
            ExtendedKeyUsage::ServerAuth => oid::EKU_SERVER_AUTH,
            ExtendedKeyUsage::ClientAuth => oid::EKU_CLIENT_AUTH,
            ExtendedKeyUsage::CodeSigning => oid::EKU_CODE_SIGNING,
            ExtendedKeyUsage::EmailProtection => oid::EKU_EMAIL_PROTECTION,
            ExtendedKeyUsage::TimeStamping => oid::EKU_TIME_STAMPING,
            ExtendedKeyUsage::OcspSigning => oid::EKU_OCSP_SIGNING,
        }
    }

    fn from_oid(value: &[u8]) -> Result<Self, CertificateError> {
        Ok(if value == oid::EKU_SERVER_AUTH.as_bytes() {
            ExtendedKeyUsage::ServerAuth
        } else if value == oid::EKU_CLIENT_AUTH.as_bytes() {
            ExtendedKeyUsage::ClientAuth
        } else if value == oid::EKU_CODE_SIGNING.as_bytes() {
            ExtendedKeyUsage::CodeSigning
        } else if value == oid::EKU_EMAIL_PROTECTION.as_bytes() {
            ExtendedKeyUsage::EmailProtection
        } else if value == oid::EKU_TIME_STAMPING.as_bytes() {
            ExtendedKeyUsage::TimeStamping
        } else if value == oid::EKU_OCSP_SIGNING.as_bytes() {
            ExtendedKeyUsage::OcspSigning
        } else {
            return Err(CertificateError::Malformed(
                "unsupported extended key usage".into(),
            ));
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, CertificateError> {
        Ok(match code {
            1 => ExtendedKeyUsage::ServerAuth,
            2 => ExtendedKeyUsage::ClientAuth,
            3 => ExtendedKeyUsage::CodeSigning,
            4 => ExtendedKeyUsage::EmailProtection,
            5 => ExtendedKeyUsage::TimeStamping,
            6 => ExtendedKeyUsage::OcspSigning,
            _ => {
                return Err(CertificateError::Malformed(format!(
                    "unknown extended key usage code {code}"
                )))
            }
        })
    }
}

/// Certificate extensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extensions {
    pub basic_constraints: Option<BasicConstraints>,
    pub key_usage: Option<u16>,
    pub extended_key_usage: Option<Vec<ExtendedKeyUsage>>,
    pub subject_key_identifier: Option<[u8; KEY_IDENTIFIER_LEN]>,
    pub authority_key_identifier: Option<[u8; KEY_IDENTIFIER_LEN]>,
    /// Unrecognized extensions, kept as their raw DER `Extension` element.
    pub future_extensions: Vec<Vec<u8>>,
}

fn encode_extension(ext_oid: ObjectIdentifier, critical: bool, content: Vec<u8>) -> Vec<u8> {
    let mut children = vec![der::oid(ext_oid.as_bytes())];
    if critical {
        children.push(der::boolean(true));
    }
    children.push(der::octet_string(&content));
    der::sequence(&children)
}

impl Extensions {
    fn to_der(&self) -> Vec<u8> {
        let mut entries = Vec::new();
        if let Some(bc) = &self.basic_constraints {
            let mut children = Vec::new();
            if bc.is_ca {
                children.push(der::boolean(true));
            }
            if let Some(path_len) = bc.path_len {
                children.push(der::integer_u64(path_len as u64));
            }
            entries.push(encode_extension(
                oid::BASIC_CONSTRAINTS,
                true,
                der::sequence(&children),
            ));
        }
        if let Some(ku) = self.key_usage {
            entries.push(encode_extension(
                oid::KEY_USAGE,
                true,
                der::encode_named_bits(ku),
            ));
        }
        if let Some(eku) = &self.extended_key_usage {
            let oids: Vec<Vec<u8>> = eku.iter().map(|e| der::oid(e.oid().as_bytes())).collect();
            entries.push(encode_extension(
                oid::EXTENDED_KEY_USAGE,
                true,
                der::sequence(&oids),
            ));
        }
        if let Some(ski) = &self.subject_key_identifier {
            entries.push(encode_extension(
                oid::SUBJECT_KEY_IDENTIFIER,
                false,
                der::octet_string(ski),
            ));
        }
        if let Some(aki) = &self.authority_key_identifier {
            let inner = der::tlv(der::tag_context_primitive(0), aki);
            entries.push(encode_extension(
                oid::AUTHORITY_KEY_IDENTIFIER,
                false,
                der::sequence(&[inner]),
            ));
        }
        for raw in &self.future_extensions {
            entries.push(raw.clone());
        }
        der::context(3, &der::sequence(&entries))
    }

    fn from_der(content: &[u8]) -> Result<Self, CertificateError> {
        let mut out = Extensions::default();
        let mut outer = DerReader::new(content);
        let mut list = outer.expect_sequence()?;
        while !list.is_empty() {
            // Remember the raw element so unknown extensions survive.
            let (tag, ext_content) = list.read_any()?;
            if tag != der::TAG_SEQUENCE {
                return Err(CertificateError::MalformedDer(
                    "extension is not a sequence".into(),
                ));
            }
            let mut ext = DerReader::new(ext_content);
            let ext_oid = ext.expect_oid()?.to_vec();
            let _critical = ext.read_optional(der::TAG_BOOLEAN)?;
            let value = ext.expect(der::TAG_OCTET_STRING)?;

            if ext_oid == oid::BASIC_CONSTRAINTS.as_bytes() {
                let mut bc_outer = DerReader::new(value);
                let mut bc = bc_outer.expect_sequence()?;
                let is_ca = match bc.read_optional(der::TAG_BOOLEAN)? {
                    Some(content) => content == [0xFF],
                    None => false,
                };
                let path_len = if bc.peek_tag() == Some(der::TAG_INTEGER) {
                    Some(bc.expect_integer_u64()? as u8)
                } else {
                    None
                };
                out.basic_constraints = Some(BasicConstraints { is_ca, path_len });
            } else if ext_oid == oid::KEY_USAGE.as_bytes() {
                let mut ku = DerReader::new(value);
                let bits = ku.expect(der::TAG_BIT_STRING)?;
                out.key_usage = Some(der::decode_named_bits(bits)?);
            } else if ext_oid == oid::EXTENDED_KEY_USAGE.as_bytes() {
                let mut eku_outer = DerReader::new(value);
                let mut eku = eku_outer.expect_sequence()?;
                let mut purposes = Vec::new();
                while !eku.is_empty() {
                    purposes.push(ExtendedKeyUsage::from_oid(eku.expect_oid()?)?);
                }
                out.extended_key_usage = Some(purposes);
            } else if ext_oid == oid::SUBJECT_KEY_IDENTIFIER.as_bytes() {
                let mut ski = DerReader::new(value);
                let id = ski.expect(der::TAG_OCTET_STRING)?;
                out.subject_key_identifier = Some(fixed_key_id(id)?);
            } else if ext_oid == oid::AUTHORITY_KEY_IDENTIFIER.as_bytes() {
                let mut aki_outer = DerReader::new(value);
                let mut aki = aki_outer.expect_sequence()?;
                let id = aki.expect(der::tag_context_primitive(0))?;
                out.authority_key_identifier = Some(fixed_key_id(id)?);
            } else {
                out.future_extensions
                    .push(der::tlv(der::TAG_SEQUENCE, ext_content));
            }
        }
        Ok(out)
    }
}

fn fixed_key_id(id: &[u8]) -> Result<[u8; KEY_IDENTIFIER_LEN], CertificateError> {
    if id.len() != KEY_IDENTIFIER_LEN {
        return Err(CertificateError::Malformed(format!(
            "key identifier must be {KEY_IDENTIFIER_LEN} bytes, got {}",
            id.len()
        )));
    }
    let mut out = [0u8; KEY_IDENTIFIER_LEN];
    out.copy_from_slice(id);
    Ok(out)
}

/// Which extensions a parse must find.
#[derive(Clone, Copy, Debug)]
pub struct RequiredExtensions {
    pub basic_constraints: bool,
    pub key_usage: bool,
    pub subject_key_identifier: bool,
    pub authority_key_identifier: bool,
}

impl RequiredExtensions {
    /// The standard set for everything below a PAA.
    pub fn standard() -> Self {
        Self {
            basic_constraints: true,
            key_usage: true,
            subject_key_identifier: true,
            authority_key_identifier: true,
        }
    }

    /// PAA certificates are self-signed and need no AKI.
    pub fn paa() -> Self {
        Self {
            authority_key_identifier: false,
            ..Self::standard()
        }
    }

    /// No requirements at all (parse-only use).
    pub fn none() -> Self {
        Self {
            basic_constraints: false,
            key_usage: false,
            subject_key_identifier: false,
            authority_key_identifier: false,
        }
    }
}

// =============================================================================
// CERTIFICATE
// =============================================================================

/// The canonical in-memory Matter certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatterCertificate {
    pub serial_number: Vec<u8>,
    pub issuer: DistinguishedName,
    pub subject: DistinguishedName,
    pub not_before: MatterEpochSecs,
    pub not_after: MatterEpochSecs,
    /// Uncompressed SEC1 P-256 public key (0x04 || X || Y).
    pub public_key: Vec<u8>,
    pub extensions: Extensions,
    /// Raw r||s ECDSA signature; present once signed.
    pub signature: Option<Vec<u8>>,
}

impl MatterCertificate {
    /// Build an unsigned certificate.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        serial_number: Vec<u8>,
        issuer: DistinguishedName,
        subject: DistinguishedName,
        not_before: MatterEpochSecs,
        not_after: MatterEpochSecs,
        public_key: Vec<u8>,
        extensions: Extensions,
    ) -> Self {
        Self {
            serial_number,
            issuer,
            subject,
            not_before,
            not_after,
            public_key,
            extensions,
            signature: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Sign over the unsigned DER form. A signed certificate is immutable;
    /// signing twice is an error.
    pub fn sign(&mut self, issuer_key: &KeyPair) -> Result<(), CertificateError> {
        if self.signature.is_some() {
            return Err(CertificateError::AlreadySigned);
        }
        let tbs = self.unsigned_der()?;
        self.signature = Some(issuer_key.sign(&tbs).to_vec());
        Ok(())
    }

    /// Verify the signature under the issuer's public key.
    pub fn verify_signature(&self, issuer_public_key: &[u8]) -> Result<(), CertificateError> {
        let signature = self.signature.as_ref().ok_or(CertificateError::NotSigned)?;
        let tbs = self.unsigned_der()?;
        KeyPair::verify(issuer_public_key, &tbs, signature)
            .map_err(|_| CertificateError::SignatureVerification)
    }

    /// The to-be-signed DER (X.509 TBSCertificate).
    pub fn unsigned_der(&self) -> Result<Vec<u8>, CertificateError> {
        let algorithm = der::sequence(&[der::oid(oid::ECDSA_WITH_SHA256.as_bytes())]);
        let spki = der::sequence(&[
            der::sequence(&[
                der::oid(oid::EC_PUBLIC_KEY.as_bytes()),
                der::oid(oid::PRIME256V1.as_bytes()),
            ]),
            der::bit_string(&self.public_key),
        ]);
        let validity = der::sequence(&[
            encode_time(self.not_before.to_unix()),
            encode_time(self.not_after.to_unix()),
        ]);
        Ok(der::sequence(&[
            der::context(0, &der::integer_u64(2)), // v3
            der::integer(&self.serial_number),
            algorithm,
            self.issuer.to_der(),
            validity,
            self.subject.to_der(),
            spki,
            self.extensions.to_der(),
        ]))
    }

    /// The full signed DER certificate. Fails when unsigned or when the
    /// encoding exceeds the Matter budget.
    pub fn signed_der(&self) -> Result<Vec<u8>, CertificateError> {
        let signature = self.signature.as_ref().ok_or(CertificateError::NotSigned)?;
        let encoded = der::sequence(&[
            self.unsigned_der()?,
            der::sequence(&[der::oid(oid::ECDSA_WITH_SHA256.as_bytes())]),
            der::bit_string(&der::ecdsa_signature(signature)?),
        ]);
        if encoded.len() > MAX_SIGNED_DER_LEN {
            return Err(CertificateError::Oversize {
                limit: MAX_SIGNED_DER_LEN,
                actual: encoded.len(),
            });
        }
        Ok(encoded)
    }

    /// Parse a DER certificate, checking the required extensions are
    /// present, the algorithm is ECDSA-with-SHA256 and the key is P-256.
    pub fn parse_der(
        bytes: &[u8],
        required: RequiredExtensions,
    ) -> Result<Self, CertificateError> {
        let mut outer = DerReader::new(bytes);
        let mut cert = outer.expect_sequence()?;
        if !outer.is_empty() {
            return Err(CertificateError::MalformedDer(
                "trailing bytes after certificate".into(),
            ));
        }

        let mut tbs = cert.expect_sequence()?;

        // signatureAlgorithm
        let mut algorithm = cert.expect_sequence()?;
        if algorithm.expect_oid()? != oid::ECDSA_WITH_SHA256.as_bytes() {
            return Err(CertificateError::UnsupportedAlgorithm);
        }

        // signatureValue
        let sig_der = cert.expect_bit_string()?;
        let signature = decode_ecdsa_signature(sig_der)?;

        // --- TBSCertificate ---
        let version = tbs.expect(der::tag_context(0))?;
        let mut version_reader = DerReader::new(version);
        if version_reader.expect_integer_u64()? != 2 {
            return Err(CertificateError::Malformed(
                "only X.509 v3 is supported".into(),
            ));
        }
        let serial_number = tbs.expect_integer()?.to_vec();

        let mut tbs_algorithm = tbs.expect_sequence()?;
        if tbs_algorithm.expect_oid()? != oid::ECDSA_WITH_SHA256.as_bytes() {
            return Err(CertificateError::UnsupportedAlgorithm);
        }

        let issuer = DistinguishedName::from_der(tbs.expect(der::TAG_SEQUENCE)?)?;

        let mut validity = tbs.expect_sequence()?;
        let (nb_tag, nb_content) = validity.read_any()?;
        let not_before = MatterEpochSecs::from_unix(decode_time(nb_tag, nb_content)?);
        let (na_tag, na_content) = validity.read_any()?;
        let not_after = MatterEpochSecs::from_unix(decode_time(na_tag, na_content)?);

        let subject = DistinguishedName::from_der(tbs.expect(der::TAG_SEQUENCE)?)?;

        let mut spki = tbs.expect_sequence()?;
        let mut spki_algorithm = spki.expect_sequence()?;
        if spki_algorithm.expect_oid()? != oid::EC_PUBLIC_KEY.as_bytes() {
            return Err(CertificateError::UnsupportedAlgorithm);
        }
        if spki_algorithm.expect_oid()? != oid::PRIME256V1.as_bytes() {
            return Err(CertificateError::UnsupportedAlgorithm);
        }
        let public_key = spki.expect_bit_string()?.to_vec();
        if public_key.len() != crypto::PUBLIC_KEY_LEN || public_key[0] != 0x04 {
            return Err(CertificateError::Malformed(
                "public key is not an uncompressed P-256 point".into(),
            ));
        }

        let extensions = match tbs.read_optional(der::tag_context(3))? {
            Some(content) => Extensions::from_der(content)?,
            None => Extensions::default(),
        };

        if required.basic_constraints && extensions.basic_constraints.is_none() {
            return Err(CertificateError::MissingExtension("basicConstraints"));
        }
        if required.key_usage && extensions.key_usage.is_none() {
            return Err(CertificateError::MissingExtension("keyUsage"));
        }
        if required.subject_key_identifier && extensions.subject_key_identifier.is_none() {
            return Err(CertificateError::MissingExtension("subjectKeyIdentifier"));
        }
        if required.authority_key_identifier && extensions.authority_key_identifier.is_none() {
            return Err(CertificateError::MissingExtension("authorityKeyIdentifier"));
        }

        Ok(Self {
            serial_number,
            issuer,
            subject,
            not_before,
            not_after,
            public_key,
            extensions,
            signature: Some(signature),
        })
    }
}

/// DER SEQUENCE { r, s } to raw r||s.
fn decode_ecdsa_signature(bytes: &[u8]) -> Result<Vec<u8>, CertificateError> {
    let mut outer = DerReader::new(bytes);
    let mut seq = outer.expect_sequence()?;
    let r = seq.expect_integer()?;
    let s = seq.expect_integer()?;
    if r.len() > 32 || s.len() > 32 {
        return Err(CertificateError::MalformedDer(
            "signature component exceeds 32 bytes".into(),
        ));
    }
    let mut out = vec![0u8; 64];
    out[32 - r.len()..32].copy_from_slice(r);
    out[64 - s.len()..].copy_from_slice(s);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_extensions(is_ca: bool, signer_id: [u8; 20]) -> Extensions {
        Extensions {
            basic_constraints: Some(BasicConstraints {
                is_ca,
                path_len: None,
            }),
            key_usage: Some(if is_ca {
                key_usage::KEY_CERT_SIGN | key_usage::CRL_SIGN
            } else {
                key_usage::DIGITAL_SIGNATURE
            }),
            extended_key_usage: if is_ca {
                None
            } else {
                Some(vec![
                    ExtendedKeyUsage::ServerAuth,
                    ExtendedKeyUsage::ClientAuth,
                ])
            },
            subject_key_identifier: Some(signer_id),
            authority_key_identifier: Some(signer_id),
            future_extensions: Vec::new(),
        }
    }

    fn sample_certificate(key: &KeyPair) -> MatterCertificate {
        let public_key = key.public_key().to_vec();
        let id = key_identifier(&public_key);
        MatterCertificate::build(
            vec![0x01, 0x23],
            DistinguishedName::new(vec![DnField::RcacId(0)]),
            DistinguishedName::new(vec![
                DnField::FabricId(0x456789ABCDEF1234),
                DnField::NodeId(1),
            ]),
            MatterEpochSecs::from_unix(1_700_000_000),
            MatterEpochSecs::from_unix(1_700_000_000 + 10 * 365 * 86_400),
            public_key,
            sample_extensions(false, id),
        )
    }

    #[test]
    fn test_sign_then_sign_again_fails() {
        let key = KeyPair::generate();
        let mut cert = sample_certificate(&key);
        assert!(!cert.is_signed());
        cert.sign(&key).unwrap();
        assert!(cert.is_signed());
        assert!(matches!(
            cert.sign(&key),
            Err(CertificateError::AlreadySigned)
        ));
    }

    #[test]
    fn test_der_roundtrip_preserves_fields() {
        let key = KeyPair::generate();
        let mut cert = sample_certificate(&key);
        cert.sign(&key).unwrap();

        let der = cert.signed_der().unwrap();
        assert!(der.len() <= MAX_SIGNED_DER_LEN);

        let parsed =
            MatterCertificate::parse_der(&der, RequiredExtensions::standard()).unwrap();
        assert_eq!(parsed, cert);
        parsed.verify_signature(&key.public_key()).unwrap();
    }

    #[test]
    fn test_signature_verifies_only_under_issuer() {
        let issuer = KeyPair::generate();
        let other = KeyPair::generate();
        let mut cert = sample_certificate(&issuer);
        cert.sign(&issuer).unwrap();

        cert.verify_signature(&issuer.public_key()).unwrap();
        assert!(matches!(
            cert.verify_signature(&other.public_key()),
            Err(CertificateError::SignatureVerification)
        ));
    }

    #[test]
    fn test_missing_required_extension() {
        let key = KeyPair::generate();
        let mut cert = sample_certificate(&key);
        cert.extensions.authority_key_identifier = None;
        cert.sign(&key).unwrap();

        let der = cert.signed_der().unwrap();
        assert!(matches!(
            MatterCertificate::parse_der(&der, RequiredExtensions::standard()),
            Err(CertificateError::MissingExtension("authorityKeyIdentifier"))
        ));
        // The PAA profile does not require an AKI.
        MatterCertificate::parse_der(&der, RequiredExtensions::paa()).unwrap();
    }

    #[test]
    fn test_dn_helpers() {
        let dn = DistinguishedName::new(vec![
            DnField::FabricId(0x1122),
            DnField::NodeId(7),
            DnField::CaseAuthenticatedTag(0x0001_0001),
            DnField::CaseAuthenticatedTag(0x0002_0001),
        ]);
        assert_eq!(dn.fabric_id(), Some(0x1122));
        assert_eq!(dn.node_id(), Some(7));
        assert_eq!(dn.rcac_id(), None);
        assert_eq!(
            dn.case_authenticated_tags(),
            vec![0x0001_0001, 0x0002_0001]
        );
    }

    #[test]
    fn test_unknown_extension_survives_roundtrip() {
        let key = KeyPair::generate();
        let mut cert = sample_certificate(&key);
        // A fabricated vendor extension: oid 1.3.6.1.4.1.37244.999 content.
        let raw = der::sequence(&[
            der::oid(&[0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0xA2, 0x7C, 0x87, 0x67]),
            der::octet_string(&[1, 2, 3]),
        ]);
        cert.extensions.future_extensions.push(raw.clone());
        cert.sign(&key).unwrap();

        let parsed = MatterCertificate::parse_der(
            &cert.signed_der().unwrap(),
            RequiredExtensions::standard(),
        )
        .unwrap();
        assert_eq!(parsed.extensions.future_extensions, vec![raw]);
    }

    #[test]
    fn test_key_identifier_is_sha256_prefix() {
        let key = KeyPair::generate();
        let public_key = key.public_key();
        let id = key_identifier(&public_key);
        assert_eq!(id, crypto::sha256(&public_key)[..20]);
    }
}
