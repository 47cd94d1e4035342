//! PKCS#10 certificate signing requests
//!
//! Commissioning carries the device's operational public key inside a CSR;
//! only the self-signature and the embedded key matter, the subject is a
//! placeholder.

use crate::der::{self, DerReader};
use crate::error::CertificateError;
use crate::oid;
use weft_core::crypto::{self, KeyPair};

/// Build a CSR for the given keypair, self-signed with ECDSA-with-SHA256.
pub fn create_signing_request(keypair: &KeyPair) -> Result<Vec<u8>, CertificateError> {
    let subject = der::sequence(&[der::set(&[der::sequence(&[
        der::oid(oid::COMMON_NAME.as_bytes()),
        der::utf8_string("CSR"),
    ])])]);
    let spki = der::sequence(&[
        der::sequence(&[
            der::oid(oid::EC_PUBLIC_KEY.as_bytes()),
            der::oid(oid::PRIME256V1.as_bytes()),
        ]),
        der::bit_string(&keypair.public_key()),
    ]);
    let info = der::sequence(&[
        der::integer_u64(0),
        subject,
        spki,
        der::context(0, &[]), // no attributes
    ]);
    let signature = keypair.sign(&info);
    Ok(der::sequence(&[
        info,
        der::sequence(&[der::oid(oid::ECDSA_WITH_SHA256.as_bytes())]),
        der::bit_string(&der::ecdsa_signature(&signature)?),
    ]))
}

/// Extract and verify the public key from a CSR.
///
/// Requires version 0, ECDSA-with-SHA256, an EC P-256 key and a non-empty
/// subject; the self-signature is verified against the contained key.
pub fn public_key_from_csr(bytes: &[u8]) -> Result<[u8; 65], CertificateError> {
    let mut outer = DerReader::new(bytes);
    let mut csr = outer.expect_sequence()?;

    let (info_tag, info_content) = csr.read_any()?;
    if info_tag != der::TAG_SEQUENCE {
        return Err(CertificateError::MalformedDer(
            "request info is not a sequence".into(),
        ));
    }
    // The signature covers the exact info bytes, tag and length included.
    let info_der = der::tlv(der::TAG_SEQUENCE, info_content);

    let mut algorithm = csr.expect_sequence()?;
    if algorithm.expect_oid()? != oid::ECDSA_WITH_SHA256.as_bytes() {
        return Err(CertificateError::UnsupportedAlgorithm);
    }
    let signature = csr.expect_bit_string()?;

    let mut info = DerReader::new(info_content);
    let version = info.expect_integer_u64()?;
    if version != 0 {
        return Err(CertificateError::WrongCsrVersion(version));
    }
    let subject = info.expect(der::TAG_SEQUENCE)?;
    if subject.is_empty() {
        return Err(CertificateError::Malformed("empty CSR subject".into()));
    }
    let mut spki = info.expect_sequence()?;
    let mut spki_algorithm = spki.expect_sequence()?;
    if spki_algorithm.expect_oid()? != oid::EC_PUBLIC_KEY.as_bytes() {
        return Err(CertificateError::UnsupportedAlgorithm);
    }
    if spki_algorithm.expect_oid()? != oid::PRIME256V1.as_bytes() {
        return Err(CertificateError::UnsupportedAlgorithm);
    }
    let public_key = spki.expect_bit_string()?;
    if public_key.len() != crypto::PUBLIC_KEY_LEN || public_key[0] != 0x04 {
        return Err(CertificateError::Malformed(
            "CSR key is not an uncompressed P-256 point".into(),
        ));
    }

    // Verify the self-signature.
    let mut sig_reader = DerReader::new(signature);
    let mut sig_seq = sig_reader.expect_sequence()?;
    let r = sig_seq.expect_integer()?;
    let s = sig_seq.expect_integer()?;
    if r.len() > 32 || s.len() > 32 {
        return Err(CertificateError::MalformedDer(
            "signature component exceeds 32 bytes".into(),
        ));
    }
    let mut raw = [0u8; 64];
    raw[32 - r.len()..32].copy_from_slice(r);
    raw[64 - s.len()..].copy_from_slice(s);
    KeyPair::verify(public_key, &info_der, &raw)
        .map_err(|_| CertificateError::SignatureVerification)?;

    let mut out = [0u8; 65];
    out.copy_from_slice(public_key);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_roundtrip() {
        let keypair = KeyPair::generate();
        let csr = create_signing_request(&keypair).unwrap();
        let public_key = public_key_from_csr(&csr).unwrap();
        assert_eq!(public_key, keypair.public_key());
    }

    #[test]
    fn test_tampered_csr_fails_verification() {
        let keypair = KeyPair::generate();
        let mut csr = create_signing_request(&keypair).unwrap();
        // Flip a bit inside the embedded public key.
        let len = csr.len();
        csr[len / 2] ^= 0x01;
        assert!(public_key_from_csr(&csr).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let keypair = KeyPair::generate();
        let subject = der::sequence(&[der::set(&[der::sequence(&[
            der::oid(oid::COMMON_NAME.as_bytes()),
            der::utf8_string("CSR"),
        ])])]);
        let spki = der::sequence(&[
            der::sequence(&[
                der::oid(oid::EC_PUBLIC_KEY.as_bytes()),
                der::oid(oid::PRIME256V1.as_bytes()),
            ]),
            der::bit_string(&keypair.public_key()),
        ]);
        let info = der::sequence(&[der::integer_u64(1), subject, spki, der::context(0, &[])]);
        let signature = keypair.sign(&info);
        let csr = der::sequence(&[
            info,
            der::sequence(&[der::oid(oid::ECDSA_WITH_SHA256.as_bytes())]),
            der::bit_string(&der::ecdsa_signature(&signature).unwrap()),
        ]);
        assert!(matches!(
            public_key_from_csr(&csr),
            Err(CertificateError::WrongCsrVersion(1))
        ));
    }
}
