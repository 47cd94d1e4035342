//! Matter operational PKI.
//!
//! A Matter certificate is one record with two wire faces: X.509 ASN.1 DER
//! and Matter TLV. This crate carries the record model, both codecs, the
//! PKCS#10 signing-request handling used during commissioning, and the
//! certificate authority that owns fabric root material and mints node
//! operational certificates.

pub mod ca;
pub mod cert;
pub mod csr;
pub mod datetime;
pub mod der;
pub mod oid;
pub mod tlv_cert;

mod error;

pub use ca::CertificateAuthority;
pub use cert::{
    BasicConstraints, DistinguishedName, DnField, ExtendedKeyUsage, Extensions,
    MatterCertificate, RequiredExtensions,
};
pub use error::CertificateError;
