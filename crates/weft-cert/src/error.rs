//! Certificate error type

use thiserror::Error;
use weft_core::crypto::CryptoError;
use weft_core::tlv::TlvError;

/// Certificate parse, build, and verification failures.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("malformed DER: {0}")]
    MalformedDer(String),
    #[error("malformed certificate: {0}")]
    Malformed(String),
    #[error("unsupported algorithm or curve")]
    UnsupportedAlgorithm,
    #[error("missing required extension: {0}")]
    MissingExtension(&'static str),
    #[error("certificate is already signed")]
    AlreadySigned,
    #[error("certificate is not signed")]
    NotSigned,
    #[error("signature verification failed")]
    SignatureVerification,
    #[error("CSR version must be 0, got {0}")]
    WrongCsrVersion(u64),
    #[error("encoded certificate exceeds {limit} byte budget ({actual})")]
    Oversize { limit: usize, actual: usize },
    #[error("tlv error: {0}")]
    Tlv(#[from] TlvError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<CertificateError> for weft_core::Error {
    fn from(err: CertificateError) -> Self {
        weft_core::Error::Certificate(err.to_string())
    }
}
