//! Cryptographic primitives for the Matter suite
//!
//! Wraps the mandated algorithms: ECDSA/ECDH on P-256, HKDF-SHA256,
//! HMAC-SHA256, SHA-256, and AES-128-CCM with a 13-byte nonce and a
//! 16-byte tag.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U16};
use ccm::Ccm;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-128-CCM with the Matter nonce/tag sizes.
type Aes128Ccm = Ccm<Aes128, U16, U13>;

/// Length of an uncompressed SEC1 P-256 public key (0x04 || X || Y).
pub const PUBLIC_KEY_LEN: usize = 65;
/// Length of a raw ECDSA P-256 signature (r || s).
pub const SIGNATURE_LEN: usize = 64;
/// Length of the AEAD nonce.
pub const AEAD_NONCE_LEN: usize = 13;
/// Length of a symmetric key.
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// P-256 keypair for operational identities and certificate signing.
#[derive(Clone, Debug)]
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Restore from the raw 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { secret })
    }

    /// Raw 32-byte scalar, for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    /// Uncompressed SEC1 public key (65 bytes, 0x04 || X || Y).
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Sign a message with ECDSA-with-SHA256, returning the raw r||s form.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(message);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&signature.to_bytes());
        out
    }

    /// ECDH against a peer's SEC1-encoded public key.
    pub fn ecdh(&self, their_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let peer = PublicKey::from_sec1_bytes(their_public)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }

    /// Verify a raw r||s ECDSA-with-SHA256 signature.
    pub fn verify(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidKeyLength)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// P-256 ephemeral key exchange for CASE.
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: [u8; PUBLIC_KEY_LEN],
}

impl EphemeralKeyExchange {
    /// Generate new ephemeral keypair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(point.as_bytes());
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public
    }

    /// Perform key exchange and derive the 32-byte shared secret.
    pub fn exchange(self, their_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let peer = PublicKey::from_sec1_bytes(their_public)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl Default for EphemeralKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// HMAC-SHA256 over a single message.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// HKDF-SHA256 expand into `out`.
pub fn hkdf_sha256(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    hkdf.expand(info, out)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// AES-128-CCM encrypt; output is ciphertext || 16-byte tag.
pub fn aes128_ccm_encrypt(
    key: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != SYMMETRIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-128-CCM decrypt and authenticate.
pub fn aes128_ccm_decrypt(
    key: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != SYMMETRIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn fill_random(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Draw a fixed-size random array.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    fill_random(&mut out);
    out
}
