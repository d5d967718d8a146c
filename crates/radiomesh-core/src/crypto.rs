//! Cryptographic capability
//!
//! The mesh uses two primitives:
//!
//! - **AEAD** (AES-256-GCM) for mesh payloads and sealed inclusion messages.
//!   A sealed blob is `nonce (12B) || ciphertext || tag (16B)` with a fresh
//!   random nonce per message.
//! - **Key agreement** (X25519 + HKDF-SHA256) to derive the bootstrap key that
//!   protects the mesh key while a device is being included.
//!
//! The core only depends on [`CryptoProvider`]; [`SoftwareCrypto`] is the
//! pure-software implementation.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length
pub const KEY_LEN: usize = 32;

/// AEAD nonce length
pub const NONCE_LEN: usize = 12;

/// AEAD tag length
pub const TAG_LEN: usize = 16;

/// Bytes added by [`CryptoProvider::seal`]
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// 256-bit symmetric key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MeshKey([u8; KEY_LEN]);

impl MeshKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse key bytes of exactly [`KEY_LEN`]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(raw))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MeshKey([REDACTED])")
    }
}

/// X25519 key pair used for one inclusion handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AgreementKeyPair {
    secret: [u8; KEY_LEN],
    #[zeroize(skip)]
    public: [u8; KEY_LEN],
}

impl AgreementKeyPair {
    /// Public half, sent to the peer
    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("public", &hex(&self.public))
            .finish_non_exhaustive()
    }
}

/// Crypto operations the mesh consumes
pub trait CryptoProvider {
    /// Encrypt and authenticate `plaintext` bound to `aad`
    fn seal(&self, key: &MeshKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify and decrypt a blob produced by [`seal`](Self::seal)
    fn open(&self, key: &MeshKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Fresh ephemeral key pair
    fn generate_key_pair(&self) -> AgreementKeyPair;

    /// Agree on a shared secret with `peer_public` and expand it into a symmetric key
    fn derive_shared_key(
        &self,
        own: &AgreementKeyPair,
        peer_public: &[u8; KEY_LEN],
        salt: &[u8],
        info: &[u8],
    ) -> Result<MeshKey, CryptoError>;

    /// Fill `out` with random bytes
    fn random_bytes(&self, out: &mut [u8]);

    /// Fresh random symmetric key
    fn generate_key(&self) -> MeshKey {
        let mut raw = [0u8; KEY_LEN];
        self.random_bytes(&mut raw);
        let key = MeshKey::from_bytes(raw);
        raw.zeroize();
        key
    }
}

/// Software implementation over `aes-gcm`, `x25519-dalek` and `hkdf`
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    /// Create the provider
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn seal(&self, key: &MeshKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::SealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &MeshKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::OpenFailed);
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::OpenFailed)
    }

    fn generate_key_pair(&self) -> AgreementKeyPair {
        let mut raw = [0u8; KEY_LEN];
        self.random_bytes(&mut raw);
        let secret = StaticSecret::from(raw);
        raw.zeroize();
        AgreementKeyPair {
            public: PublicKey::from(&secret).to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    fn derive_shared_key(
        &self,
        own: &AgreementKeyPair,
        peer_public: &[u8; KEY_LEN],
        salt: &[u8],
        info: &[u8],
    ) -> Result<MeshKey, CryptoError> {
        let secret = StaticSecret::from(own.secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        // Low-order peer points yield an all-zero secret
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
        let mut okm = [0u8; KEY_LEN];
        hk.expand(info, &mut okm).map_err(|_| CryptoError::InvalidKey)?;
        let key = MeshKey::from_bytes(okm);
        okm.zeroize();
        Ok(key)
    }

    fn random_bytes(&self, out: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(out);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
