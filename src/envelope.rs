//! # Document Key Envelope
//!
//! Authors encrypt every document under per-document key material (the
//! [`Eek`]), then wrap that material for each permitted reader under a shared
//! key-encrypting key (the [`Kek`]) agreed via Diffie–Hellman on P-256:
//!
//! 1. ECDH between the author's private key and the reader's public key
//!    yields a 32-byte shared secret (the x-coordinate of the product point).
//! 2. HKDF-SHA256 stretches the secret into 76 bytes of keying material,
//!    sliced into an AES-256 key, a 12-byte GCM nonce, and an HMAC key.
//! 3. The EEK is sealed with AES-256-GCM and authenticated a second time
//!    with HMAC-SHA256 over the ciphertext, so a reader can reject a damaged
//!    envelope in constant time before touching the cipher.
//!
//! The derivation is symmetric: author-private × reader-public and
//! reader-private × author-public produce the same [`Kek`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::rand_core::CryptoRngCore;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::identity::decode_public_key;

/// Domain string fed to HKDF when deriving a KEK.
const KEK_HKDF_INFO: &[u8] = b"libri-KEK";

/// Marshaled KEK length: AES key (32) + GCM nonce (12) + HMAC key (32).
pub const KEK_LENGTH: usize = 76;

/// Marshaled EEK length: AES key (32) + page IV seed (32) + HMAC key (32) +
/// metadata IV (12).
pub const EEK_LENGTH: usize = 108;

/// Sealed EEK length: plaintext plus the 16-byte GCM tag.
pub const EEK_CIPHERTEXT_LENGTH: usize = EEK_LENGTH + 16;

/// HMAC-SHA256 output length.
pub const MAC_LENGTH: usize = 32;

/// Errors from KEK derivation and envelope sealing/opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KekError {
    /// Key material does not lie on curve P-256.
    #[error("key material is not a valid P-256 key")]
    InvalidKey,
    /// The cipher rejected the sealing operation.
    #[error("AES-GCM cipher initialization or sealing failed")]
    CipherInit,
    /// HMAC over the ciphertext does not match.
    #[error("envelope MAC mismatch")]
    MacMismatch,
    /// GCM authentication tag mismatch when opening.
    #[error("envelope authentication tag mismatch")]
    AuthTag,
    /// Marshaled key material has the wrong length.
    #[error("marshaled key material has the wrong length")]
    Malformed,
    /// The OS entropy source failed to produce key material.
    #[error("entropy source exhausted")]
    Rng,
}

/// Key-encrypting key shared between two principals.
#[derive(Clone, PartialEq, Eq)]
pub struct Kek {
    aes_key: [u8; 32],
    iv: [u8; 12],
    hmac_key: [u8; 32],
}

impl Kek {
    /// Derive the KEK shared between a local private key and a remote public
    /// key. Symmetric in its arguments.
    pub fn derive(local: &SecretKey, remote: &PublicKey) -> Self {
        let shared =
            p256::ecdh::diffie_hellman(local.to_nonzero_scalar(), remote.as_affine());

        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
        let mut okm = [0u8; KEK_LENGTH];
        hk.expand(KEK_HKDF_INFO, &mut okm)
            .expect("76 bytes is within the HKDF-SHA256 output bound");

        Self::split(&okm)
    }

    /// Derive a KEK from raw key material: a 32-byte secret scalar and a
    /// SEC1-encoded remote public key. Off-curve or malformed inputs are
    /// rejected with [`KekError::InvalidKey`].
    pub fn derive_from_bytes(local_secret: &[u8], remote_public: &[u8]) -> Result<Self, KekError> {
        let local = SecretKey::from_slice(local_secret).map_err(|_| KekError::InvalidKey)?;
        let remote = decode_public_key(remote_public).map_err(|_| KekError::InvalidKey)?;
        Ok(Self::derive(&local, &remote))
    }

    /// Draw a KEK from the given generator. Test fixtures only; real KEKs
    /// come from [`Kek::derive`].
    pub fn pseudo_random<R: RngCore>(rng: &mut R) -> Self {
        let mut material = [0u8; KEK_LENGTH];
        rng.fill_bytes(&mut material);
        Self::split(&material)
    }

    fn split(material: &[u8; KEK_LENGTH]) -> Self {
        let mut aes_key = [0u8; 32];
        let mut iv = [0u8; 12];
        let mut hmac_key = [0u8; 32];
        aes_key.copy_from_slice(&material[..32]);
        iv.copy_from_slice(&material[32..44]);
        hmac_key.copy_from_slice(&material[44..]);
        Self {
            aes_key,
            iv,
            hmac_key,
        }
    }

    /// Seal an EEK: AES-256-GCM over the marshaled key material, plus
    /// HMAC-SHA256 over the resulting ciphertext.
    pub fn encrypt(&self, eek: &Eek) -> Result<(Vec<u8>, Vec<u8>), KekError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.aes_key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&self.iv), eek.marshal().as_slice())
            .map_err(|_| KekError::CipherInit)?;
        let mac = self.ciphertext_mac(&ciphertext);
        Ok((ciphertext, mac))
    }

    /// Open a sealed EEK. The HMAC is checked in constant time before the
    /// cipher sees the ciphertext.
    pub fn decrypt(&self, ciphertext: &[u8], mac: &[u8]) -> Result<Eek, KekError> {
        let mut verifier = <Hmac<Sha256> as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC-SHA256 accepts any key length");
        verifier.update(ciphertext);
        verifier.verify_slice(mac).map_err(|_| KekError::MacMismatch)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.aes_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.iv), ciphertext)
            .map_err(|_| KekError::AuthTag)?;

        Eek::unmarshal(&plaintext)
    }

    fn ciphertext_mac(&self, ciphertext: &[u8]) -> Vec<u8> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC-SHA256 accepts any key length");
        mac.update(ciphertext);
        mac.finalize().into_bytes().to_vec()
    }

    /// Fixed-layout 76-byte serialization.
    pub fn marshal(&self) -> [u8; KEK_LENGTH] {
        let mut out = [0u8; KEK_LENGTH];
        out[..32].copy_from_slice(&self.aes_key);
        out[32..44].copy_from_slice(&self.iv);
        out[44..].copy_from_slice(&self.hmac_key);
        out
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, KekError> {
        let material: &[u8; KEK_LENGTH] = bytes.try_into().map_err(|_| KekError::Malformed)?;
        Ok(Self::split(material))
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").finish_non_exhaustive()
    }
}

/// Per-document entry-encryption key material.
#[derive(Clone, PartialEq, Eq)]
pub struct Eek {
    aes_key: [u8; 32],
    page_iv_seed: [u8; 32],
    hmac_key: [u8; 32],
    metadata_iv: [u8; 12],
}

impl Eek {
    /// Draw fresh key material from the OS entropy source. Callers should
    /// retry on transient entropy exhaustion.
    pub fn generate() -> Result<Self, KekError> {
        let mut material = [0u8; EEK_LENGTH];
        OsRng
            .try_fill_bytes(&mut material)
            .map_err(|_| KekError::Rng)?;
        Ok(Self::split(&material))
    }

    /// Draw an EEK from the given generator. Test fixtures only.
    pub fn pseudo_random(rng: &mut impl CryptoRngCore) -> Self {
        let mut material = [0u8; EEK_LENGTH];
        rng.fill_bytes(&mut material);
        Self::split(&material)
    }

    fn split(material: &[u8; EEK_LENGTH]) -> Self {
        let mut aes_key = [0u8; 32];
        let mut page_iv_seed = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        let mut metadata_iv = [0u8; 12];
        aes_key.copy_from_slice(&material[..32]);
        page_iv_seed.copy_from_slice(&material[32..64]);
        hmac_key.copy_from_slice(&material[64..96]);
        metadata_iv.copy_from_slice(&material[96..]);
        Self {
            aes_key,
            page_iv_seed,
            hmac_key,
            metadata_iv,
        }
    }

    pub fn aes_key(&self) -> &[u8; 32] {
        &self.aes_key
    }

    pub fn page_iv_seed(&self) -> &[u8; 32] {
        &self.page_iv_seed
    }

    pub fn hmac_key(&self) -> &[u8; 32] {
        &self.hmac_key
    }

    pub fn metadata_iv(&self) -> &[u8; 12] {
        &self.metadata_iv
    }

    /// Fixed-layout 108-byte serialization.
    pub fn marshal(&self) -> [u8; EEK_LENGTH] {
        let mut out = [0u8; EEK_LENGTH];
        out[..32].copy_from_slice(&self.aes_key);
        out[32..64].copy_from_slice(&self.page_iv_seed);
        out[64..96].copy_from_slice(&self.hmac_key);
        out[96..].copy_from_slice(&self.metadata_iv);
        out
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, KekError> {
        let material: &[u8; EEK_LENGTH] = bytes.try_into().map_err(|_| KekError::Malformed)?;
        Ok(Self::split(material))
    }
}

impl std::fmt::Debug for Eek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eek").finish_non_exhaustive()
    }
}
