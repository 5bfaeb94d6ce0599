//! # Signing Identity
//!
//! Every principal in the network (librarian or author) holds a NIST P-256
//! ECDSA keypair. The principal's [`Id`] is derived from the public key: the
//! 32-byte affine x-coordinate of the curve point. The same key signs request
//! tokens and enters into Diffie–Hellman agreement for the document key
//! envelope, so identity, authentication, and key wrapping all hang off one
//! keypair.
//!
//! Public keys travel on the wire in compressed SEC1 form (33 bytes). Any
//! byte string that does not decode to a point on P-256 is rejected with
//! [`KeyError::InvalidKey`]; this boundary is where off-curve key material
//! dies.

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::CryptoRngCore;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::id::Id;

/// Length of a compressed SEC1 P-256 public key on the wire.
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Error for key material that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Bytes do not encode a point on curve P-256 (or a valid scalar).
    #[error("key material is not a valid P-256 key")]
    InvalidKey,
}

/// A P-256 signing keypair together with the identifier it induces.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS entropy source.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Generate an identity from the given generator; seeded generators give
    /// reproducible identities in tests.
    pub fn pseudo_random(rng: &mut impl CryptoRngCore) -> Self {
        Self {
            signing_key: SigningKey::random(rng),
        }
    }

    /// Reconstruct an identity from the 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(Self { signing_key })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// The identifier induced by this keypair.
    pub fn id(&self) -> Id {
        id_from_public_key(&self.public_key())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret_key().public_key()
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey::from(self.signing_key.as_nonzero_scalar())
    }

    /// Compressed SEC1 encoding of the public key, as sent in request
    /// metadata.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        encode_public_key(&self.public_key())
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Derive the identifier for a public key: the affine x-coordinate.
pub fn id_from_public_key(public_key: &PublicKey) -> Id {
    let point = public_key.to_encoded_point(false);
    let x = point
        .x()
        .expect("P-256 public keys always have an affine x-coordinate");
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(x);
    Id::from_bytes(bytes)
}

/// Encode a public key in compressed SEC1 form (33 bytes).
pub fn encode_public_key(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a compressed (or uncompressed) SEC1 public key, rejecting byte
/// strings that are not a point on the curve.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidKey)
}
