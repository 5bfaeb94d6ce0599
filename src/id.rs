//! # 256-bit Identifiers
//!
//! Peers and document keys share one identifier space: unsigned 256-bit
//! integers with a canonical big-endian byte representation. Closeness
//! between identifiers is the Kademlia XOR metric, compared as a 256-bit
//! unsigned integer.
//!
//! - [`Id`]: a peer or key identifier; `Copy`, ordered by magnitude, usable
//!   directly as a map key
//! - [`Distance`]: the XOR of two [`Id`]s; total, deterministic ordering
//!
//! The string form of an [`Id`] is URL-safe base64 without padding.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Identifier length in bytes.
pub const ID_LENGTH: usize = 32;

/// Error parsing an [`Id`] from its string or slice form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Input did not decode to exactly 32 bytes.
    #[error("identifier must be exactly {ID_LENGTH} bytes")]
    InvalidLength,
    /// Input was not valid URL-safe base64.
    #[error("identifier is not valid URL-safe base64")]
    InvalidEncoding,
}

/// A 256-bit identifier with canonical big-endian byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_LENGTH]);

impl Id {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice, rejecting anything but exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; ID_LENGTH] = bytes.try_into().map_err(|_| IdError::InvalidLength)?;
        Ok(Self(arr))
    }

    /// Draw a fresh identifier from the OS entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        OsRng.fill(&mut bytes);
        Self(bytes)
    }

    /// Draw an identifier from the given generator. Seeded generators give
    /// reproducible identifier universes in tests.
    pub fn pseudo_random<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// XOR distance to another identifier.
    #[inline]
    pub fn distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Canonical URL-safe base64 string form (unpadded, 43 characters).
    pub fn to_base64(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, IdError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| IdError::InvalidEncoding)?;
        Self::from_slice(&bytes)
    }

    /// Short hex prefix for log lines.
    pub(crate) fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl From<[u8; ID_LENGTH]> for Id {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; ID_LENGTH] {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// XOR distance between two identifiers.
///
/// Derived ordering on the inner big-endian array is lexicographic, which is
/// exactly 256-bit unsigned magnitude order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_LENGTH]);

impl Distance {
    /// The maximum representable distance. Stands in for "infinity" when a
    /// candidate set is empty.
    pub const MAX: Distance = Distance([0xFF; ID_LENGTH]);

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}
