//! # Request Signing
//!
//! Every peer-to-peer request is authenticated by a compact signed token in
//! the `header.payload.signature` shape, attached to the RPC as metadata:
//!
//! - header: `{"alg":"ES256","typ":"JWT"}`, base64url without padding
//! - payload: `{"hash":"<claim>"}` where the claim is the padded base64url
//!   SHA-256 of the canonical serialization of the request (44 characters,
//!   trailing `=`)
//! - signature: ECDSA-P256-SHA256 over `header.payload`, 64 raw bytes
//!   (`r ‖ s`), base64url without padding
//!
//! The receiving side verifies the signature first, then recomputes the
//! message hash and compares it to the claim, binding the token to the exact
//! request bytes.
//!
//! The engines are polymorphic over [`RequestSigner`] so deterministic test
//! doubles can stand in for real signing.

use base64::Engine as _;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::NodeIdentity;
use crate::messages::{Request, canonical_bytes};

/// Length of a well-formed hash claim: 43 base64url characters plus `=`.
pub const CLAIM_LENGTH: usize = 44;

/// Errors from token construction and verification.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The message could not be canonically serialized.
    #[error("message could not be serialized for signing")]
    Serialize,
    /// An empty token was presented for verification.
    #[error("token is empty")]
    EmptyToken,
    /// The token does not have the compact three-part shape, or a part does
    /// not decode.
    #[error("token is malformed")]
    MalformedToken,
    /// The ECDSA signature over `header.payload` does not verify.
    #[error("token signature does not verify")]
    BadSignature,
    /// The claim does not match the hash of the presented message.
    #[error("token claim does not match the message hash")]
    HashMismatch,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    hash: String,
}

/// Check that a claim string is a well-formed hash claim: exactly 44
/// characters, `[A-Za-z0-9_-]` in the first 43, trailing `=`.
pub fn validate_claim(claim: &str) -> bool {
    let bytes = claim.as_bytes();
    if bytes.len() != CLAIM_LENGTH || bytes[CLAIM_LENGTH - 1] != b'=' {
        return false;
    }
    bytes[..CLAIM_LENGTH - 1]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
}

fn message_claim<M: Serialize>(message: &M) -> Result<String, TokenError> {
    let bytes = canonical_bytes(message).map_err(|_| TokenError::Serialize)?;
    Ok(URL_SAFE.encode(Sha256::digest(&bytes)))
}

/// Signs canonical message bytes into compact ES256 tokens.
pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    pub fn new(identity: &NodeIdentity) -> Self {
        Self {
            key: identity.signing_key().clone(),
        }
    }

    /// Sign a message: hash its canonical serialization into the claim and
    /// sign the encoded header and payload.
    pub fn sign<M: Serialize>(&self, message: &M) -> Result<String, TokenError> {
        let header = Header {
            alg: "ES256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            hash: message_claim(message)?,
        };

        let header_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&header).map_err(|_| TokenError::Serialize)?);
        let payload_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).map_err(|_| TokenError::Serialize)?);
        let signing_input = format!("{header_b64}.{payload_b64}");

        let signature: Signature = self.key.sign(signing_input.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

/// Verifies compact ES256 tokens against a message and a public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenVerifier;

impl TokenVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify that `token` was produced by the holder of `public_key` over
    /// exactly `message`.
    pub fn verify<M: Serialize>(
        &self,
        token: &str,
        public_key: &VerifyingKey,
        message: &M,
    ) -> Result<(), TokenError> {
        if token.is_empty() {
            return Err(TokenError::EmptyToken);
        }

        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
            return Err(TokenError::MalformedToken);
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::MalformedToken)?;
        let header: Header =
            serde_json::from_slice(&header_json).map_err(|_| TokenError::MalformedToken)?;
        if header.alg != "ES256" {
            return Err(TokenError::MalformedToken);
        }

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::MalformedToken)?;
        let claims: Claims =
            serde_json::from_slice(&payload_json).map_err(|_| TokenError::MalformedToken)?;
        if !validate_claim(&claims.hash) {
            return Err(TokenError::MalformedToken);
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::MalformedToken)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| TokenError::MalformedToken)?;

        let signing_input = format!("{header_b64}.{payload_b64}");
        public_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::BadSignature)?;

        if message_claim(message)? != claims.hash {
            return Err(TokenError::HashMismatch);
        }
        Ok(())
    }
}

/// The signing capability the search and introduce engines depend on.
pub trait RequestSigner: Send + Sync {
    fn sign_request(&self, request: &Request) -> Result<String, TokenError>;
}

impl RequestSigner for TokenSigner {
    fn sign_request(&self, request: &Request) -> Result<String, TokenError> {
        self.sign(request)
    }
}

/// Signer double that produces a fixed token without touching a key. For
/// test harnesses that exercise engine behavior rather than authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSigner;

impl RequestSigner for NoOpSigner {
    fn sign_request(&self, _request: &Request) -> Result<String, TokenError> {
        Ok("noop.token.signature".to_string())
    }
}
