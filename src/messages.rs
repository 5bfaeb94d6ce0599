//! # Wire Messages
//!
//! Serializable message types for the Find and Introduce RPC families.
//! Messages are serialized with bincode; the encoding is deterministic for a
//! given message, so the same bytes double as the canonical input to request
//! signing. All network-facing decodes go through [`deserialize_bounded`]
//! with a size limit.
//!
//! | RPC family | Request | Response |
//! |------------|---------|----------|
//! | Find | [`FindRequest`] | [`FindResponse`] |
//! | Introduce | [`IntroduceRequest`] | [`IntroduceResponse`] |
//!
//! Every request carries [`RequestMetadata`]: a fresh 32-byte request
//! identifier, the sender's compressed P-256 public key, and a millisecond
//! timestamp. Responses echo the request identifier so callers can match
//! replies to in-flight queries.

use bincode::Options;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::id::Id;
use crate::identity::{KeyError, NodeIdentity, decode_public_key};

/// Length of a request identifier.
pub const REQUEST_ID_LENGTH: usize = 32;

/// Maximum size of a stored document (2 MiB). Larger content is chunked
/// upstream before it reaches the wire.
pub const MAX_DOCUMENT_SIZE: usize = 2 * 1024 * 1024;

/// Maximum buffer size accepted when deserializing a network message.
/// Slightly larger than the document bound to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_DOCUMENT_SIZE as u64) + 4096;

/// Bincode options with the size limit enforced. All untrusted decodes use
/// this to prevent memory exhaustion.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Canonical serialization of a message; the signing layer hashes exactly
/// these bytes.
pub fn canonical_bytes<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

/// Milliseconds since the Unix epoch, for request timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: [u8; REQUEST_ID_LENGTH],
    /// Compressed SEC1 encoding of the sender's P-256 public key.
    pub pub_key: Vec<u8>,
    pub timestamp_ms: u64,
}

impl RequestMetadata {
    /// Stamp fresh metadata for an outbound request: a random request
    /// identifier, the sender's public key, and the current time.
    pub fn new(sender: &NodeIdentity) -> Self {
        let mut request_id = [0u8; REQUEST_ID_LENGTH];
        OsRng.fill_bytes(&mut request_id);
        Self {
            request_id,
            pub_key: sender.public_key_bytes(),
            timestamp_ms: now_ms(),
        }
    }

    /// Validate inbound metadata, returning the sender's public key.
    /// A request whose key material does not decode is not worth signing
    /// verification or further handling.
    pub fn validate(&self) -> Result<p256::PublicKey, KeyError> {
        decode_public_key(&self.pub_key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: [u8; REQUEST_ID_LENGTH],
    pub pub_key: Vec<u8>,
}

impl ResponseMetadata {
    /// Build response metadata echoing the request identifier.
    pub fn for_request(request: &RequestMetadata, responder: &NodeIdentity) -> Self {
        Self {
            request_id: request.request_id,
            pub_key: responder.public_key_bytes(),
        }
    }
}

/// Network address and identity of a peer, as exchanged in responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: Id,
    pub peer_name: String,
    pub ip: String,
    pub port: u16,
}

/// An immutable stored document. The network is content-addressed: a
/// document lives under the hash of its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    /// The key this document is stored under.
    pub fn key(&self) -> Id {
        Id::from_bytes(*blake3::hash(&self.content).as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindRequest {
    pub metadata: RequestMetadata,
    /// Target key: a peer identifier or document key.
    pub key: Id,
    /// How many close peers the responder should return.
    pub num_peers: u32,
}

impl FindRequest {
    pub fn new(sender: &NodeIdentity, key: Id, num_peers: u32) -> Self {
        Self {
            metadata: RequestMetadata::new(sender),
            key,
            num_peers,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResponse {
    pub metadata: ResponseMetadata,
    /// Peers the responder believes are closest to the requested key.
    pub peers: Vec<PeerAddress>,
    /// The stored document, when the responder holds the requested key.
    pub value: Option<Document>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroduceRequest {
    pub metadata: RequestMetadata,
    /// The requester's own address, so the responder can learn of it.
    pub self_address: PeerAddress,
    pub num_peers: u32,
}

impl IntroduceRequest {
    pub fn new(sender: &NodeIdentity, self_address: PeerAddress, num_peers: u32) -> Self {
        Self {
            metadata: RequestMetadata::new(sender),
            self_address,
            num_peers,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroduceResponse {
    pub metadata: ResponseMetadata,
    pub self_address: PeerAddress,
    pub peers: Vec<PeerAddress>,
}

/// The set of signable requests. Engines sign the canonical serialization of
/// one of these before dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Find(FindRequest),
    Introduce(IntroduceRequest),
}

impl Request {
    pub fn metadata(&self) -> &RequestMetadata {
        match self {
            Request::Find(rq) => &rq.metadata,
            Request::Introduce(rq) => &rq.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn test_address(rng: &mut StdRng, index: usize) -> PeerAddress {
        PeerAddress {
            peer_id: Id::pseudo_random(rng),
            peer_name: format!("peer-{index:03}"),
            ip: "localhost".to_string(),
            port: 20100 + index as u16,
        }
    }

    #[test]
    fn request_metadata_is_fresh_and_validates() {
        let sender = NodeIdentity::generate();
        let a = RequestMetadata::new(&sender);
        let b = RequestMetadata::new(&sender);

        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.pub_key.len(), crate::identity::PUBLIC_KEY_LENGTH);
        assert_eq!(a.validate().unwrap(), sender.public_key());
    }

    #[test]
    fn metadata_validation_rejects_garbage_keys() {
        let sender = NodeIdentity::generate();
        let mut metadata = RequestMetadata::new(&sender);
        metadata.pub_key = vec![0xAB; 33];
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn response_metadata_echoes_request_id() {
        let sender = NodeIdentity::generate();
        let responder = NodeIdentity::generate();
        let request = RequestMetadata::new(&sender);
        let response = ResponseMetadata::for_request(&request, &responder);

        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.pub_key, responder.public_key_bytes());
    }

    #[test]
    fn find_request_round_trips_through_bincode() {
        let mut rng = StdRng::seed_from_u64(0);
        let sender = NodeIdentity::pseudo_random(&mut rng);
        let request = FindRequest::new(&sender, Id::pseudo_random(&mut rng), 20);

        let bytes = canonical_bytes(&request).unwrap();
        let decoded: FindRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn canonical_bytes_are_deterministic_and_content_sensitive() {
        let mut rng = StdRng::seed_from_u64(1);
        let sender = NodeIdentity::pseudo_random(&mut rng);
        let request = Request::Find(FindRequest::new(&sender, Id::pseudo_random(&mut rng), 20));

        assert_eq!(
            canonical_bytes(&request).unwrap(),
            canonical_bytes(&request).unwrap()
        );

        let mut altered = match &request {
            Request::Find(rq) => rq.clone(),
            _ => unreachable!(),
        };
        altered.num_peers = 10;
        assert_ne!(
            canonical_bytes(&request).unwrap(),
            canonical_bytes(&Request::Find(altered)).unwrap()
        );
    }

    #[test]
    fn bounded_deserialize_rejects_truncated_input() {
        let mut rng = StdRng::seed_from_u64(2);
        let sender = NodeIdentity::pseudo_random(&mut rng);
        let request = FindRequest::new(&sender, Id::pseudo_random(&mut rng), 20);
        let bytes = canonical_bytes(&request).unwrap();

        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_bounded::<FindRequest>(truncated).is_err());
    }

    #[test]
    fn document_key_is_content_addressed() {
        let a = Document::new(b"on the shelf".to_vec());
        let b = Document::new(b"on the shelf".to_vec());
        let c = Document::new(b"off the shelf".to_vec());

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn introduce_round_trip_preserves_peer_list() {
        let mut rng = StdRng::seed_from_u64(3);
        let responder = NodeIdentity::pseudo_random(&mut rng);
        let request_meta = RequestMetadata::new(&responder);
        let response = IntroduceResponse {
            metadata: ResponseMetadata::for_request(&request_meta, &responder),
            self_address: test_address(&mut rng, 0),
            peers: (1..=8).map(|i| test_address(&mut rng, i)).collect(),
        };

        let bytes = canonical_bytes(&response).unwrap();
        let decoded: IntroduceResponse = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.peers.len(), 8);
        assert_eq!(decoded, response);
    }
}
