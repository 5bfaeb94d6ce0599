//! # Libri Core
//!
//! Core engines for a peer-to-peer content-addressed document network.
//! Long-lived peers ("librarians") hold immutable, cryptographically signed
//! documents; clients ("authors") publish documents encrypted under
//! per-document keys wrapped for specific readers. This crate implements the
//! machinery every operation on that network leans on:
//!
//! - **Iterative search**: concurrent, bounded, best-first lookup of the K
//!   peers closest to a key, or of the stored value under it
//! - **Introductions**: parallel bootstrap traversal that turns a few seed
//!   peers into a populated view of the network
//! - **Envelope**: ECDH-derived key-encrypting keys, per-document entry
//!   keys, and the signed-token protocol authenticating every RPC
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 256-bit identifiers and XOR distance |
//! | `identity` | P-256 signing identity; ID derived from the public key |
//! | `envelope` | KEK derivation and EEK wrap/unwrap |
//! | `crypto` | Compact ES256 token signing and verification |
//! | `messages` | Wire message types and bounded decoding |
//! | `peer` | Peer records, response stats, peer construction |
//! | `protocols` | RPC client traits and connector/factory seams |
//! | `search` | Concurrent iterative DHT search engine |
//! | `introduce` | Concurrent bootstrap introduction engine |
//!
//! ## Injection Seams
//!
//! The engines are polymorphic over the signer, the RPC client factory, and
//! the response processor, so transports attach at the [`protocols`] traits
//! and tests drive the engines with deterministic in-memory doubles.
//!
//! Routing tables, document storage, chunking, and transport wiring live in
//! their own crates and reach this one only through those seams.

pub mod crypto;
pub mod envelope;
pub mod id;
pub mod identity;
pub mod introduce;
pub mod messages;
pub mod peer;
pub mod protocols;
pub mod search;

pub use crypto::{NoOpSigner, RequestSigner, TokenError, TokenSigner, TokenVerifier};
pub use envelope::{Eek, Kek, KekError};
pub use id::{Distance, Id};
pub use identity::NodeIdentity;
pub use introduce::{Introducer, Introduction};
pub use messages::{Document, FindRequest, FindResponse, IntroduceRequest, IntroduceResponse, PeerAddress};
pub use peer::{Fromer, Peer};
pub use search::{Search, Searcher, TooManyFindErrors};
