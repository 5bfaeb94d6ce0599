//! RPC capability traits for the Find and Introduce families.
//!
//! Traits are defined separately from any transport so the engines depend
//! only on capabilities:
//!
//! | Capability | Purpose |
//! |------------|---------|
//! | [`FinderRpc`] | Closest-peer / value lookup queries |
//! | [`IntroducerRpc`] | Bootstrap introduction queries |
//! | [`Connector`] | Per-peer lazy RPC client production |
//! | [`FinderCreator`] / [`IntroducerCreator`] | Client factory seams the engines are injected with |
//!
//! A [`Connector`] belongs to exactly one peer: it owns at most one
//! underlying client, constructs it on first use, reuses it across queries,
//! and serializes concurrent access internally. The creator traits exist so
//! tests can swap the factory for doubles (always-erroring, fixed-response)
//! without touching peers or connectors.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{FindRequest, FindResponse, IntroduceRequest, IntroduceResponse};

/// Closest-peer and value lookup RPC client.
#[async_trait]
pub trait FinderRpc: Send + Sync {
    /// Dispatch a signed Find request and await the peer's response.
    async fn find(&self, request: FindRequest, token: String) -> Result<FindResponse>;
}

/// Bootstrap introduction RPC client.
#[async_trait]
pub trait IntroducerRpc: Send + Sync {
    /// Dispatch a signed Introduce request and await the peer's response.
    async fn introduce(&self, request: IntroduceRequest, token: String)
    -> Result<IntroduceResponse>;
}

/// Per-peer capability that produces RPC clients lazily.
pub trait Connector: Send + Sync {
    /// The Find client for this peer, constructed on first use and cached.
    fn finder(&self) -> Result<Arc<dyn FinderRpc>>;

    /// The Introduce client for this peer, constructed on first use and
    /// cached.
    fn introducer(&self) -> Result<Arc<dyn IntroducerRpc>>;
}

/// Factory seam producing Find clients from connectors.
pub trait FinderCreator: Send + Sync {
    fn create(&self, connector: &dyn Connector) -> Result<Arc<dyn FinderRpc>>;
}

/// Factory seam producing Introduce clients from connectors.
pub trait IntroducerCreator: Send + Sync {
    fn create(&self, connector: &dyn Connector) -> Result<Arc<dyn IntroducerRpc>>;
}

/// Default Find factory: delegate to the peer's own connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectorFinderCreator;

impl FinderCreator for ConnectorFinderCreator {
    fn create(&self, connector: &dyn Connector) -> Result<Arc<dyn FinderRpc>> {
        connector.finder()
    }
}

/// Default Introduce factory: delegate to the peer's own connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectorIntroducerCreator;

impl IntroducerCreator for ConnectorIntroducerCreator {
    fn create(&self, connector: &dyn Connector) -> Result<Arc<dyn IntroducerRpc>> {
        connector.introducer()
    }
}
