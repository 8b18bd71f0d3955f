//! Errors produced by catalog operations.

use std::{sync::Arc, time::Duration};

use crate::GroupId;

/// Opaque error passed through from a collaborator.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors encountered by a [`DiscoveryClient`](crate::DiscoveryClient) or
/// [`ServiceCatalog`](crate::ServiceCatalog).
///
/// Lookups never produce an error for an unknown service; they return `None`.
/// The type is `Clone` so the outcome of one refresh can be handed to every
/// caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A catalog query was malformed or missing a required key
    #[error("invalid catalog query: {0}")]
    InvalidQuery(String),
    /// A group did not become ready within the wait budget
    #[error("timed out after {timeout:?} waiting for the {group} catalog")]
    CatalogTimeout {
        /// Group that was waited on
        group: GroupId,
        /// Budget that elapsed
        timeout: Duration,
    },
    /// No group produced the requested service
    #[error("service '{name}' was not found in any of the catalogs")]
    ServiceNotFound {
        /// Logical service name
        name: String,
    },
    /// The discovery transport failed
    #[error("catalog transport error: {0}")]
    Transport(BoxError),
    /// The credentials collaborator failed
    #[error("credentials error: {0}")]
    Credentials(BoxError),
    /// A missing bearer token for a catalog that requires one
    #[error("a token is required to collect the {0} catalog")]
    MissingToken(GroupId),
    /// An unrecognized group name was supplied
    #[error("unknown service group '{0}'")]
    UnknownGroup(String),
    /// No service is registered for the requested cluster
    #[error("could not find service for cluster [{cluster}]")]
    NoClusterService {
        /// Cluster identifier that was looked up
        cluster: String,
    },
    /// A URL does not belong to any known service
    #[error("no service associated with url: [{url}]")]
    NoServiceForUrl {
        /// URL that was looked up
        url: String,
    },
    /// A URL could not be parsed
    #[error("parsing url: {0}")]
    UrlParsing(#[from] url::ParseError),
    /// The services configuration could not be loaded
    #[error("services configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wraps a transport collaborator error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }

    /// Wraps a credentials collaborator error.
    pub fn credentials(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Credentials(Arc::new(err))
    }
}
