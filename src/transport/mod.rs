//! Collaborators the catalog depends on: the discovery transport and the
//! credentials provider.

use async_trait::async_trait;
use http::HeaderMap;
use url::Url;

use crate::RawHostmap;

#[cfg(feature = "reqwest")]
mod rest;
#[cfg(feature = "reqwest")]
pub use rest::{HttpTransport, HttpTransportError};

/// Name of the discovery service catalogs are fetched from.
pub const DISCOVERY_SERVICE: &str = "u2c";

/// A request for one remote catalog.
#[derive(Debug, Clone)]
pub struct CatalogRequest {
    /// Logical service the request is addressed to, always
    /// [`DISCOVERY_SERVICE`].
    pub service: &'static str,
    /// Resolved URL of the discovery service, when the catalog knows it.
    pub base: Option<Url>,
    /// Resource path under the discovery service, e.g. `/limited/catalog`.
    pub resource: &'static str,
    /// Query parameters, in order.
    pub query: Vec<(String, String)>,
    /// Extra request headers, e.g. `authorization`.
    pub headers: HeaderMap,
}

impl CatalogRequest {
    /// Full request URL: `base`'s path extended by `resource`, with `query`
    /// appended. `None` without a base URL.
    pub fn url(&self) -> Option<Url> {
        let mut url = self.base.clone()?;
        let path = format!("{}{}", url.path().trim_end_matches('/'), self.resource);
        url.set_path(&path);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Some(url)
    }
}

/// Fetches catalogs from the remote discovery service.
///
/// Implementations own any retry or backoff policy; the refresher issues
/// exactly one call per refresh.
#[async_trait]
pub trait CatalogTransport: Send + Sync {
    /// Type of errors produced by the transport.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches one catalog in `hostmap` format.
    async fn fetch(&self, request: CatalogRequest) -> Result<RawHostmap, Self::Error>;
}

/// Parameters for acquiring a client (machine) token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTokenRequest {
    /// Token endpoint.
    pub uri: Url,
    /// Requested scope.
    pub scope: String,
}

/// Provides the organization and tokens of the current session.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Type of errors produced by the provider.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether a user token can be produced.
    fn can_authorize(&self) -> bool;

    /// Whether the session holds a long-lived user token.
    fn has_supertoken(&self) -> bool;

    /// Organization of the current user.
    async fn org_id(&self) -> Result<String, Self::Error>;

    /// Authorization header value for the current user.
    async fn user_token(&self) -> Result<String, Self::Error>;

    /// Authorization header value for a client token.
    async fn client_token(&self, request: ClientTokenRequest) -> Result<String, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_url() {
        let request = CatalogRequest {
            service: DISCOVERY_SERVICE,
            base: Some(Url::parse("https://u2c.example/u2c/api/v1/").unwrap()),
            resource: "/limited/catalog",
            query: vec![
                ("orgId".to_string(), "org 1".to_string()),
                ("format".to_string(), "hostmap".to_string()),
            ],
            headers: HeaderMap::new(),
        };
        assert_eq!(
            request.url().unwrap().as_str(),
            "https://u2c.example/u2c/api/v1/limited/catalog?orgId=org+1&format=hostmap"
        );
    }

    #[test]
    fn no_base_no_url() {
        let request = CatalogRequest {
            service: DISCOVERY_SERVICE,
            base: None,
            resource: "/catalog",
            query: vec![],
            headers: HeaderMap::new(),
        };
        assert_eq!(request.url(), None);
    }
}
