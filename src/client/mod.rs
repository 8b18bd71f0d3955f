//! The discovery client facade.

use crate::{
    catalog::{ServiceMatch, ServiceUrls, DEFAULT_CATALOG_TIMEOUT},
    query::DEFAULT_PREAUTH_MODE,
    transport::{CatalogTransport, ClientTokenRequest, Credentials},
    CatalogQuery, CatalogRefresher, Error, GroupId, RawHostmap, ServiceCatalog, ServicesConfig,
};
use arc_swap::ArcSwap;
use futures_util::{stream::FuturesUnordered, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use url::Url;

/// Cluster assumed when a caller asks for the `us` cluster.
pub const DEFAULT_CLUSTER: &str = "urn:TEAM:us-east-2_a";

/// Service used to resolve a bare cluster into a URL.
pub const DEFAULT_CLUSTER_SERVICE: &str = "identityLookup";

/// Scope requested for the client token used to collect the sign-in catalog.
const CLIENT_TOKEN_SCOPE: &str = "webexsquare:admin webexsquare:get_conversation Identity:SCIM";

/// Client for resolving logical service names into endpoints.
///
/// # Usage
///
/// After being created by [`DiscoveryClient::new`] and configured with
/// [`DiscoveryClient::config`], the client is populated by
/// [`initialize`](DiscoveryClient::initialize) or the individual `collect_*`
/// operations. Names are resolved with [`resolve`](DiscoveryClient::resolve)
/// or, when the catalog may still be filling, with
/// [`wait_for_service`](DiscoveryClient::wait_for_service). Hosts that turn
/// out to be unreachable are reported with
/// [`mark_failed`](DiscoveryClient::mark_failed), or handled automatically by
/// [`execute`](DiscoveryClient::execute).
///
/// ## Transports and credentials
///
/// Catalogs are fetched by a [`CatalogTransport`] and authorized by a
/// [`Credentials`] provider supplied at construction.
#[derive(Debug)]
pub struct DiscoveryClient<Transport, Creds> {
    catalog: Arc<ServiceCatalog>,
    refresher: CatalogRefresher<Transport>,
    credentials: Creds,
    config: ArcSwap<ServicesConfig>,
    init_failed: AtomicBool,
}

impl<Transport, Creds> DiscoveryClient<Transport, Creds>
where
    Transport: CatalogTransport + 'static,
    Creds: Credentials,
{
    /// Creates a client with an empty catalog and default configuration.
    pub fn new(transport: Transport, credentials: Creds) -> Self {
        let catalog = Arc::new(ServiceCatalog::new());
        Self {
            refresher: CatalogRefresher::new(catalog.clone(), transport),
            catalog,
            credentials,
            config: Default::default(),
            init_failed: AtomicBool::new(false),
        }
    }

    /// Applies `config` to the client.
    pub fn config(self, config: ServicesConfig) -> Self {
        self.init_config(config);
        self
    }

    /// Seeds the static groups and allowed domains from `config`.
    pub fn init_config(&self, config: ServicesConfig) {
        let discovery = config.effective_discovery();
        if !discovery.is_empty() {
            self.catalog.update_from_links(GroupId::Discovery, &discovery);
        }
        if !config.overrides.is_empty() {
            self.catalog
                .update_from_links(GroupId::Override, &config.overrides);
        }
        self.catalog
            .set_allowed_domains(config.effective_allowed_domains());
        self.config.store(Arc::new(config));
    }

    /// The underlying catalog.
    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// The credentials provider.
    pub fn credentials(&self) -> &Creds {
        &self.credentials
    }

    /// Whether callers should validate URLs against the allowed domains.
    pub fn validates_domains(&self) -> bool {
        self.config.load().validate_domains
    }

    /// Whether any part of initialization failed.
    pub fn init_failed(&self) -> bool {
        self.init_failed.load(Ordering::Acquire)
    }

    /// Resolves `name` to a URL; see [`ServiceCatalog::get`].
    pub fn resolve(&self, name: &str, priority_host: bool, group: Option<GroupId>) -> Option<Url> {
        self.catalog.get(name, priority_host, group)
    }

    /// Whether any group knows `name`.
    pub fn has_service(&self, name: &str) -> bool {
        self.catalog.entry(name, None).is_some()
    }

    /// Whether any allowed domains are configured.
    pub fn has_allowed_domains(&self) -> bool {
        !self.catalog.allowed_domains().is_empty()
    }

    /// Snapshot of every known service; see [`ServiceCatalog::list`].
    pub fn list(&self, priority_host: bool, group: Option<GroupId>) -> HashMap<String, Url> {
        self.catalog.list(priority_host, group)
    }

    /// Reports `url` as unreachable and returns the URL to use instead.
    pub fn mark_failed(&self, url: &Url, no_priority_hosts: bool) -> Url {
        self.catalog.mark_failed_url(url, no_priority_hosts)
    }

    /// Replaces `group` with the contents of a discovery response obtained
    /// elsewhere.
    pub fn update_group(&self, group: GroupId, hostmap: &RawHostmap) {
        self.catalog.merge_hostmap(group, hostmap);
    }

    /// Fetches `group` from the discovery service; see
    /// [`CatalogRefresher::refresh`].
    pub async fn refresh(
        &self,
        group: GroupId,
        query: Option<&CatalogQuery>,
        token: Option<&str>,
        force_refresh: bool,
    ) -> Result<(), Error> {
        self.refresher
            .refresh(group, query, token, force_refresh)
            .await
    }

    /// Collects the pre-authentication catalog, by proximity when no query
    /// is given.
    pub async fn collect_preauth(
        &self,
        query: Option<CatalogQuery>,
        force_refresh: bool,
    ) -> Result<(), Error> {
        let query =
            query.unwrap_or_else(|| CatalogQuery::Mode(DEFAULT_PREAUTH_MODE.to_string()));
        self.refresh(GroupId::Preauth, Some(&query), None, force_refresh)
            .await
    }

    /// Collects the sign-in catalog for `email`, authorized by `token`.
    pub async fn collect_signin(
        &self,
        email: &str,
        token: &str,
        force_refresh: bool,
    ) -> Result<(), Error> {
        if email.is_empty() {
            return Err(Error::InvalidQuery("`email` is required".to_string()));
        }
        if token.is_empty() {
            return Err(Error::MissingToken(GroupId::Signin));
        }
        let query = CatalogQuery::Email(email.to_string());
        self.refresh(GroupId::Signin, Some(&query), Some(token), force_refresh)
            .await
    }

    /// Collects the post-authentication catalog with the current user's
    /// token.
    pub async fn collect_postauth(&self, force_refresh: bool) -> Result<(), Error> {
        let token = self
            .credentials
            .user_token()
            .await
            .map_err(Error::credentials)?;
        self.refresh(GroupId::Postauth, None, Some(&token), force_refresh)
            .await
    }

    /// Collects the sign-in catalog for `email` using a client token: the
    /// pre-authentication catalog is collected first to locate the identity
    /// broker that issues the token.
    pub async fn collect_signin_as_client(
        &self,
        email: &str,
        force_refresh: bool,
    ) -> Result<(), Error> {
        self.collect_preauth(Some(CatalogQuery::Email(email.to_string())), false)
            .await?;

        let idbroker = self
            .resolve("idbroker", true, None)
            .ok_or_else(|| Error::ServiceNotFound {
                name: "idbroker".to_string(),
            })?;
        let mut token_uri = idbroker.to_string();
        if !token_uri.ends_with('/') {
            token_uri.push('/');
        }
        token_uri.push_str("idb/oauth2/v1/access_token");

        let token = self
            .credentials
            .client_token(ClientTokenRequest {
                uri: Url::parse(&token_uri)?,
                scope: CLIENT_TOKEN_SCOPE.to_string(),
            })
            .await
            .map_err(Error::credentials)?;
        self.collect_signin(email, &token, force_refresh).await
    }

    /// Collects the catalogs a session starts with: pre-authentication by
    /// organization, then post-authentication when the user can authorize.
    /// A post-authentication failure is recorded rather than returned.
    pub async fn init_service_catalogs(&self) -> Result<(), Error> {
        #[cfg(feature = "log")]
        tracing::info!("Initializing service catalogs");

        let org_id = self
            .credentials
            .org_id()
            .await
            .map_err(Error::credentials)?;
        self.collect_preauth(Some(CatalogQuery::OrgId(org_id)), false)
            .await?;

        if self.credentials.can_authorize() {
            if let Err(e) = self.collect_postauth(false).await {
                #[cfg(feature = "log")]
                tracing::warn!(error = %e, "Cannot retrieve postauth catalog");
                self.init_failed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Populates the catalog for a fresh session. With a long-lived token the
    /// full initialization runs and the catalog is marked ready; otherwise
    /// only the pre-authentication catalog is collected, by the configured
    /// email if there is one.
    pub async fn initialize(&self) -> Result<(), Error> {
        let result = if self.credentials.has_supertoken() {
            self.init_service_catalogs()
                .await
                .map(|()| self.catalog.set_ready())
        } else {
            let query = self.config.load().email.clone().map(CatalogQuery::Email);
            self.collect_preauth(query, false).await
        };

        if let Err(e) = &result {
            #[cfg(feature = "log")]
            tracing::error!(error = %e, "Failed to initialize service catalogs");
            self.init_failed.store(true, Ordering::Release);
        }
        result
    }

    /// Waits for `group` to become ready. A session with a long-lived token
    /// whose post-authentication catalog was never requested collects it
    /// rather than waiting.
    pub async fn wait_for_catalog(
        &self,
        group: GroupId,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if group == GroupId::Postauth && self.credentials.has_supertoken() {
            let status = self.catalog.status(GroupId::Postauth);
            if !status.collecting && !status.ready {
                if !self.catalog.status(GroupId::Preauth).ready {
                    self.init_service_catalogs().await?;
                } else {
                    self.collect_postauth(false).await?;
                }
                // Initialization may skip or swallow the postauth fetch.
                return self.catalog.wait_for_catalog(group, Duration::ZERO).await;
            }
        }
        self.catalog
            .wait_for_catalog(group, timeout.unwrap_or(DEFAULT_CATALOG_TIMEOUT))
            .await
    }

    /// Resolves `name`, waiting up to `timeout` for the authentication
    /// catalogs to supply it. `url`, when given, may also identify the
    /// service or serve as the answer once the catalog is complete.
    pub async fn wait_for_service(
        &self,
        name: &str,
        timeout: Option<Duration>,
        url: Option<&Url>,
    ) -> Result<Url, Error> {
        let config = self.config.load();
        let not_found = || Error::ServiceNotFound {
            name: name.to_string(),
        };

        if config.services_not_need_validation.iter().any(|s| s == name) {
            return self.catalog.service_link(name).ok_or_else(not_found);
        }
        if let Some(found) = self.priority_url(name, url) {
            return Ok(found);
        }
        if self.catalog.is_ready() {
            return url.cloned().ok_or_else(not_found);
        }

        let timeout = timeout.unwrap_or_else(|| config.wait_timeout());
        let mut waits: FuturesUnordered<_> = [GroupId::Preauth, GroupId::Signin, GroupId::Postauth]
            .into_iter()
            .map(|group| self.catalog.wait_for_catalog(group, timeout))
            .collect();
        while let Some(waited) = waits.next().await {
            if waited.is_ok() {
                if let Some(found) = self.priority_url(name, url) {
                    return Ok(found);
                }
            }
        }

        #[cfg(feature = "log")]
        tracing::warn!(service = name, "Service not found after waiting");
        Err(not_found())
    }

    fn priority_url(&self, name: &str, url: Option<&Url>) -> Option<Url> {
        self.catalog.get(name, true, None).or_else(|| {
            url.and_then(|url| self.catalog.service_urls_for(url))
                .map(|service| service.priority_url)
        })
    }

    /// Cluster id of the host behind `url`.
    pub fn get_cluster_id(&self, url: &Url) -> Option<String> {
        self.catalog.find_cluster_id(url)
    }

    /// Service hosted in `cluster_id`; see
    /// [`ServiceCatalog::find_service_from_cluster_id`].
    pub fn get_service_from_cluster_id(
        &self,
        cluster_id: &str,
        priority_host: bool,
        group: Option<GroupId>,
    ) -> Option<ServiceMatch> {
        self.catalog
            .find_service_from_cluster_id(cluster_id, priority_host, group)
    }

    /// URL of the cluster-resolution service in `cluster`, `us` when `None`,
    /// pointing at a host of that cluster when one is available. A bare
    /// cluster is qualified with [`DEFAULT_CLUSTER_SERVICE`].
    pub fn get_service_url_from_cluster_id(&self, cluster: Option<&str>) -> Result<Url, Error> {
        let cluster = cluster.unwrap_or("us");
        let mut cluster_id = if cluster == "us" {
            format!("{DEFAULT_CLUSTER}:{DEFAULT_CLUSTER_SERVICE}")
        } else {
            cluster.to_string()
        };
        if cluster_id.split(':').count() < 4 {
            cluster_id = format!("{cluster}:{DEFAULT_CLUSTER_SERVICE}");
        }

        self.catalog
            .find_service_from_cluster_id(&cluster_id, true, None)
            .map(|service| service.url)
            .ok_or_else(|| Error::NoClusterService {
                cluster: cluster.to_string(),
            })
    }

    /// Name, priority URL and default URL of the service `url` addresses.
    pub fn get_service_from_url(&self, url: &Url) -> Option<ServiceUrls> {
        self.catalog.service_urls_for(url)
    }

    /// Whether `url` addresses a known service.
    pub fn is_service_url(&self, url: &Url) -> bool {
        self.catalog.find_service_url_from_url(url).is_some()
    }

    /// Whether `url`'s host is allowed.
    pub fn is_allowed_domain_url(&self, url: &Url) -> bool {
        self.catalog.find_allowed_domain(url)
    }

    /// Rewrites `url` from its service's default URL onto the priority host.
    pub fn convert_url_to_priority_host_url(&self, url: &Url) -> Result<Url, Error> {
        let service = self
            .get_service_from_url(url)
            .ok_or_else(|| Error::NoServiceForUrl {
                url: url.to_string(),
            })?;
        let converted = url.as_str().replacen(
            service.default_url.as_str(),
            service.priority_url.as_str(),
            1,
        );
        Ok(Url::parse(&converted)?)
    }

    /// Swaps `url`'s host for the first host of its raw catalog bucket.
    pub fn replace_host_from_hostmap(&self, url: &Url) -> Url {
        self.catalog.replace_host_from_hostmap(url)
    }

    /// Performs an operation against `name`'s hosts, producing the first
    /// successful result or the last error once every candidate failed.
    ///
    /// Each failing host is marked failed before the next candidate is
    /// tried, so later resolutions skip it too.
    pub async fn execute<T, E, Fut>(&self, name: &str, func: impl FnMut(Url) -> Fut) -> Result<T, E>
    where
        E: std::error::Error + From<Error>,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut func = func;
        let mut candidate = self
            .resolve(name, true, None)
            .ok_or_else(|| Error::ServiceNotFound {
                name: name.to_string(),
            })?;
        let mut tried = HashSet::new();

        loop {
            tried.insert(candidate.clone());
            match func(candidate.clone()).await {
                Ok(res) => {
                    #[cfg(feature = "log")]
                    tracing::info!(URI = %candidate, "execution attempt succeeded");
                    return Ok(res);
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    tracing::info!(URI = %candidate, error = %err, "execution attempt failed");
                    let next = self.mark_failed(&candidate, false);
                    if tried.contains(&next) {
                        return Err(err);
                    }
                    candidate = next;
                }
            }
        }
    }
}
