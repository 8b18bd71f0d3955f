//! Remote catalog refreshes with single-flight deduplication per group.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::{header::AUTHORIZATION, HeaderMap, HeaderValue};

use crate::{
    transport::{CatalogRequest, CatalogTransport, DISCOVERY_SERVICE},
    CatalogQuery, Error, GroupId, ServiceCatalog,
};

type PendingRefresh = Shared<BoxFuture<'static, Result<(), Error>>>;
type InFlight = Arc<Mutex<HashMap<GroupId, PendingRefresh>>>;

/// Fetches remote catalogs and merges them into a [`ServiceCatalog`].
///
/// At most one fetch per group is outstanding. Callers that ask for a group
/// while its fetch is in flight join it and observe the same outcome.
pub struct CatalogRefresher<Transport> {
    catalog: Arc<ServiceCatalog>,
    transport: Arc<Transport>,
    in_flight: InFlight,
}

impl<Transport: fmt::Debug> fmt::Debug for CatalogRefresher<Transport> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogRefresher")
            .field("catalog", &self.catalog)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl<Transport: CatalogTransport + 'static> CatalogRefresher<Transport> {
    /// Creates a refresher writing into `catalog`.
    pub fn new(catalog: Arc<ServiceCatalog>, transport: Transport) -> Self {
        Self {
            catalog,
            transport: Arc::new(transport),
            in_flight: Default::default(),
        }
    }

    /// The transport catalogs are fetched with.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Fetches `group`'s catalog and merges it, or joins the fetch already in
    /// flight for `group`.
    ///
    /// `preauth` and `signin` require a query; emails sent for them are
    /// hashed first. A transport failure is returned to every joined caller
    /// and leaves the group's existing data and readiness untouched.
    pub async fn refresh(
        &self,
        group: GroupId,
        query: Option<&CatalogQuery>,
        token: Option<&str>,
        force_refresh: bool,
    ) -> Result<(), Error> {
        let pending = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match in_flight.get(&group) {
                Some(pending) => {
                    #[cfg(feature = "log")]
                    tracing::debug!(%group, "Joining catalog refresh already in flight");
                    pending.clone()
                }
                None => {
                    // Validate before marking the group, so a bad query never
                    // leaves it collecting.
                    let request = self.request(group, query, token, force_refresh)?;

                    #[cfg(feature = "log")]
                    tracing::debug!(%group, resource = request.resource, "Refreshing catalog");

                    self.catalog.set_collecting(group, true);
                    // The fetch runs on its own task so that it completes even
                    // when every caller stops polling.
                    let task = tokio::spawn(Self::fetch_and_merge(
                        self.catalog.clone(),
                        self.transport.clone(),
                        self.in_flight.clone(),
                        group,
                        request,
                    ));
                    let catalog = self.catalog.clone();
                    let in_flight_map = self.in_flight.clone();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            catalog.set_collecting(group, false);
                            in_flight_map
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .remove(&group);
                            Err(Error::transport(e))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(group, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn fetch_and_merge(
        catalog: Arc<ServiceCatalog>,
        transport: Arc<Transport>,
        in_flight: InFlight,
        group: GroupId,
        request: CatalogRequest,
    ) -> Result<(), Error> {
        let result = match transport.fetch(request).await {
            Ok(hostmap) => {
                catalog.merge_hostmap(group, &hostmap);
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "log")]
                tracing::warn!(%group, error = %e, "Catalog refresh failed");
                Err(Error::transport(e))
            }
        };

        catalog.set_collecting(group, false);
        in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&group);
        result
    }

    /// Shapes the transport request for `group`.
    fn request(
        &self,
        group: GroupId,
        query: Option<&CatalogQuery>,
        token: Option<&str>,
        force_refresh: bool,
    ) -> Result<CatalogRequest, Error> {
        let resource = group.resource().ok_or_else(|| {
            Error::InvalidQuery(format!("the {group} catalog is not collected remotely"))
        })?;

        let mut params = Vec::new();
        match (group, query) {
            (GroupId::Preauth | GroupId::Signin, None) => {
                return Err(Error::InvalidQuery(
                    "a query param of email, emailhash, userId, orgId, or mode is required"
                        .to_string(),
                ))
            }
            (_, Some(query)) => {
                let (key, value) = query.shape_for(group);
                params.push((key.to_string(), value));
            }
            (_, None) => {}
        }
        params.push(("format".to_string(), "hostmap".to_string()));
        if force_refresh {
            params.push(("timestamp".to_string(), cache_buster()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(token).map_err(Error::credentials)?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(CatalogRequest {
            service: DISCOVERY_SERVICE,
            base: self.catalog.get(DISCOVERY_SERVICE, true, None),
            resource,
            query: params,
            headers,
        })
    }
}

fn cache_buster() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
        .to_string()
}
