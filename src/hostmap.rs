//! Raw discovery responses and their normalization into service entries.

use indexmap::IndexMap;
use serde::Deserialize;
use url::Url;

use crate::{
    host::{host_with_port, service_id},
    HostEntry, ServiceEntry,
};

/// A discovery response in `hostmap` format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHostmap {
    /// Service name to advertised URL.
    #[serde(default)]
    pub service_links: IndexMap<String, String>,
    /// Host authority to the catalog entries served from it.
    #[serde(default)]
    pub host_catalog: IndexMap<String, Vec<RawHost>>,
}

/// One entry of a host catalog bucket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawHost {
    /// Cluster id of the form `<a>:<b>:<c>:<service id>`.
    pub id: String,
    /// Host authority.
    pub host: String,
}

impl RawHost {
    /// Creates a raw host entry.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
        }
    }
}

impl RawHostmap {
    /// Parses a JSON discovery response body.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Normalizes the response into service entries, one per parsable
    /// service link.
    ///
    /// Hosts from the bucket the link points at become home-cluster hosts;
    /// hosts from other buckets carrying the same service id follow as
    /// non-home hosts. Bucket and scan order are preserved.
    pub fn normalize(&self) -> Vec<ServiceEntry> {
        self.service_links
            .iter()
            .filter_map(|(name, link)| self.normalize_link(name, link))
            .collect()
    }

    fn normalize_link(&self, name: &str, link: &str) -> Option<ServiceEntry> {
        let default_url = match Url::parse(link) {
            Ok(url) => url,
            Err(e) => {
                #[cfg(feature = "log")]
                tracing::trace!(%e, service = name, link, "Skipping unparsable service link");
                return None;
            }
        };
        let Some(authority) = host_with_port(&default_url) else {
            #[cfg(feature = "log")]
            tracing::trace!(service = name, link, "Skipping service link without a host");
            return None;
        };

        let bucket = match self.host_catalog.get(&authority) {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => return Some(ServiceEntry::new(name, default_url, Vec::new())),
        };

        let home_id = service_id(&bucket[0].id);
        let mut hosts: Vec<HostEntry> = bucket
            .iter()
            .filter(|raw| service_id(&raw.id) == home_id)
            .map(|raw| HostEntry::new(&raw.host, &raw.id, true))
            .collect();

        // Without a service id there is nothing to match other buckets on.
        if let Some(home_id) = home_id {
            let alternates = self
                .host_catalog
                .iter()
                .filter(|(key, _)| **key != authority)
                .flat_map(|(_, entries)| entries)
                .filter(|raw| service_id(&raw.id) == Some(home_id))
                .map(|raw| HostEntry::new(&raw.host, &raw.id, false));
            hosts.extend(alternates);
        }

        Some(ServiceEntry::new(name, default_url, hosts))
    }
}

/// Builds host-less entries from a name to URL mapping, skipping URLs that
/// do not parse.
pub(crate) fn entries_from_links<'a>(
    links: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Vec<ServiceEntry> {
    links
        .into_iter()
        .filter_map(|(name, link)| match Url::parse(link) {
            Ok(url) => Some(ServiceEntry::new(name.as_str(), url, Vec::new())),
            Err(e) => {
                #[cfg(feature = "log")]
                tracing::trace!(%e, service = %name, "Skipping unparsable configured service");
                None
            }
        })
        .collect()
}
