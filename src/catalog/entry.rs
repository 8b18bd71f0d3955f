//! A single service and its hosts.

use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwap;
use url::Url;

use crate::{host::host_with_port, HostEntry};

/// One logical service: its default endpoint plus alternate hosts in
/// priority order.
#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    default_url: Url,
    default_host: String,
    hosts: Vec<HostEntry>,
    failed_hosts: ArcSwap<HashSet<String>>,
}

impl ServiceEntry {
    /// Creates an entry. `default_host` is derived here, once.
    pub fn new(name: impl Into<String>, default_url: Url, hosts: Vec<HostEntry>) -> Self {
        let default_host = host_with_port(&default_url).unwrap_or_default();
        Self {
            name: name.into(),
            default_url,
            default_host,
            hosts,
            failed_hosts: Default::default(),
        }
    }

    /// Logical service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL advertised for the service.
    pub fn default_url(&self) -> &Url {
        &self.default_url
    }

    /// Authority of the default URL.
    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Hosts in priority order, home cluster first.
    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    /// Whether `host` has been marked failed.
    pub fn is_failed(&self, host: &str) -> bool {
        self.failed_hosts.load().contains(host)
    }

    /// Resolves the service URL, either the default or the best unfailed
    /// priority host.
    pub fn get(&self, priority_host: bool) -> Url {
        if priority_host {
            self.priority_url()
        } else {
            self.default_url.clone()
        }
    }

    /// URL of the highest-priority host that has not failed, falling back to
    /// the default URL once every host has failed.
    pub fn priority_url(&self) -> Url {
        let failed = self.failed_hosts.load();
        self.hosts
            .iter()
            .filter(|entry| !failed.contains(&entry.host))
            .find_map(|entry| entry.url_for(&self.default_url).ok())
            .unwrap_or_else(|| self.default_url.clone())
    }

    /// URL of the service in `cluster_id`: its first unfailed host there,
    /// or the default URL when none is left or `priority_host` is unset.
    pub(crate) fn cluster_url(&self, cluster_id: &str, priority_host: bool) -> Url {
        if !priority_host {
            return self.default_url.clone();
        }
        let failed = self.failed_hosts.load();
        self.hosts
            .iter()
            .filter(|entry| entry.cluster_id == cluster_id && !failed.contains(&entry.host))
            .find_map(|entry| entry.url_for(&self.default_url).ok())
            .unwrap_or_else(|| self.default_url.clone())
    }

    /// Whether `url` names one of this entry's hosts.
    pub(crate) fn lists_host(&self, url: &Url) -> bool {
        self.hosts.iter().any(|entry| entry.matches(url))
    }

    /// Marks the host `url` points at as failed. Returns `false` when the
    /// URL belongs to none of this entry's hosts.
    pub(crate) fn fail_host(&self, url: &Url) -> bool {
        let Some(entry) = self.hosts.iter().find(|entry| entry.matches(url)) else {
            return false;
        };
        self.failed_hosts.rcu(|failed| {
            let mut failed = HashSet::clone(failed);
            failed.insert(entry.host.clone());
            Arc::new(failed)
        });
        true
    }

    /// Whether `url` addresses this service, either through its default URL
    /// or through one of its hosts under the default path.
    pub(crate) fn serves(&self, url: &Url) -> bool {
        if url.as_str().starts_with(self.default_url.as_str()) {
            return true;
        }
        url.path().starts_with(self.default_url.path())
            && self.hosts.iter().any(|entry| entry.matches(url))
    }

    /// Cluster id for `url` when it names one of this entry's hosts.
    pub(crate) fn cluster_for(&self, url: &Url) -> Option<&str> {
        if let Some(entry) = self.hosts.iter().find(|entry| entry.matches(url)) {
            return Some(&entry.cluster_id);
        }
        if host_with_port(url).as_deref() == Some(self.default_host.as_str()) {
            return self
                .hosts
                .iter()
                .find(|entry| entry.home_cluster)
                .or_else(|| self.hosts.first())
                .map(|entry| entry.cluster_id.as_str());
        }
        None
    }
}
