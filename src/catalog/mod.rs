//! The service catalog: every known service, partitioned into groups.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use url::{Host, Url};

use crate::{
    host::host_with_port,
    hostmap::{entries_from_links, RawHost},
    Error, HostEntry, RawHostmap,
};

mod entry;
pub use entry::ServiceEntry;

mod group;
pub use group::{GroupId, GroupStatus};
use group::{ServiceGroup, Services};

/// Budget used when waiting on a group without an explicit timeout.
pub const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Order in which groups are searched when matching a full URL back to its
/// service.
const URL_MATCH_ORDER: [GroupId; 5] = [
    GroupId::Discovery,
    GroupId::Preauth,
    GroupId::Signin,
    GroupId::Postauth,
    GroupId::Override,
];

/// A service located by its cluster id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMatch {
    /// Logical service name.
    pub name: String,
    /// Resolved URL of the service.
    pub url: Url,
}

/// Resolved URLs of a service matched from one of its URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    /// Logical service name.
    pub name: String,
    /// URL of the best unfailed host.
    pub priority_url: Url,
    /// Advertised default URL.
    pub default_url: Url,
}

/// The catalog of service endpoints.
///
/// Each group is held as an atomically swapped snapshot, so readers never
/// take a lock and never observe a half-replaced group. Writers to the same
/// group are serialized. Waiting for a group to become ready suspends only
/// the waiting task.
#[derive(Debug)]
pub struct ServiceCatalog {
    groups: [ServiceGroup; 5],
    allowed_domains: ArcSwap<Vec<Host>>,
    cluster_index: ArcSwap<HashMap<String, String>>,
    index_write: Mutex<()>,
    service_links: ArcSwap<IndexMap<String, String>>,
    host_catalog: ArcSwap<IndexMap<String, Vec<RawHost>>>,
    ready: AtomicBool,
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceCatalog {
    /// Creates an empty catalog with every group idle.
    pub fn new() -> Self {
        Self {
            groups: std::array::from_fn(|_| ServiceGroup::new()),
            allowed_domains: Default::default(),
            cluster_index: Default::default(),
            index_write: Mutex::new(()),
            service_links: Default::default(),
            host_catalog: Default::default(),
            ready: AtomicBool::new(false),
        }
    }

    fn group(&self, id: GroupId) -> &ServiceGroup {
        let idx = match id {
            GroupId::Discovery => 0,
            GroupId::Override => 1,
            GroupId::Preauth => 2,
            GroupId::Signin => 3,
            GroupId::Postauth => 4,
        };
        &self.groups[idx]
    }

    fn searched(group: Option<GroupId>) -> Vec<GroupId> {
        match group {
            Some(group) => vec![group],
            None => GroupId::PRECEDENCE.to_vec(),
        }
    }

    /// Refresh status of a group.
    pub fn status(&self, group: GroupId) -> GroupStatus {
        self.group(group).status()
    }

    pub(crate) fn set_collecting(&self, group: GroupId, collecting: bool) {
        self.group(group).set_collecting(collecting);
    }

    /// Whether initial catalog collection for the session has finished.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Finds the entry for `name`, searching `group` only or else every
    /// group in precedence order.
    pub fn entry(&self, name: &str, group: Option<GroupId>) -> Option<Arc<ServiceEntry>> {
        Self::searched(group)
            .into_iter()
            .find_map(|id| self.group(id).services.load().get(name).cloned())
    }

    /// Resolves `name` to a URL. `None` when no searched group knows it.
    pub fn get(&self, name: &str, priority_host: bool, group: Option<GroupId>) -> Option<Url> {
        self.entry(name, group).map(|entry| entry.get(priority_host))
    }

    /// Snapshot of every known service. Higher-precedence groups win when a
    /// name appears in several.
    pub fn list(&self, priority_host: bool, group: Option<GroupId>) -> HashMap<String, Url> {
        let mut urls = HashMap::new();
        for id in Self::searched(group) {
            for (name, entry) in self.group(id).services.load().iter() {
                urls.entry(name.clone())
                    .or_insert_with(|| entry.get(priority_host));
            }
        }
        urls
    }

    /// Replaces a group's services wholesale and marks the group ready.
    /// Failed-host marks of the previous entries are discarded with them.
    pub fn update_service_urls(&self, group: GroupId, entries: Vec<ServiceEntry>) {
        let services: Services = entries
            .into_iter()
            .map(|entry| (entry.name().to_string(), Arc::new(entry)))
            .collect();

        #[cfg(feature = "log")]
        tracing::info!(%group, services = services.len(), "Updating service catalog group");

        self.group(group).replace(services);
        self.rebuild_cluster_index();
    }

    /// Normalizes a raw discovery response into `group`, also recording its
    /// raw links and host buckets.
    pub fn merge_hostmap(&self, group: GroupId, hostmap: &RawHostmap) {
        self.service_links.rcu(|links| {
            let mut links = IndexMap::clone(links);
            links.extend(hostmap.service_links.clone());
            links
        });
        self.host_catalog.rcu(|catalog| {
            let mut catalog = IndexMap::clone(catalog);
            catalog.extend(hostmap.host_catalog.clone());
            catalog
        });
        self.update_service_urls(group, hostmap.normalize());
    }

    /// Seeds a static group from a name to URL mapping.
    pub(crate) fn update_from_links<'a>(
        &self,
        group: GroupId,
        links: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) {
        self.update_service_urls(group, entries_from_links(links));
    }

    fn rebuild_cluster_index(&self) {
        let _guard = self
            .index_write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut index = HashMap::new();
        for id in GroupId::PRECEDENCE {
            for entry in self.group(id).services.load().values() {
                for host in entry.hosts() {
                    index
                        .entry(host.host.clone())
                        .or_insert_with(|| host.cluster_id.clone());
                }
            }
        }
        self.cluster_index.store(Arc::new(index));
    }

    /// Marks the host behind `url` as failed and returns the URL to use
    /// instead. An unknown URL is returned unchanged.
    pub fn mark_failed_url(&self, url: &Url, no_priority_hosts: bool) -> Url {
        // A host can back several services; only the one whose path matches
        // is failed, falling back to the first that lists the host.
        let mut found: Option<Arc<ServiceEntry>> = None;
        'groups: for id in GroupId::PRECEDENCE {
            for entry in self.group(id).services.load().values() {
                if !entry.lists_host(url) {
                    continue;
                }
                if entry.serves(url) {
                    found = Some(entry.clone());
                    break 'groups;
                }
                found.get_or_insert_with(|| entry.clone());
            }
        }

        let Some(entry) = found else {
            return url.clone();
        };
        entry.fail_host(url);
        let next = entry.get(!no_priority_hosts);
        #[cfg(feature = "log")]
        tracing::warn!(
            failed = %url,
            next = %next,
            service = entry.name(),
            "Marked service host as failed"
        );
        next
    }

    /// Cluster id of the host `url` points at.
    pub fn find_cluster_id(&self, url: &Url) -> Option<String> {
        let authority = host_with_port(url)?;
        if let Some(cluster) = self.cluster_index.load().get(&authority) {
            return Some(cluster.clone());
        }
        GroupId::PRECEDENCE.into_iter().find_map(|id| {
            self.group(id)
                .services
                .load()
                .values()
                .find_map(|entry| entry.cluster_for(url).map(str::to_string))
        })
    }

    /// Finds the service one of whose hosts belongs to `cluster_id`. With
    /// `priority_host` the URL points at that cluster's best unfailed host.
    pub fn find_service_from_cluster_id(
        &self,
        cluster_id: &str,
        priority_host: bool,
        group: Option<GroupId>,
    ) -> Option<ServiceMatch> {
        Self::searched(group).into_iter().find_map(|id| {
            self.group(id)
                .services
                .load()
                .values()
                .find(|entry| entry.hosts().iter().any(|h| h.cluster_id == cluster_id))
                .map(|entry| ServiceMatch {
                    name: entry.name().to_string(),
                    url: entry.cluster_url(cluster_id, priority_host),
                })
        })
    }

    /// Finds the service that `url` addresses.
    pub fn find_service_url_from_url(&self, url: &Url) -> Option<Arc<ServiceEntry>> {
        URL_MATCH_ORDER.into_iter().find_map(|id| {
            self.group(id)
                .services
                .load()
                .values()
                .find(|entry| entry.serves(url))
                .cloned()
        })
    }

    /// Like [`find_service_url_from_url`](Self::find_service_url_from_url),
    /// resolved to the service's priority and default URLs.
    pub fn service_urls_for(&self, url: &Url) -> Option<ServiceUrls> {
        self.find_service_url_from_url(url).map(|entry| ServiceUrls {
            name: entry.name().to_string(),
            priority_url: entry.get(true),
            default_url: entry.get(false),
        })
    }

    /// Replaces the set of allowed host suffixes. Unparsable entries are
    /// dropped.
    pub fn set_allowed_domains<S: AsRef<str>>(&self, domains: impl IntoIterator<Item = S>) {
        let hosts = domains
            .into_iter()
            .filter_map(|domain| match Host::parse(domain.as_ref()) {
                Ok(host) => Some(host),
                Err(e) => {
                    #[cfg(feature = "log")]
                    tracing::trace!(%e, domain = domain.as_ref(), "Ignoring unparsable allowed domain");
                    None
                }
            })
            .collect();
        self.allowed_domains.store(Arc::new(hosts));
    }

    /// The allowed host suffixes.
    pub fn allowed_domains(&self) -> Vec<String> {
        self.allowed_domains
            .load()
            .iter()
            .map(|host| host.to_string())
            .collect()
    }

    /// Whether `url`'s host is allowed: an exact match for IP hosts, or a
    /// domain equal to or under an allowed domain.
    pub fn find_allowed_domain(&self, url: &Url) -> bool {
        let allowed = self.allowed_domains.load();
        match url.host() {
            None => false,
            Some(Host::Domain(candidate)) => allowed.iter().any(|allowed| match allowed {
                Host::Domain(domain) => {
                    candidate == domain
                        || candidate
                            .strip_suffix(domain.as_str())
                            .is_some_and(|rest| rest.ends_with('.'))
                }
                _ => false,
            }),
            Some(Host::Ipv4(ip)) => allowed.contains(&Host::Ipv4(ip)),
            Some(Host::Ipv6(ip)) => allowed.contains(&Host::Ipv6(ip)),
        }
    }

    /// Raw link most recently advertised for `name` by any discovery
    /// response.
    pub fn service_link(&self, name: &str) -> Option<Url> {
        let links = self.service_links.load();
        Url::parse(links.get(name)?).ok()
    }

    /// Swaps the host of `url` for the first host of the raw bucket it
    /// belongs to. `url` is returned unchanged when no bucket matches.
    pub fn replace_host_from_hostmap(&self, url: &Url) -> Url {
        let Some(authority) = host_with_port(url) else {
            return url.clone();
        };
        let catalog = self.host_catalog.load();
        catalog
            .get(&authority)
            .and_then(|bucket| bucket.first())
            .and_then(|first| HostEntry::new(&first.host, &first.id, true).url_for(url).ok())
            .unwrap_or_else(|| url.clone())
    }

    /// Waits until `group` is ready, for at most `timeout`. Every waiter is
    /// released by the same ready transition. Timing out does not affect
    /// any refresh in progress.
    pub async fn wait_for_catalog(&self, group: GroupId, timeout: Duration) -> Result<(), Error> {
        let mut status = self.group(group).subscribe();
        if status.borrow().ready {
            return Ok(());
        }
        let waited = match tokio::time::timeout(timeout, status.wait_for(|status| status.ready))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(Error::CatalogTimeout { group, timeout }),
        };
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn idbroker_hostmap() -> RawHostmap {
        RawHostmap {
            service_links: [(
                "idbroker".to_string(),
                "https://a.example/idb".to_string(),
            )]
            .into_iter()
            .collect(),
            host_catalog: [(
                "a.example".to_string(),
                vec![RawHost::new("ciscospark:us:1:idbroker", "a.example")],
            )]
            .into_iter()
            .collect(),
        }
    }

    fn failover_catalog() -> ServiceCatalog {
        let catalog = ServiceCatalog::new();
        catalog.update_service_urls(
            GroupId::Postauth,
            vec![ServiceEntry::new(
                "hydra",
                url("https://h1.example/v1/"),
                vec![
                    HostEntry::new("h1.example", "ciscospark:us:1:hydra", true),
                    HostEntry::new("h2.example", "ciscospark:us:1:hydra", true),
                    HostEntry::new("h3.example", "ciscospark:eu:2:hydra", false),
                ],
            )],
        );
        catalog
    }

    #[test]
    fn single_host_scenario() {
        let catalog = ServiceCatalog::new();
        catalog.merge_hostmap(GroupId::Postauth, &idbroker_hostmap());
        assert_eq!(
            catalog.get("idbroker", false, None).unwrap().as_str(),
            "https://a.example/idb"
        );
        assert_eq!(
            catalog.get("idbroker", true, None).unwrap().as_str(),
            "https://a.example/idb"
        );
        assert!(catalog.status(GroupId::Postauth).ready);
    }

    #[test]
    fn absent_service_is_none() {
        let catalog = ServiceCatalog::new();
        assert_eq!(catalog.get("missing", true, None), None);
        assert!(catalog.list(false, None).is_empty());
    }

    #[test]
    fn override_wins_precedence() {
        let catalog = ServiceCatalog::new();
        catalog.update_service_urls(
            GroupId::Postauth,
            vec![ServiceEntry::new("foo", url("https://post.example/"), vec![])],
        );
        catalog.update_service_urls(
            GroupId::Override,
            vec![ServiceEntry::new("foo", url("https://override.example/"), vec![])],
        );
        assert_eq!(
            catalog.get("foo", false, None).unwrap().as_str(),
            "https://override.example/"
        );
        assert_eq!(
            catalog.get("foo", false, Some(GroupId::Postauth)).unwrap().as_str(),
            "https://post.example/"
        );
        assert_eq!(
            catalog.list(false, None)["foo"].as_str(),
            "https://override.example/"
        );
    }

    #[test]
    fn list_merges_groups() {
        let catalog = ServiceCatalog::new();
        catalog.update_service_urls(
            GroupId::Preauth,
            vec![
                ServiceEntry::new("a", url("https://pre.example/a"), vec![]),
                ServiceEntry::new("b", url("https://pre.example/b"), vec![]),
            ],
        );
        catalog.update_service_urls(
            GroupId::Postauth,
            vec![ServiceEntry::new("b", url("https://post.example/b"), vec![])],
        );
        let urls = catalog.list(false, None);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls["a"].as_str(), "https://pre.example/a");
        assert_eq!(urls["b"].as_str(), "https://post.example/b");
        assert_eq!(catalog.list(false, Some(GroupId::Preauth))["b"].as_str(), "https://pre.example/b");
    }

    #[test]
    fn update_replaces_whole_group() {
        let catalog = ServiceCatalog::new();
        catalog.update_service_urls(
            GroupId::Signin,
            vec![ServiceEntry::new("a", url("https://s.example/a"), vec![])],
        );
        catalog.update_service_urls(
            GroupId::Signin,
            vec![ServiceEntry::new("b", url("https://s.example/b"), vec![])],
        );
        assert_eq!(catalog.get("a", false, None), None);
        assert!(catalog.get("b", false, None).is_some());
    }

    #[test]
    fn failover_walks_priority_hosts() {
        let catalog = failover_catalog();
        let next = catalog.mark_failed_url(&url("https://h1.example/v1/rooms"), false);
        assert_eq!(next.as_str(), "https://h2.example/v1/");
        let next = catalog.mark_failed_url(&next, false);
        assert_eq!(next.as_str(), "https://h3.example/v1/");
        let next = catalog.mark_failed_url(&next, false);
        assert_eq!(next.as_str(), "https://h1.example/v1/");
    }

    #[test]
    fn failover_is_idempotent() {
        let once = failover_catalog();
        let twice = failover_catalog();
        let failed = url("https://h1.example/v1/");
        let expected = once.mark_failed_url(&failed, false);
        twice.mark_failed_url(&failed, false);
        assert_eq!(twice.mark_failed_url(&failed, false), expected);
    }

    #[test]
    fn failover_without_priority_hosts_returns_default() {
        let catalog = failover_catalog();
        let next = catalog.mark_failed_url(&url("https://h1.example/v1/"), true);
        assert_eq!(next.as_str(), "https://h1.example/v1/");
        assert_eq!(
            catalog.get("hydra", true, None).unwrap().as_str(),
            "https://h2.example/v1/"
        );
    }

    #[test]
    fn unknown_url_is_returned_unchanged() {
        let catalog = failover_catalog();
        let unknown = url("https://nowhere.example/x");
        assert_eq!(catalog.mark_failed_url(&unknown, false), unknown);
    }

    #[test]
    fn fresh_update_clears_failed_hosts() {
        let catalog = failover_catalog();
        catalog.mark_failed_url(&url("https://h1.example/v1/"), false);
        catalog.merge_hostmap(
            GroupId::Postauth,
            &RawHostmap {
                service_links: [("hydra".to_string(), "https://h1.example/v1/".to_string())]
                    .into_iter()
                    .collect(),
                host_catalog: [(
                    "h1.example".to_string(),
                    vec![RawHost::new("ciscospark:us:1:hydra", "h1.example")],
                )]
                .into_iter()
                .collect(),
            },
        );
        assert_eq!(
            catalog.get("hydra", true, None).unwrap().as_str(),
            "https://h1.example/v1/"
        );
    }

    #[test]
    fn cluster_lookups() {
        let catalog = failover_catalog();
        assert_eq!(
            catalog.find_cluster_id(&url("https://h3.example/v1/")).as_deref(),
            Some("ciscospark:eu:2:hydra")
        );
        assert_eq!(catalog.find_cluster_id(&url("https://zz.example/")), None);

        let found = catalog
            .find_service_from_cluster_id("ciscospark:eu:2:hydra", false, None)
            .unwrap();
        assert_eq!(found.name, "hydra");
        assert_eq!(found.url.as_str(), "https://h1.example/v1/");
        assert_eq!(
            catalog.find_service_from_cluster_id("ciscospark:eu:2:hydra", false, Some(GroupId::Preauth)),
            None
        );
    }

    #[test]
    fn cluster_lookup_prefers_hosts_in_that_cluster() {
        let catalog = failover_catalog();
        catalog.update_service_urls(
            GroupId::Preauth,
            vec![ServiceEntry::new(
                "hydra",
                url("https://p1.example/v1/"),
                vec![HostEntry::new("p1.example", "ciscospark:us:1:hydra", true)],
            )],
        );

        let found = catalog
            .find_service_from_cluster_id("ciscospark:eu:2:hydra", true, None)
            .unwrap();
        assert_eq!(found.url.as_str(), "https://h3.example/v1/");

        catalog.mark_failed_url(&url("https://h3.example/v1/"), false);
        let found = catalog
            .find_service_from_cluster_id("ciscospark:eu:2:hydra", true, None)
            .unwrap();
        assert_eq!(found.url.as_str(), "https://h1.example/v1/");

        let found = catalog
            .find_service_from_cluster_id("ciscospark:us:1:hydra", true, Some(GroupId::Preauth))
            .unwrap();
        assert_eq!(found.url.as_str(), "https://p1.example/v1/");
    }

    #[test]
    fn failing_a_shared_host_only_affects_its_service() {
        let catalog = failover_catalog();
        catalog.update_service_urls(
            GroupId::Postauth,
            vec![
                ServiceEntry::new(
                    "hydra",
                    url("https://h1.example/v1/"),
                    vec![
                        HostEntry::new("h1.example", "ciscospark:us:1:hydra", true),
                        HostEntry::new("h2.example", "ciscospark:us:1:hydra", true),
                    ],
                ),
                ServiceEntry::new(
                    "files",
                    url("https://h1.example/files/"),
                    vec![
                        HostEntry::new("h1.example", "ciscospark:us:1:files", true),
                        HostEntry::new("f2.example", "ciscospark:us:1:files", true),
                    ],
                ),
            ],
        );

        let next = catalog.mark_failed_url(&url("https://h1.example/v1/rooms"), false);
        assert_eq!(next.as_str(), "https://h2.example/v1/");
        assert_eq!(
            catalog.get("files", true, None).unwrap().as_str(),
            "https://h1.example/files/"
        );
        assert!(!catalog.entry("files", None).unwrap().is_failed("h1.example"));
    }

    #[test]
    fn url_to_service_lookup() {
        let catalog = failover_catalog();
        let found = catalog
            .service_urls_for(&url("https://h2.example/v1/rooms"))
            .unwrap();
        assert_eq!(found.name, "hydra");
        assert_eq!(found.priority_url.as_str(), "https://h1.example/v1/");
        assert!(catalog.find_service_url_from_url(&url("https://x.example/")).is_none());
    }

    #[test]
    fn allowed_domains_match_on_label_boundary() {
        let catalog = ServiceCatalog::new();
        catalog.set_allowed_domains(["webex.com", "10.0.0.1"]);
        assert!(catalog.find_allowed_domain(&url("https://webex.com/x")));
        assert!(catalog.find_allowed_domain(&url("https://files.webex.com/x")));
        assert!(!catalog.find_allowed_domain(&url("https://evilwebex.com/x")));
        assert!(catalog.find_allowed_domain(&url("http://10.0.0.1:8080/")));
        assert!(!catalog.find_allowed_domain(&url("http://10.0.0.2/")));
        assert_eq!(catalog.allowed_domains().len(), 2);
    }

    #[test]
    fn raw_hostmap_is_retained() {
        let catalog = ServiceCatalog::new();
        catalog.merge_hostmap(
            GroupId::Preauth,
            &RawHostmap {
                service_links: [("files".to_string(), "https://f.example/files/".to_string())]
                    .into_iter()
                    .collect(),
                host_catalog: [(
                    "f.example".to_string(),
                    vec![RawHost::new("ciscospark:us:1:files", "f1.example")],
                )]
                .into_iter()
                .collect(),
            },
        );
        assert_eq!(
            catalog.service_link("files").unwrap().as_str(),
            "https://f.example/files/"
        );
        assert_eq!(
            catalog
                .replace_host_from_hostmap(&url("https://f.example/files/a?b=c"))
                .as_str(),
            "https://f1.example/files/a?b=c"
        );
        let other = url("https://other.example/");
        assert_eq!(catalog.replace_host_from_hostmap(&other), other);
    }

    #[tokio::test]
    async fn ready_group_returns_immediately() {
        let catalog = ServiceCatalog::new();
        catalog.update_service_urls(GroupId::Discovery, vec![]);
        catalog
            .wait_for_catalog(GroupId::Discovery, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_on_idle_group_fails() {
        let catalog = ServiceCatalog::new();
        let err = catalog
            .wait_for_catalog(GroupId::Postauth, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CatalogTimeout {
                group: GroupId::Postauth,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn readiness_is_broadcast_to_all_waiters() {
        let catalog = Arc::new(ServiceCatalog::new());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let catalog = catalog.clone();
                tokio::spawn(async move {
                    catalog
                        .wait_for_catalog(GroupId::Postauth, Duration::from_secs(10))
                        .await
                })
            })
            .collect();
        tokio::task::yield_now().await;

        catalog.merge_hostmap(GroupId::Postauth, &idbroker_hostmap());
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }
}
