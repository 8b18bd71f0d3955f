//! Host entries.

use url::Url;

/// A single network endpoint offering a service, tagged with the cluster it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Host name, optionally carrying a `:port` suffix.
    pub host: String,
    /// Opaque cluster identifier, e.g. `urn:TEAM:us-east-2_a:idbroker`.
    pub cluster_id: String,
    /// Whether this host is part of the service's home cluster.
    pub home_cluster: bool,
}

impl HostEntry {
    /// Creates a host entry.
    pub fn new(host: impl Into<String>, cluster_id: impl Into<String>, home_cluster: bool) -> Self {
        Self {
            host: host.into(),
            cluster_id: cluster_id.into(),
            home_cluster,
        }
    }

    /// Builds the URL for this host by substituting it into `base`, keeping
    /// the base URL's scheme, path and query.
    pub fn url_for(&self, base: &Url) -> Result<Url, url::ParseError> {
        // Setting the pieces individually rather than formatting a string
        // keeps a host like `foo.com/bar` from smuggling in a path.
        let mut url = base.clone();
        let (name, port) = split_port(&self.host);
        url.set_host(Some(name))?;
        // A host without a port keeps the base URL's port.
        if let Some(port) = port {
            url.set_port(Some(port))
                .map_err(|_| url::ParseError::SetHostOnCannotBeABaseUrl)?;
        }
        Ok(url)
    }

    /// Whether `url` points at this host.
    pub fn matches(&self, url: &Url) -> bool {
        host_with_port(url).is_some_and(|candidate| candidate == self.host)
    }
}

/// Returns the `host[:port]` authority of a URL, the way hosts are keyed in a
/// discovery response.
pub(crate) fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Extracts the service id (fourth colon-delimited segment) of a cluster id.
pub(crate) fn service_id(cluster_id: &str) -> Option<&str> {
    cluster_id.split(':').nth(3)
}

fn split_port(host: &str) -> (&str, Option<u16>) {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        _ => (host, None),
    }
}
