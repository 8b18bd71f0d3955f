#![deny(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

/*!
Rust client for resolving logical service names through a U2C discovery
catalog.

# Introduction

A U2C discovery service answers catalog requests in `hostmap` format: a map
of service names to default URLs, plus a map of hosts to the clusters that
serve them.

```json
{
  "serviceLinks": { "hydra": "https://api.wbx2.com/v1" },
  "hostCatalog": {
    "api.wbx2.com": [
      { "host": "api-a.wbx2.com", "id": "urn:TEAM:us-east-2_a:hydra" },
      { "host": "api-b.wbx2.com", "id": "urn:TEAM:us-east-2_a:hydra" }
    ]
  }
}
```

A client wanting to talk to `hydra` would first try `api-a.wbx2.com`, then
`api-b.wbx2.com` should the first be unreachable, and finally fall back to
the default URL once every host has failed.

`u2c-catalog` keeps these catalogs in five groups (`override`, `discovery`,
`postauth`, `signin`, `preauth`, in order of precedence), refreshes the
remote ones without issuing duplicate requests, and tracks failed hosts so
that resolution always yields the best remaining URL.

[`DiscoveryClient::new`] creates a client (that should be reused so the
catalog is shared) around a [`CatalogTransport`] and a [`Credentials`]
provider. [`DiscoveryClient::execute`] takes in a future-producing closure
and executes it against a service's hosts in priority order, stopping and
returning the first `Ok` or last `Err` it obtains.

# Transports

The catalog is fetched through the [`CatalogTransport`] trait. An HTTP
implementation is enabled by the following feature:

- `reqwest` (via [`reqwest::Client`])

[`CatalogTransport`]: transport::CatalogTransport
[`Credentials`]: transport::Credentials
*/

mod error;
pub use error::{BoxError, Error};

mod host;
pub use host::HostEntry;

mod catalog;
pub use catalog::{
    GroupId, GroupStatus, ServiceCatalog, ServiceEntry, ServiceMatch, ServiceUrls,
    DEFAULT_CATALOG_TIMEOUT,
};

mod hostmap;
pub use hostmap::{RawHost, RawHostmap};

mod query;
pub use query::{hash_email, CatalogQuery, DEFAULT_PREAUTH_MODE};

mod refresher;
pub use refresher::CatalogRefresher;

pub mod transport;

mod client;
pub use client::{DiscoveryClient, DEFAULT_CLUSTER, DEFAULT_CLUSTER_SERVICE};

mod config;
pub use config::{ServicesConfig, COMMERCIAL_ALLOWED_DOMAINS, FEDRAMP_DISCOVERY};
