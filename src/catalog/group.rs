//! Service groups: named partitions of the catalog.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use tokio::sync::watch;

use super::ServiceEntry;
use crate::Error;

/// Identifies a partition of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    /// Static discovery endpoints from configuration.
    Discovery,
    /// Static overrides from configuration; these win over everything else.
    Override,
    /// Catalog available before authentication.
    Preauth,
    /// Catalog collected while signing in.
    Signin,
    /// Catalog available after authentication.
    Postauth,
}

impl GroupId {
    /// Every group, in lookup precedence order.
    pub const PRECEDENCE: [GroupId; 5] = [
        GroupId::Override,
        GroupId::Discovery,
        GroupId::Postauth,
        GroupId::Signin,
        GroupId::Preauth,
    ];

    /// Maps the name of a remote catalog (`limited`, `signin`, anything
    /// else) onto the group it populates.
    pub fn from_catalog_name(from: Option<&str>) -> Self {
        match from {
            Some("limited") => GroupId::Preauth,
            Some("signin") => GroupId::Signin,
            _ => GroupId::Postauth,
        }
    }

    /// Name of this group.
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupId::Discovery => "discovery",
            GroupId::Override => "override",
            GroupId::Preauth => "preauth",
            GroupId::Signin => "signin",
            GroupId::Postauth => "postauth",
        }
    }

    /// Discovery resource that serves this group's catalog, if it is
    /// populated remotely.
    pub fn resource(&self) -> Option<&'static str> {
        match self {
            GroupId::Preauth => Some("/limited/catalog"),
            GroupId::Signin => Some("/signin/catalog"),
            GroupId::Postauth => Some("/catalog"),
            GroupId::Discovery | GroupId::Override => None,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(GroupId::Discovery),
            "override" => Ok(GroupId::Override),
            "preauth" | "limited" => Ok(GroupId::Preauth),
            "signin" => Ok(GroupId::Signin),
            "postauth" => Ok(GroupId::Postauth),
            other => Err(Error::UnknownGroup(other.to_string())),
        }
    }
}

/// Refresh status of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStatus {
    /// A refresh for the group is outstanding.
    pub collecting: bool,
    /// The group has been populated at least once. Never reset.
    pub ready: bool,
}

pub(crate) type Services = HashMap<String, Arc<ServiceEntry>>;

/// One partition of the catalog.
#[derive(Debug)]
pub(crate) struct ServiceGroup {
    pub(crate) services: ArcSwap<Services>,
    write: Mutex<()>,
    status: watch::Sender<GroupStatus>,
}

impl ServiceGroup {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(GroupStatus::default());
        Self {
            services: Default::default(),
            write: Mutex::new(()),
            status,
        }
    }

    pub(crate) fn status(&self) -> GroupStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<GroupStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_collecting(&self, collecting: bool) {
        self.status.send_if_modified(|status| {
            let changed = status.collecting != collecting;
            status.collecting = collecting;
            changed
        });
    }

    /// Replaces the group's services wholesale and marks it ready. The swap
    /// and the ready transition happen under the group's write lock so a
    /// later merge cannot interleave with this one.
    pub(crate) fn replace(&self, services: Services) {
        let _guard = self.write.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.services.store(Arc::new(services));
        self.status.send_modify(|status| status.ready = true);
    }
}
