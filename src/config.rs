//! Services configuration.

use std::{path::Path, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::Error;

/// Domains every commercial deployment may talk to.
pub const COMMERCIAL_ALLOWED_DOMAINS: [&str; 4] =
    ["wbx2.com", "ciscospark.com", "webex.com", "webexapis.com"];

/// Discovery endpoints used in place of the configured ones for FedRAMP
/// deployments.
pub const FEDRAMP_DISCOVERY: [(&str, &str); 2] = [
    ("hydra", "https://api-usgov.webex.com/v1"),
    ("u2c", "https://u2c.gov.ciscospark.com/u2c/api/v1"),
];

/// Static configuration of the services catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServicesConfig {
    /// Service name to URL, seeded into the `discovery` group.
    #[serde(default)]
    pub discovery: IndexMap<String, String>,
    /// Service name to URL, seeded into the `override` group.
    #[serde(default, rename = "override")]
    pub overrides: IndexMap<String, String>,
    /// Host suffixes external URLs are validated against.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Whether callers should validate URLs against the allowed domains.
    #[serde(default = "default_validate_domains")]
    pub validate_domains: bool,
    /// Services resolved straight from the most recent discovery links,
    /// without waiting for a catalog.
    #[serde(default)]
    pub services_not_need_validation: Vec<String>,
    /// Use the FedRAMP discovery endpoints and skip the commercial domains.
    #[serde(default)]
    pub fedramp: bool,
    /// Email used to collect the pre-authentication catalog when the session
    /// has no credentials yet.
    #[serde(default)]
    pub email: Option<String>,
    /// Default budget of [`wait_for_service`](crate::DiscoveryClient::wait_for_service).
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

fn default_validate_domains() -> bool {
    true
}

fn default_wait_timeout() -> u64 {
    5
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            discovery: IndexMap::new(),
            overrides: IndexMap::new(),
            allowed_domains: Vec::new(),
            validate_domains: default_validate_domains(),
            services_not_need_validation: Vec::new(),
            fedramp: false,
            email: None,
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl ServicesConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::Config(format!("{} in {}", e, path.display())))
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("failed to parse: {e}")))
    }

    /// Default wait budget for a service.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Discovery endpoints in effect.
    pub fn effective_discovery(&self) -> IndexMap<String, String> {
        if self.fedramp {
            FEDRAMP_DISCOVERY
                .iter()
                .map(|(name, url)| (name.to_string(), url.to_string()))
                .collect()
        } else {
            self.discovery.clone()
        }
    }

    /// Allowed domains in effect: the configured ones, plus the commercial
    /// set outside FedRAMP.
    pub fn effective_allowed_domains(&self) -> Vec<String> {
        let mut domains = self.allowed_domains.clone();
        if !self.fedramp {
            for domain in COMMERCIAL_ALLOWED_DOMAINS {
                if !domains.iter().any(|known| known == domain) {
                    domains.push(domain.to_string());
                }
            }
        }
        domains
    }
}
