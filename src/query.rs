//! Catalog query vocabulary.

use sha2::{Digest, Sha256};

use crate::{Error, GroupId};

/// Mode requested when collecting the pre-authentication catalog without
/// any user hint.
pub const DEFAULT_PREAUTH_MODE: &str = "DEFAULT_BY_PROXIMITY";

/// The single key a remote catalog is collected by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogQuery {
    /// Plaintext email. Hashed before it leaves the process for the
    /// `preauth` and `signin` catalogs.
    Email(String),
    /// SHA-256 hex digest of a lower-cased email.
    EmailHash(String),
    /// User id.
    UserId(String),
    /// Organization id.
    OrgId(String),
    /// Catalog selection mode, e.g. [`DEFAULT_PREAUTH_MODE`].
    Mode(String),
}

impl CatalogQuery {
    /// Builds a query from external key/value pairs. Exactly one pair with a
    /// key of `email`, `emailhash`, `userId`, `orgId` or `mode` and a
    /// non-empty value is accepted.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, Error>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut pairs = pairs.into_iter();
        let (key, value) = pairs.next().ok_or_else(missing_key)?;
        if pairs.next().is_some() {
            return Err(Error::InvalidQuery(
                "exactly one query param may be supplied".to_string(),
            ));
        }
        let value = value.into();
        if value.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "query param '{}' must not be empty",
                key.as_ref()
            )));
        }
        match key.as_ref() {
            "email" => Ok(Self::Email(value)),
            "emailhash" => Ok(Self::EmailHash(value)),
            "userId" => Ok(Self::UserId(value)),
            "orgId" => Ok(Self::OrgId(value)),
            "mode" => Ok(Self::Mode(value)),
            _ => Err(missing_key()),
        }
    }

    /// Query parameter name.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::EmailHash(_) => "emailhash",
            Self::UserId(_) => "userId",
            Self::OrgId(_) => "orgId",
            Self::Mode(_) => "mode",
        }
    }

    /// Query parameter value.
    pub fn value(&self) -> &str {
        match self {
            Self::Email(v)
            | Self::EmailHash(v)
            | Self::UserId(v)
            | Self::OrgId(v)
            | Self::Mode(v) => v,
        }
    }

    /// The parameter actually transmitted when collecting `group`: emails
    /// bound for `preauth` or `signin` are replaced by their hash.
    pub(crate) fn shape_for(&self, group: GroupId) -> (&'static str, String) {
        match (self, group) {
            (Self::Email(email), GroupId::Preauth | GroupId::Signin) => {
                ("emailhash", hash_email(email))
            }
            _ => (self.key(), self.value().to_string()),
        }
    }
}

fn missing_key() -> Error {
    Error::InvalidQuery(
        "a query param of email, emailhash, userId, orgId, or mode is required".to_string(),
    )
}

/// One-way hash of an email address as expected by the discovery service:
/// hex SHA-256 of the lower-cased address.
pub fn hash_email(email: &str) -> String {
    hex::encode(Sha256::digest(email.to_lowercase().as_bytes()))
}
