use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::FederationError;

/// Prefix marking the pool that serves in-memory cached copies of an endpoint
pub const INMEMORY_KEY_PREFIX: &str = "INMEMORY ";

/// Separator between the url, user and password in a relational pool key
const KEY_SEPARATOR: char = '\'';

/// Identity of a backend endpoint.
///
/// Equality and hashing use the full canonical text, secrets included, so two
/// descriptors that differ only in password land in different pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointDescriptor {
    /// A database or peer node reached through a URL
    Relational {
        url: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// A local file exposed as a table
    File { path: String },
    /// A source produced by a registered child connector
    Child {
        class: String,
        #[serde(default)]
        args: String,
    },
}

impl EndpointDescriptor {
    pub fn relational(url: impl Into<String>, user: Option<&str>, password: Option<&str>) -> Self {
        EndpointDescriptor::Relational {
            url: url.into(),
            user: user.map(str::to_string),
            password: password.map(str::to_string),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        EndpointDescriptor::File { path: path.into() }
    }

    pub fn child(class: impl Into<String>, args: impl Into<String>) -> Self {
        EndpointDescriptor::Child {
            class: class.into(),
            args: args.into(),
        }
    }

    /// Canonical text used as the endpoint pool key
    pub fn pool_key(&self) -> String {
        match self {
            EndpointDescriptor::Relational { url, user, password } => format!(
                "{}{}{}{}{}",
                url,
                KEY_SEPARATOR,
                user.as_deref().unwrap_or(""),
                KEY_SEPARATOR,
                password.as_deref().unwrap_or("")
            ),
            EndpointDescriptor::File { path } => format!("file:{}", path),
            EndpointDescriptor::Child { class, args } => format!("{}:{}", class, args),
        }
    }

    /// Key of the pool holding in-memory cached handles for this endpoint
    pub fn in_memory_key(&self) -> String {
        format!("{}{}", INMEMORY_KEY_PREFIX, self.pool_key())
    }

    pub fn is_relational(&self) -> bool {
        matches!(self, EndpointDescriptor::Relational { .. })
    }

    /// URL scheme of a relational endpoint, lowercased
    pub fn scheme(&self) -> Option<String> {
        match self {
            EndpointDescriptor::Relational { url, .. } => url
                .split_once(':')
                .map(|(scheme, _)| scheme.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// True when the endpoint is another federation node reached over HTTP
    pub fn is_peer_node(&self) -> bool {
        matches!(self.scheme().as_deref(), Some("http") | Some("https"))
    }

    /// Check the descriptor is well formed before anything is built on it
    pub fn validate(&self) -> Result<(), FederationError> {
        match self {
            EndpointDescriptor::Relational { url, .. } => {
                let scheme = self
                    .scheme()
                    .ok_or_else(|| FederationError::InvalidDescriptor(format!("Missing URL scheme in {}", mask_url(url))))?;
                match scheme.as_str() {
                    "postgres" | "postgresql" | "mysql" | "mariadb" | "http" | "https" => {
                        Url::parse(url).map_err(|e| {
                            FederationError::InvalidDescriptor(format!("Invalid URL {}: {}", mask_url(url), e))
                        })?;
                        Ok(())
                    }
                    "sqlite" => {
                        if sqlite_path(url).is_empty() {
                            return Err(FederationError::InvalidDescriptor(
                                "SQLite URL must name a database file".to_string(),
                            ));
                        }
                        Ok(())
                    }
                    other => Err(FederationError::InvalidDescriptor(format!(
                        "Unsupported URL scheme '{}'. Supported: postgresql, mysql, mariadb, sqlite, http, https",
                        other
                    ))),
                }
            }
            EndpointDescriptor::File { path } if path.trim().is_empty() => Err(
                FederationError::InvalidDescriptor("File endpoint path cannot be empty".to_string()),
            ),
            EndpointDescriptor::Child { class, .. } if class.trim().is_empty() => Err(
                FederationError::InvalidDescriptor("Child endpoint class cannot be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Text safe for logs and status output
    pub fn masked(&self) -> String {
        match self {
            EndpointDescriptor::Relational { url, user, password } => format!(
                "{}{}{}{}{}",
                mask_url(url),
                KEY_SEPARATOR,
                user.as_deref().unwrap_or(""),
                KEY_SEPARATOR,
                if password.is_some() { "***" } else { "" }
            ),
            other => other.pool_key(),
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Strip the in-memory marker from a pool key, yielding the endpoint's root key
pub fn root_key(key: &str) -> &str {
    key.strip_prefix(INMEMORY_KEY_PREFIX).unwrap_or(key)
}

/// Mask a password embedded in a pool key or URL for logging
pub fn mask_key(key: &str) -> String {
    let (prefix, rest) = match key.strip_prefix(INMEMORY_KEY_PREFIX) {
        Some(rest) => (INMEMORY_KEY_PREFIX, rest),
        None => ("", key),
    };
    let mut parts = rest.splitn(3, KEY_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(url), Some(user), Some(password)) => format!(
            "{}{}{}{}{}{}",
            prefix,
            mask_url(url),
            KEY_SEPARATOR,
            user,
            KEY_SEPARATOR,
            if password.is_empty() { "" } else { "***" }
        ),
        _ => format!("{}{}", prefix, mask_url(rest)),
    }
}

/// Mask credentials in a connection URL for safe logging
pub fn mask_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.password().is_some() => {
            let mut masked = parsed.clone();
            let _ = masked.set_password(Some("***"));
            masked.to_string()
        }
        _ => url.to_string(),
    }
}

/// File path named by a `sqlite:` URL
pub fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}
