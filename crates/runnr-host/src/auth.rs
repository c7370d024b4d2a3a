//! Per-domain authentication headers.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AuthConfig;

/// An auth header to attach to requests for one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthHeader {
    /// Scheme such as `bearer`. Empty means the value is used as is.
    #[serde(default)]
    pub header_type: String,

    /// Header value, or `env(NAME)` to read it from the environment.
    pub value: String,
}

impl AuthHeader {
    pub fn new(header_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header_type: header_type.into(),
            value: value.into(),
        }
    }

    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        if self.header_type.is_empty() {
            self.value.clone()
        } else {
            format!("{} {}", self.header_type, self.value)
        }
    }

    fn env_name(&self) -> Option<&str> {
        self.value
            .strip_prefix("env(")
            .and_then(|rest| rest.strip_suffix(')'))
    }
}

/// Auth capability.
pub trait AuthCapability: Send + Sync {
    /// Header configured for `host`, with any `env(...)` value resolved.
    fn header_for_domain(&self, host: &str) -> Option<AuthHeader>;
}

/// Auth headers from configuration.
#[derive(Debug, Default)]
pub struct AuthProvider {
    config: AuthConfig,
    resolved: Mutex<HashMap<String, AuthHeader>>,
}

impl AuthProvider {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            resolved: Mutex::new(HashMap::new()),
        }
    }
}

impl AuthCapability for AuthProvider {
    fn header_for_domain(&self, host: &str) -> Option<AuthHeader> {
        if !self.config.enabled {
            return None;
        }

        if let Some(header) = self.resolved.lock().get(host) {
            return Some(header.clone());
        }

        let configured = self.config.headers.get(host)?;
        let mut header = configured.clone();
        if let Some(name) = configured.env_name() {
            match std::env::var(name) {
                Ok(value) => header.value = value,
                Err(_) => {
                    warn!(host, variable = name, "auth header variable is not set");
                    header.value = String::new();
                }
            }
        }

        self.resolved
            .lock()
            .insert(host.to_string(), header.clone());
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(headers: Vec<(&str, AuthHeader)>) -> AuthProvider {
        AuthProvider::new(AuthConfig {
            enabled: true,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }

    #[test]
    fn test_header_value_format() {
        assert_eq!(
            AuthHeader::new("bearer", "abc").header_value(),
            "bearer abc"
        );
        assert_eq!(AuthHeader::new("", "raw-token").header_value(), "raw-token");
    }

    #[test]
    fn test_literal_header() {
        let auth = provider(vec![("api.example.com", AuthHeader::new("bearer", "abc"))]);

        let header = auth.header_for_domain("api.example.com").unwrap();
        assert_eq!(header.value, "abc");
        assert!(auth.header_for_domain("other.example.com").is_none());
    }

    #[test]
    fn test_env_header_is_resolved_and_cached() {
        let path = std::env::var("PATH").unwrap_or_default();
        let auth = provider(vec![("api.example.com", AuthHeader::new("token", "env(PATH)"))]);

        let header = auth.header_for_domain("api.example.com").unwrap();
        assert_eq!(header.value, path);
        assert_eq!(header.header_value(), format!("token {path}"));
        assert!(auth.resolved.lock().contains_key("api.example.com"));
    }

    #[test]
    fn test_disabled_returns_none() {
        let auth = AuthProvider::new(AuthConfig {
            enabled: false,
            headers: [("a.test".to_string(), AuthHeader::new("bearer", "x"))]
                .into_iter()
                .collect(),
        });
        assert!(auth.header_for_domain("a.test").is_none());
    }
}
