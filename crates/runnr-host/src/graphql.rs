//! GraphQL queries over the HTTP capability.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use runnr_common::CapabilityError;

use crate::config::{GraphQlConfig, HttpConfig};
use crate::{AuthCapability, HttpCapability, HttpClient, HttpMethod, HttpRequest};

/// GraphQL capability.
#[async_trait]
pub trait GraphQlCapability: Send + Sync {
    /// Run `query` against `endpoint` and return the raw response JSON.
    async fn query(
        &self,
        auth: &dyn AuthCapability,
        endpoint: &str,
        query: &str,
    ) -> Result<Vec<u8>, CapabilityError>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
}

/// GraphQL client that posts queries through an [`HttpClient`] governed by
/// the GraphQL rules.
#[derive(Debug)]
pub struct GraphQlClient {
    enabled: bool,
    http: HttpClient,
}

impl GraphQlClient {
    pub fn new(config: GraphQlConfig) -> Self {
        Self {
            enabled: config.enabled,
            http: HttpClient::new(HttpConfig {
                enabled: true,
                rules: config.rules,
            }),
        }
    }
}

#[async_trait]
impl GraphQlCapability for GraphQlClient {
    async fn query(
        &self,
        auth: &dyn AuthCapability,
        endpoint: &str,
        query: &str,
    ) -> Result<Vec<u8>, CapabilityError> {
        if !self.enabled {
            return Err(CapabilityError::NotEnabled {
                capability: "graphql",
            });
        }

        let body = serde_json::to_vec(&json!({ "query": query, "variables": {} }))
            .map_err(|e| CapabilityError::invalid_argument(e.to_string()))?;

        debug!(endpoint, "sending GraphQL query");

        let request = HttpRequest::new(HttpMethod::Post, endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        let response = self.http.do_request(auth, request).await?;

        check_errors(&response.body)?;
        Ok(response.body)
    }
}

/// Fail if a GraphQL response body carries a non-empty `errors` array.
fn check_errors(body: &[u8]) -> Result<(), CapabilityError> {
    let parsed: GraphQlResponse = serde_json::from_slice(body)
        .map_err(|e| CapabilityError::downstream(format!("invalid GraphQL response: {e}")))?;

    if parsed.errors.is_empty() {
        return Ok(());
    }

    let message = parsed
        .errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    Err(CapabilityError::GraphQl { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthProvider, HttpRules};

    #[test]
    fn test_check_errors() {
        assert!(check_errors(br#"{"data":{"hello":"world"}}"#).is_ok());
        assert!(check_errors(br#"{"data":null,"errors":[]}"#).is_ok());

        let err = check_errors(br#"{"errors":[{"message":"bad field"},{"message":"nope"}]}"#)
            .unwrap_err();
        assert_eq!(
            err,
            CapabilityError::GraphQl {
                message: "bad field, nope".into()
            }
        );
        assert_eq!(err.sentinel(), -4);

        assert_eq!(check_errors(b"not json").unwrap_err().sentinel(), -4);
    }

    #[tokio::test]
    async fn test_disabled() {
        let client = GraphQlClient::new(GraphQlConfig {
            enabled: false,
            rules: HttpRules::default(),
        });

        let err = client
            .query(&AuthProvider::default(), "https://api.example.com/graphql", "{ a }")
            .await
            .unwrap_err();
        assert_eq!(err.sentinel(), -1);
    }

    #[tokio::test]
    async fn test_rules_apply_to_endpoint() {
        let client = GraphQlClient::new(GraphQlConfig {
            enabled: true,
            rules: HttpRules::allow_domains(["api.example.com"]),
        });

        let err = client
            .query(&AuthProvider::default(), "https://evil.test/graphql", "{ a }")
            .await
            .unwrap_err();
        assert_eq!(err.sentinel(), -2);
    }
}
