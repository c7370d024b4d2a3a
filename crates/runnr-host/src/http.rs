//! Outbound HTTP capability.
//!
//! Requests are checked against [`HttpRules`] before they leave the host,
//! decorated with the auth header configured for the target domain, and sent
//! with a shared, connection-pooled `reqwest` client. Responses with a status
//! above 299 are reported as [`CapabilityError::HttpStatus`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use runnr_common::CapabilityError;

use crate::AuthCapability;
use crate::config::HttpConfig;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Separator between the URL and each packed header in `fetch_url`.
const HEADER_PACK_SEPARATOR: &str = "::";

/// HTTP method enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Method from a guest method code: 1 GET, 2 POST, 3 PATCH, 4 DELETE.
    pub fn from_code(code: i32) -> Result<Self, CapabilityError> {
        match code {
            1 => Ok(Self::Get),
            2 => Ok(Self::Post),
            3 => Ok(Self::Patch),
            4 => Ok(Self::Delete),
            other => Err(CapabilityError::invalid_argument(format!(
                "unknown method code {other}"
            ))),
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Parse the `base_url[::name:value[::...]]` form used by `fetch_url`.
    ///
    /// `Content-Type: application/octet-stream` is added when the body is
    /// non-empty and no content type was packed.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidArgument`] for a header without a `:`.
    pub fn from_packed(
        method: HttpMethod,
        packed: &str,
        body: Vec<u8>,
    ) -> Result<Self, CapabilityError> {
        let mut parts = packed.split(HEADER_PACK_SEPARATOR);
        let url = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        for part in parts {
            let (name, value) = part.split_once(':').ok_or_else(|| {
                CapabilityError::invalid_argument(format!("malformed header '{part}'"))
            })?;
            headers.push((name.to_string(), value.to_string()));
        }

        let has_content_type = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if !body.is_empty() && !has_content_type {
            headers.push((
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            ));
        }

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// HTTP response returned to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// HTTP capability.
#[async_trait]
pub trait HttpCapability: Send + Sync {
    /// Perform a request, attaching the auth header `auth` has for the target host.
    async fn do_request(
        &self,
        auth: &dyn AuthCapability,
        request: HttpRequest,
    ) -> Result<HttpResponse, CapabilityError>;
}

/// HTTP capability backed by `reqwest`.
pub struct HttpClient {
    /// HTTP client (shared, connection pooled).
    client: Client,

    config: HttpConfig,
}

impl HttpClient {
    /// Create a new HTTP client with the given configuration.
    pub fn new(config: HttpConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("runnr/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to configure HTTP client, using defaults");
                Client::new()
            });

        Self { client, config }
    }

    /// Create with a custom `reqwest` client.
    pub fn with_client(client: Client, config: HttpConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpCapability for HttpClient {
    async fn do_request(
        &self,
        auth: &dyn AuthCapability,
        request: HttpRequest,
    ) -> Result<HttpResponse, CapabilityError> {
        if !self.config.enabled {
            return Err(CapabilityError::NotEnabled { capability: "http" });
        }

        let url = Url::parse(&request.url).map_err(|e| {
            CapabilityError::rule_violation(format!("invalid URL '{}': {e}", request.url))
        })?;

        if let Err(e) = self.config.rules.request_is_allowed(&url).await {
            warn!(url = %url, error = %e, "HTTP request blocked by rules");
            return Err(e);
        }

        debug!(method = ?request.method, url = %url, "executing HTTP request");

        let mut builder = self.client.request(request.method.to_reqwest(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(host) = url.host_str() {
            if let Some(header) = auth.header_for_domain(host) {
                builder = builder.header(reqwest::header::AUTHORIZATION, header.header_value());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CapabilityError::downstream(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        if status > 299 {
            info!(url = %url, status, "HTTP request returned error status");
            return Err(CapabilityError::HttpStatus { status });
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::downstream(format!("failed to read body: {e}")))?;

        if body.len() > MAX_BODY_BYTES {
            return Err(CapabilityError::downstream("response body too large"));
        }

        info!(url = %url, status, body_size = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::AuthConfig;
    use crate::{AuthHeader, AuthProvider, HttpRules};

    /// Serve one canned HTTP response and return what the client sent.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        (format!("http://{addr}"), handle)
    }

    fn no_auth() -> AuthProvider {
        AuthProvider::default()
    }

    #[test]
    fn test_method_codes() {
        assert_eq!(HttpMethod::from_code(1).unwrap(), HttpMethod::Get);
        assert_eq!(HttpMethod::from_code(2).unwrap(), HttpMethod::Post);
        assert_eq!(HttpMethod::from_code(3).unwrap(), HttpMethod::Patch);
        assert_eq!(HttpMethod::from_code(4).unwrap(), HttpMethod::Delete);
        assert_eq!(HttpMethod::from_code(0).unwrap_err().sentinel(), -2);
        assert_eq!(HttpMethod::Patch.to_reqwest(), reqwest::Method::PATCH);
    }

    #[test]
    fn test_from_packed_headers() {
        let req = HttpRequest::from_packed(
            HttpMethod::Post,
            "https://api.example.com/v1::X-Trace:abc::Accept:application/json",
            b"{}".to_vec(),
        )
        .unwrap();

        assert_eq!(req.url, "https://api.example.com/v1");
        assert_eq!(
            req.headers,
            vec![
                ("X-Trace".to_string(), "abc".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                (
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_from_packed_keeps_content_type() {
        let req = HttpRequest::from_packed(
            HttpMethod::Post,
            "https://a.test::content-type:text/plain",
            b"hi".to_vec(),
        )
        .unwrap();
        assert_eq!(req.headers.len(), 1);

        let req = HttpRequest::from_packed(HttpMethod::Get, "https://a.test", Vec::new()).unwrap();
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_from_packed_malformed_header() {
        let err = HttpRequest::from_packed(HttpMethod::Get, "https://a.test::nocolon", Vec::new())
            .unwrap_err();
        assert_eq!(err.sentinel(), -2);
    }

    #[tokio::test]
    async fn test_disabled_capability() {
        let client = HttpClient::new(HttpConfig {
            enabled: false,
            rules: HttpRules::default(),
        });

        let err = client
            .do_request(&no_auth(), HttpRequest::new(HttpMethod::Get, "https://a.test/"))
            .await
            .unwrap_err();
        assert_eq!(err.sentinel(), -1);
    }

    #[tokio::test]
    async fn test_rules_reject_before_sending() {
        let client = HttpClient::new(HttpConfig {
            enabled: true,
            rules: HttpRules::allow_domains(["*.example.com"]),
        });

        let err = client
            .do_request(&no_auth(), HttpRequest::new(HttpMethod::Get, "https://evil.test/"))
            .await
            .unwrap_err();
        assert_eq!(err.sentinel(), -2);

        let err = client
            .do_request(&no_auth(), HttpRequest::new(HttpMethod::Get, "not a url"))
            .await
            .unwrap_err();
        assert_eq!(err.sentinel(), -2);
    }

    #[tokio::test]
    async fn test_successful_request_with_auth() {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .await;
        let client = HttpClient::new(HttpConfig::default());
        let auth = AuthProvider::new(AuthConfig {
            enabled: true,
            headers: [("127.0.0.1".to_string(), AuthHeader::new("bearer", "s3cret"))]
                .into_iter()
                .collect(),
        });

        let response = client
            .do_request(
                &auth,
                HttpRequest::new(HttpMethod::Post, format!("{base}/echo")).body(b"ping".to_vec()),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");

        let sent = server.await.unwrap().to_lowercase();
        assert!(sent.starts_with("post /echo"));
        assert!(sent.contains("authorization: bearer s3cret"));
    }

    #[tokio::test]
    async fn test_error_status_becomes_negative_sentinel() {
        let (base, _server) =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let client = HttpClient::new(HttpConfig::default());

        let err = client
            .do_request(&no_auth(), HttpRequest::new(HttpMethod::Get, format!("{base}/missing")))
            .await
            .unwrap_err();

        assert_eq!(err, CapabilityError::HttpStatus { status: 404 });
        assert_eq!(err.sentinel(), -404);
    }
}
