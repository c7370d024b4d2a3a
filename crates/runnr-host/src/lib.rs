//! Capabilities for runnr Runnables.
//!
//! A capability is a narrow host API a guest may call through the FFI
//! bridge. Each one is a trait object with an `enabled` flag and optional
//! rules, so a [`Capabilities`] set is cheap to clone for every job:
//!
//! - [`LoggerCapability`]: guest logging, scoped by FFI identifier
//! - [`HttpCapability`]: outbound HTTP gated by [`HttpRules`]
//! - [`GraphQlCapability`]: GraphQL queries over the HTTP capability
//! - [`AuthCapability`]: per-domain auth headers
//! - [`CacheCapability`]: keyed bytes with TTL (in-memory or Redis)
//! - [`FileCapability`]: read-only static files
//! - [`RequestHandler`]: access to the job's [`runnr_common::CoordinatedRequest`]

pub mod auth;
pub mod cache;
pub mod config;
pub mod file;
pub mod graphql;
pub mod http;
pub mod logger;
pub mod redis_cache;
pub mod request;
pub mod rules;

use std::sync::Arc;

pub use auth::{AuthCapability, AuthHeader, AuthProvider};
pub use cache::{CacheCapability, MemoryCache};
pub use config::CapabilityConfig;
pub use file::{FileCapability, FileSource, StaticFileFn};
pub use graphql::{GraphQlCapability, GraphQlClient};
pub use http::{HttpCapability, HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use logger::{LogLevel, LogRecord, LogScope, LoggerCapability, RecordingLogger, TracingLogger};
pub use redis_cache::RedisCache;
pub use request::RequestHandler;
pub use rules::HttpRules;

use runnr_common::CapabilityError;

/// The set of capabilities granted to one job.
///
/// Every handle is shared; only the [`RequestHandler`] is per job.
#[derive(Clone)]
pub struct Capabilities {
    pub auth: Arc<dyn AuthCapability>,
    pub logger: Arc<dyn LoggerCapability>,
    pub http: Arc<dyn HttpCapability>,
    pub graphql: Arc<dyn GraphQlCapability>,
    pub cache: Arc<dyn CacheCapability>,
    pub file_source: Arc<dyn FileCapability>,
    pub request_handler: RequestHandler,
}

impl Capabilities {
    /// Build a capability set from configuration.
    ///
    /// `static_files` backs the file capability, usually a bundle's static area.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured backend (Redis) cannot be set up.
    pub fn from_config(
        config: &CapabilityConfig,
        static_files: Option<StaticFileFn>,
    ) -> Result<Self, CapabilityError> {
        let cache: Arc<dyn CacheCapability> = match &config.cache.redis {
            Some(redis) if config.cache.enabled => Arc::new(RedisCache::new(redis)?),
            _ => Arc::new(MemoryCache::new(config.cache.clone())),
        };

        Ok(Self {
            auth: Arc::new(AuthProvider::new(config.auth.clone())),
            logger: Arc::new(TracingLogger::new(config.logger.clone())),
            http: Arc::new(HttpClient::new(config.http.clone())),
            graphql: Arc::new(GraphQlClient::new(config.graphql.clone())),
            cache,
            file_source: Arc::new(FileSource::new(config.file.clone(), static_files)),
            request_handler: RequestHandler::new(config.request_handler.clone()),
        })
    }

    /// Everything enabled with permissive rules and an in-memory cache.
    pub fn default_enabled() -> Self {
        let config = CapabilityConfig::default();
        Self {
            auth: Arc::new(AuthProvider::new(config.auth)),
            logger: Arc::new(TracingLogger::new(config.logger)),
            http: Arc::new(HttpClient::new(config.http)),
            graphql: Arc::new(GraphQlClient::new(config.graphql)),
            cache: Arc::new(MemoryCache::new(config.cache)),
            file_source: Arc::new(FileSource::new(config.file, None)),
            request_handler: RequestHandler::new(config.request_handler),
        }
    }

    /// A copy for a new job: shared handles, no request bound.
    #[must_use]
    pub fn for_job(&self) -> Self {
        let mut caps = self.clone();
        caps.request_handler = self.request_handler.unbound();
        caps
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn LoggerCapability>) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_http(mut self, http: Arc<dyn HttpCapability>) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn with_graphql(mut self, graphql: Arc<dyn GraphQlCapability>) -> Self {
        self.graphql = graphql;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthCapability>) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheCapability>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_file_source(mut self, file_source: Arc<dyn FileCapability>) -> Self {
        self.file_source = file_source;
        self
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::default_enabled()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("request_bound", &self.request_handler.request().is_some())
            .finish_non_exhaustive()
    }
}
