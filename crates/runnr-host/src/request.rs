//! Access to the request bound to the running job.

use std::sync::Arc;

use parking_lot::Mutex;

use runnr_common::{CapabilityError, CoordinatedRequest, FieldType};

use crate::config::RequestHandlerConfig;

/// Request handler capability.
///
/// The runner binds the job's [`CoordinatedRequest`] before the guest runs;
/// header writes land in the shared request so the runner can build the
/// response afterwards.
#[derive(Debug, Clone, Default)]
pub struct RequestHandler {
    config: RequestHandlerConfig,
    request: Option<Arc<Mutex<CoordinatedRequest>>>,
}

impl RequestHandler {
    pub fn new(config: RequestHandlerConfig) -> Self {
        Self {
            config,
            request: None,
        }
    }

    /// Bind a request for the current job.
    pub fn bind(&mut self, request: Arc<Mutex<CoordinatedRequest>>) {
        self.request = Some(request);
    }

    /// Same configuration, no request bound.
    #[must_use]
    pub fn unbound(&self) -> Self {
        Self::new(self.config.clone())
    }

    pub fn request(&self) -> Option<&Arc<Mutex<CoordinatedRequest>>> {
        self.request.as_ref()
    }

    fn bound(&self) -> Result<&Arc<Mutex<CoordinatedRequest>>, CapabilityError> {
        if !self.config.enabled {
            return Err(CapabilityError::NotEnabled {
                capability: "request handler",
            });
        }
        self.request.as_ref().ok_or(CapabilityError::RequestNotSet)
    }

    /// Read a field of the bound request by guest field type code.
    ///
    /// # Errors
    ///
    /// Fails if the capability or field access is disabled, no request is
    /// bound, the field type code is unknown, or the key does not exist.
    pub fn get_field(&self, field_type: i32, key: &str) -> Result<Vec<u8>, CapabilityError> {
        let request = self.bound()?;
        if !self.config.allow_get_field {
            return Err(CapabilityError::NotEnabled {
                capability: "request handler get field",
            });
        }

        let field_type = FieldType::try_from(field_type)?;
        request.lock().field(field_type, key)
    }

    /// Set a response header on the bound request.
    ///
    /// # Errors
    ///
    /// Fails if the capability or field writes are disabled or no request is bound.
    pub fn set_response_header(&self, key: &str, value: &str) -> Result<(), CapabilityError> {
        let request = self.bound()?;
        if !self.config.allow_set_field {
            return Err(CapabilityError::NotEnabled {
                capability: "request handler set field",
            });
        }

        request.lock().set_response_header(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_handler(config: RequestHandlerConfig) -> (RequestHandler, Arc<Mutex<CoordinatedRequest>>) {
        let request = Arc::new(Mutex::new(CoordinatedRequest {
            method: "POST".into(),
            url: "/greet".into(),
            id: "r1".into(),
            body: br#"{"name":"Bob","age":42}"#.to_vec(),
            headers: [("Content-Type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        }));
        let mut handler = RequestHandler::new(config);
        handler.bind(request.clone());
        (handler, request)
    }

    #[test]
    fn test_get_field() {
        let (handler, _) = bound_handler(RequestHandlerConfig::default());

        assert_eq!(handler.get_field(0, "method").unwrap(), b"POST");
        assert_eq!(handler.get_field(0, "id").unwrap(), b"r1");
        assert_eq!(handler.get_field(1, "name").unwrap(), b"Bob");
        assert_eq!(handler.get_field(1, "age").unwrap(), b"42");
        assert_eq!(
            handler.get_field(2, "content-type").unwrap(),
            b"application/json"
        );
        assert_eq!(handler.get_field(0, "nope").unwrap_err().sentinel(), -3);
        assert_eq!(handler.get_field(9, "method").unwrap_err().sentinel(), -2);
    }

    #[test]
    fn test_set_response_header() {
        let (handler, request) = bound_handler(RequestHandlerConfig::default());

        handler.set_response_header("X-Reactr", "Bob").unwrap();
        assert_eq!(request.lock().resp_headers["X-Reactr"], "Bob");
    }

    #[test]
    fn test_unbound_and_disabled() {
        let handler = RequestHandler::default();
        assert_eq!(
            handler.get_field(0, "method").unwrap_err(),
            CapabilityError::RequestNotSet
        );

        let (handler, _) = bound_handler(RequestHandlerConfig {
            allow_set_field: false,
            ..Default::default()
        });
        assert!(handler.get_field(0, "method").is_ok());
        assert_eq!(
            handler.set_response_header("a", "b").unwrap_err().sentinel(),
            -1
        );
        assert!(handler.unbound().request().is_none());
    }
}
