//! Jobs and their payloads.

use runnr_common::{CoordinatedRequest, RuntimeError};
use runnr_host::Capabilities;
use uuid::Uuid;

/// The input of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
    Request(CoordinatedRequest),
}

impl Payload {
    /// The payload as bytes: bytes as is, text as UTF-8, anything else as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Text(s) => Ok(s.clone().into_bytes()),
            Self::Json(v) => {
                serde_json::to_vec(v).map_err(|e| RuntimeError::payload(e.to_string()))
            }
            Self::Request(r) => r.to_json(),
        }
    }

    /// Try to read the payload as a [`CoordinatedRequest`].
    ///
    /// Returns `None` unless the payload decodes and carries the required fields.
    pub fn as_request(&self) -> Option<CoordinatedRequest> {
        match self {
            Self::Request(r) => Some(r.clone()),
            Self::Bytes(b) => CoordinatedRequest::from_json(b).ok(),
            Self::Text(s) => CoordinatedRequest::from_json(s.as_bytes()).ok(),
            Self::Json(v) => CoordinatedRequest::from_value(v.clone()).ok(),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<CoordinatedRequest> for Payload {
    fn from(r: CoordinatedRequest) -> Self {
        Self::Request(r)
    }
}

/// One unit of work, routed to a worker by `job_type`.
#[derive(Debug, Clone)]
pub struct Job {
    uuid: String,
    job_type: String,
    payload: Payload,
    pub(crate) capabilities: Option<Capabilities>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload: payload.into(),
            capabilities: None,
        }
    }

    /// Run the job with these capabilities instead of the worker's defaults.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Shorthand for `payload().to_bytes()`.
    pub fn bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        self.payload.to_bytes()
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_to_bytes() {
        assert_eq!(Payload::from("world").to_bytes().unwrap(), b"world");
        assert_eq!(Payload::from(vec![1u8, 2]).to_bytes().unwrap(), vec![1, 2]);
        assert_eq!(
            Payload::from(json!({"a": 1})).to_bytes().unwrap(),
            br#"{"a":1}"#
        );
    }

    #[test]
    fn test_payload_as_request() {
        let raw = br#"{"method":"POST","url":"/greet","request_id":"r1","body":"Qm9i"}"#;
        let req = Payload::from(raw.to_vec()).as_request().unwrap();
        assert_eq!(req.body, b"Bob");

        assert!(Payload::from("world").as_request().is_none());
        assert!(Payload::from(json!({"method": "GET"})).as_request().is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = Job::new("echo", "x");
        let b = Job::new("echo", "x");
        assert_ne!(a.uuid(), b.uuid());
        assert_eq!(a.job_type(), "echo");
        assert!(a.capabilities().is_none());
    }
}
