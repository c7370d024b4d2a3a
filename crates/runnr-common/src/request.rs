//! Request envelopes for request-shaped jobs.
//!
//! A [`CoordinatedRequest`] is the normalized form of an incoming request.
//! When a job's payload decodes into one, the Runnable receives the request
//! body as its input and can read the other fields through the request
//! handler capability. Its output is then wrapped in a [`CoordinatedResponse`].
//!
//! Byte fields are encoded as standard base64 strings in JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{CapabilityError, RuntimeError};

/// The standard input envelope for request-shaped jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatedRequest {
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub url: String,

    #[serde(rename = "request_id", default)]
    pub id: String,

    #[serde(default, with = "b64")]
    pub body: Vec<u8>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub resp_headers: HashMap<String, String>,

    #[serde(default)]
    pub params: HashMap<String, String>,

    #[serde(default, with = "b64_map")]
    pub state: HashMap<String, Vec<u8>>,
}

/// The envelope returned for a request-shaped job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatedResponse {
    #[serde(default, with = "b64")]
    pub output: Vec<u8>,

    #[serde(default)]
    pub resp_headers: HashMap<String, String>,
}

/// Which part of a request `request_get_field` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// `method`, `url`, `id` or `body`.
    Meta,
    /// A top-level field of a JSON body.
    Body,
    Header,
    Params,
    State,
}

impl TryFrom<i32> for FieldType {
    type Error = CapabilityError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Meta),
            1 => Ok(Self::Body),
            2 => Ok(Self::Header),
            3 => Ok(Self::Params),
            4 => Ok(Self::State),
            other => Err(CapabilityError::InvalidFieldType { field_type: other }),
        }
    }
}

impl CoordinatedRequest {
    /// Decode a request from JSON, requiring `method`, `url` and `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Payload`] if the bytes are not a request.
    pub fn from_json(bytes: &[u8]) -> Result<Self, RuntimeError> {
        let req: Self = serde_json::from_slice(bytes)
            .map_err(|e| RuntimeError::payload(format!("not a coordinated request: {e}")))?;
        req.validate()?;
        Ok(req)
    }

    /// Decode a request from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Payload`] if the value is not a request.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RuntimeError> {
        let req: Self = serde_json::from_value(value)
            .map_err(|e| RuntimeError::payload(format!("not a coordinated request: {e}")))?;
        req.validate()?;
        Ok(req)
    }

    fn validate(&self) -> Result<(), RuntimeError> {
        let missing: Vec<&str> = [
            ("method", &self.method),
            ("url", &self.url),
            ("request_id", &self.id),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::payload(format!(
                "request is missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    /// Encode the request as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Payload`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, RuntimeError> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::payload(e.to_string()))
    }

    /// Read one field of the request.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidKey`] for unknown keys and
    /// [`CapabilityError::InvalidArgument`] if the body is not a JSON object.
    pub fn field(&self, field_type: FieldType, key: &str) -> Result<Vec<u8>, CapabilityError> {
        let invalid_key = || CapabilityError::InvalidKey { key: key.into() };

        match field_type {
            FieldType::Meta => match key {
                "method" => Ok(self.method.clone().into_bytes()),
                "url" => Ok(self.url.clone().into_bytes()),
                "id" => Ok(self.id.clone().into_bytes()),
                "body" => Ok(self.body.clone()),
                _ => Err(invalid_key()),
            },
            FieldType::Body => self.body_field(key),
            FieldType::Header => self
                .headers
                .get(key)
                .or_else(|| {
                    self.headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v)
                })
                .map(|v| v.clone().into_bytes())
                .ok_or_else(invalid_key),
            FieldType::Params => self
                .params
                .get(key)
                .map(|v| v.clone().into_bytes())
                .ok_or_else(invalid_key),
            FieldType::State => self.state.get(key).cloned().ok_or_else(invalid_key),
        }
    }

    fn body_field(&self, key: &str) -> Result<Vec<u8>, CapabilityError> {
        let body: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&self.body)
            .map_err(|e| CapabilityError::invalid_argument(format!("body is not a JSON object: {e}")))?;

        match body.get(key) {
            Some(serde_json::Value::String(s)) => Ok(s.clone().into_bytes()),
            Some(other) => serde_json::to_vec(other)
                .map_err(|e| CapabilityError::invalid_argument(e.to_string())),
            None => Err(CapabilityError::InvalidKey { key: key.into() }),
        }
    }

    /// Set a header on the eventual response.
    pub fn set_response_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.resp_headers.insert(key.into(), value.into());
    }
}

impl CoordinatedResponse {
    /// Encode the response as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Payload`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, RuntimeError> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::payload(e.to_string()))
    }
}

/// Serde helpers for `Vec<u8>` as base64. `null` decodes to empty.
mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

mod b64_map {
    use std::collections::HashMap;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            out.serialize_entry(k, &STANDARD.encode(v))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
        let raw = Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default();
        raw.into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
