//! Payload decoding strategies.

use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The current value of a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceData {
    /// Body kept exactly as received.
    Bytes(Bytes),
    /// Body decoded as UTF-8 text.
    Text(String),
    /// Body decoded as JSON.
    Json(Value),
}

impl ResourceData {
    /// Returns the raw bytes, if this is a raw value.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResourceData::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResourceData::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the JSON value, if this is a JSON value.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResourceData::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceData::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ResourceData::Text(s) => f.write_str(s),
            ResourceData::Json(v) => write!(f, "{}", v),
        }
    }
}

/// User-supplied decoding function.
pub type CustomDecoder = Arc<dyn Fn(&Bytes) -> Result<ResourceData, String> + Send + Sync>;

/// How a resource turns a response body into its value.
#[derive(Clone, Default)]
pub enum PayloadDecoder {
    /// Keep the body as bytes.
    #[default]
    Raw,
    /// Decode the body as UTF-8.
    Text,
    /// Parse the body as JSON.
    Json,
    /// Run a custom function.
    Custom(CustomDecoder),
}

impl PayloadDecoder {
    /// Wraps a closure as a custom decoder.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Bytes) -> Result<ResourceData, String> + Send + Sync + 'static,
    {
        PayloadDecoder::Custom(Arc::new(f))
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PayloadDecoder::Raw => "raw",
            PayloadDecoder::Text => "text",
            PayloadDecoder::Json => "json",
            PayloadDecoder::Custom(_) => "custom",
        }
    }

    /// Decodes a body.
    pub fn decode(&self, body: Bytes) -> Result<ResourceData, String> {
        match self {
            PayloadDecoder::Raw => Ok(ResourceData::Bytes(body)),
            PayloadDecoder::Text => String::from_utf8(body.to_vec())
                .map(ResourceData::Text)
                .map_err(|e| e.to_string()),
            PayloadDecoder::Json => serde_json::from_slice(&body)
                .map(ResourceData::Json)
                .map_err(|e| e.to_string()),
            PayloadDecoder::Custom(f) => f(&body),
        }
    }
}

impl fmt::Debug for PayloadDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
