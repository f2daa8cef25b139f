//! Retrieval request/response types and the text-based response envelope
//! handed back to the hosting platform.

use axum::http::StatusCode;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::errors::ProcessError;

/// Ask for the content of one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub bucket: String,
    pub key: String,
}

/// Object content plus the framing needed to hand it to a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalResponse {
    pub content: Bytes,
    pub content_type: String,
    pub file_name: String,
}

impl RetrievalResponse {
    pub fn new(key: &str, content: Bytes, content_type: String) -> Self {
        Self {
            content,
            content_type,
            file_name: file_name_from_key(key).to_string(),
        }
    }

    /// Frame the content as base64 text with download headers.
    pub fn into_envelope(self) -> ResponseEnvelope {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), self.content_type);
        headers.insert(
            "Content-Disposition".to_string(),
            format!("attachment; filename={}", self.file_name),
        );

        ResponseEnvelope {
            status_code: StatusCode::OK.as_u16(),
            body: general_purpose::STANDARD.encode(&self.content),
            headers,
            is_base64_encoded: true,
        }
    }
}

/// Last path segment of `key`, or the whole key when it has no separator.
pub fn file_name_from_key(key: &str) -> &str {
    key.split('/').last().unwrap_or(key)
}

/// `{statusCode, body, headers?, isBase64Encoded?}`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(
        rename = "isBase64Encoded",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_base64_encoded: bool,
}

impl ResponseEnvelope {
    /// Envelope whose body is the JSON text of `value`.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            status_code: status.as_u16(),
            body: value.to_string(),
            headers,
            is_base64_encoded: false,
        }
    }

    pub fn from_error(err: &ProcessError) -> Self {
        Self::json(
            err.status(),
            &json!({ "error": err.to_string(), "kind": err.kind() }),
        )
    }

    /// Raw body bytes, undoing the transport encoding when the flag is set.
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.is_base64_encoded {
            general_purpose::STANDARD.decode(&self.body)
        } else {
            Ok(self.body.clone().into_bytes())
        }
    }
}
