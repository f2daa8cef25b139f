//! HTTP handlers for the platform entry point.
//!
//! `POST /invoke` takes the raw event and answers with the response envelope
//! as JSON. `GET /files` is the boundary for retrieval: it routes the query
//! string like any other invocation, then decodes the envelope into a plain
//! HTTP response carrying the object bytes.

use crate::{
    errors::AppError, models::envelope::ResponseEnvelope, services::request_router::RequestRouter,
};
use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;

/// `POST /invoke`: route a raw event, answer with the envelope.
pub async fn invoke(
    State(router): State<RequestRouter>,
    Json(event): Json<Value>,
) -> Result<Response, AppError> {
    let envelope = router.route(&event).await;
    let status = StatusCode::from_u16(envelope.status_code)
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok((status, Json(envelope)).into_response())
}

/// `GET /files?bucket=..&file=..`: download an object through the router.
pub async fn download_file(
    State(router): State<RequestRouter>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let event = json!({ "queryStringParameters": params });
    let envelope = router.route(&event).await;
    decode_envelope(envelope)
}

/// Turn an envelope back into an HTTP response, undoing the body encoding
/// when `isBase64Encoded` is set.
pub fn decode_envelope(envelope: ResponseEnvelope) -> Result<Response, AppError> {
    let status = StatusCode::from_u16(envelope.status_code)
        .map_err(|err| AppError::internal(err.to_string()))?;
    let body = envelope
        .decoded_body()
        .map_err(|err| AppError::internal(format!("undecodable envelope body: {}", err)))?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &envelope.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!("dropping unrepresentable header {}: {}", name, value),
        }
    }

    Ok(response)
}
