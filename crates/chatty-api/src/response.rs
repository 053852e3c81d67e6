use axum::{Json, http::StatusCode};
use axum_extra::extract::WithRejection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use chatty_types::api::ApiResponse;

use crate::error::ApiError;

/// JSON body whose rejections come back as the error envelope.
pub type ApiJson<T> = WithRejection<Json<T>, ApiError>;

pub type Envelope<T> = (StatusCode, Json<ApiResponse<T>>);

/// Wrap `data` in the success envelope.
pub fn respond<T: Serialize>(status: StatusCode, data: T, message: &str) -> Envelope<T> {
    (status, Json(ApiResponse::new(status.as_u16(), data, message)))
}

pub fn ok<T: Serialize>(data: T, message: &str) -> Envelope<T> {
    respond(StatusCode::OK, data, message)
}

pub fn created<T: Serialize>(data: T, message: &str) -> Envelope<T> {
    respond(StatusCode::CREATED, data, message)
}

/// Body that may be absent: an empty body yields `T::default()`.
pub fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}
