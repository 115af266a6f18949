/// Success envelope: `{ success: true, data, timestamp }`
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
    timestamp: DateTime<Utc>,
}

/// Successful API response with optional extra headers (cookies)
#[derive(Debug)]
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
    headers: HeaderMap,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            data,
            headers: HeaderMap::new(),
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            ..Self::ok(data)
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = Json(Envelope {
            success: true,
            data: self.data,
            timestamp: Utc::now(),
        });

        (self.status, self.headers, body).into_response()
    }
}
