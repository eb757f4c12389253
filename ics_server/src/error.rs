use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

/// Errors of the HTTP handlers, answered with a plain text body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Calendar(#[from] ics_core::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Calendar(ics_core::Error::NoUpcomingEvents) => StatusCode::NOT_FOUND,
            ApiError::Calendar(err) => {
                warn!(%err, "calendar lookup failed");
                StatusCode::BAD_REQUEST
            }
            ApiError::BadRequest(message) => {
                warn!(message, "invalid request");
                StatusCode::BAD_REQUEST
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};

    use crate::error::ApiError;

    #[test]
    fn test_status_codes() {
        let not_found = ApiError::from(ics_core::Error::NoUpcomingEvents).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let parse = ApiError::from(ics_core::Error::Parse("broken".to_string())).into_response();
        assert_eq!(parse.status(), StatusCode::BAD_REQUEST);
        let zone =
            ApiError::from(ics_core::Error::UnknownTimeZone("Mars".to_string())).into_response();
        assert_eq!(zone.status(), StatusCode::BAD_REQUEST);
        let bad_request = ApiError::BadRequest("missing icsUrl".to_string()).into_response();
        assert_eq!(bad_request.status(), StatusCode::BAD_REQUEST);
    }
}
