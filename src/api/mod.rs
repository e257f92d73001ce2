// =============================================================================
// HTTP / WebSocket surface
// =============================================================================
//
// A thin adapter over the gating API. Domain rejections are mapped onto
// status codes here and nowhere else.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};

use crate::error::Rejection;

pub use rest::router;

/// Response wrapper for a [`Rejection`].
#[derive(Debug)]
pub struct ApiError(pub Rejection);

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self(rejection)
    }
}

pub fn status_for(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::AlreadyActive(_) | Rejection::NotActive(_) => StatusCode::CONFLICT,
        Rejection::NoSetup(_) | Rejection::InvalidTargets(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Rejection::UnknownSignal(_) => StatusCode::NOT_FOUND,
        Rejection::NotOwner { .. } => StatusCode::FORBIDDEN,
        Rejection::InvalidInstrument(_) => StatusCode::BAD_REQUEST,
        Rejection::DataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Rejection::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (status_for(&self.0), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_status_mapping() {
        assert_eq!(status_for(&Rejection::AlreadyActive("a/b".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&Rejection::NoSetup("x".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&Rejection::UnknownSignal("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Rejection::NotOwner {
                signal_id: "s".into(),
                requester: "r".into()
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&Rejection::InvalidInstrument("BTC&USDT".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Rejection::DataUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
