use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use manlab_proto::ManlabError;

/// Wraps [`ManlabError`] so it can be returned directly from an axum
/// handler; the REST façade is the one place the hub-wide error taxonomy
/// gets turned into a status code.
pub struct ApiError(pub ManlabError);

impl From<ManlabError> for ApiError {
    fn from(e: ManlabError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ManlabError::NotFound(_) => StatusCode::NOT_FOUND,
            ManlabError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ManlabError::PolicyViolation(_) => StatusCode::FORBIDDEN,
            ManlabError::FeatureDisabled(_) => StatusCode::FORBIDDEN,
            ManlabError::Conflict(_) => StatusCode::CONFLICT,
            ManlabError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ManlabError::TransportFailed(_) => StatusCode::BAD_GATEWAY,
            ManlabError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ManlabError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
