//! The user-facing JSON web server that listens for inference requests

use crate::torch::PredictError;
use actix_cors::Cors;
use actix_web::error::{BlockingError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use tracing::warn;

pub mod protocol;
pub mod routes;

/// Every failure a route can return. All of them are rendered as
/// `{"error": "<message>"}`, only the status code differs
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error("inference task failed: {0}")]
    Blocking(#[from] BlockingError),

    #[error("invalid request body: {0}")]
    Body(#[source] JsonPayloadError),
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(protocol::ErrorResponse {
            error: self.to_string(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            WebError::Predict(PredictError::Decode(_) | PredictError::Image(_)) => {
                StatusCode::BAD_REQUEST
            }
            WebError::Predict(PredictError::Inference(_)) | WebError::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            WebError::Body(
                JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. },
            ) => StatusCode::PAYLOAD_TOO_LARGE,
            WebError::Body(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Allow every origin, method and header, with credentials
pub fn cors() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allow_any_method()
        .allow_any_header()
        .supports_credentials()
}

/// JSON extractor settings: body size limit and `{"error"}` shaped rejections
pub fn json_config(max_body_bytes: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_body_bytes)
        .error_handler(|err, _req| {
            warn!("rejected request body: {err}");
            WebError::Body(err).into()
        })
}

/// Register the routes. The `Predictor` is expected as app data
pub fn configure(max_body_bytes: usize) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(json_config(max_body_bytes))
            .service(routes::predict)
            .service(routes::health);
    }
}
