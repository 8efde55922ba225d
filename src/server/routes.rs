//! Route handlers. The shared `Predictor` is injected as `web::Data`

use super::protocol::{HealthResponse, PredictRequest, PredictResponse};
use super::WebError;
use crate::torch::Predictor;
use actix_web::{get, routes, web, Responder};
use tracing::{info, warn};

type Result<T> = std::result::Result<T, WebError>;

/// Classify a base 64 encoded image
#[routes]
#[post("/predict/")]
#[post("/predict")]
pub async fn predict(
    req: web::Json<PredictRequest>,
    state: web::Data<Predictor>,
) -> Result<impl Responder> {
    let req = req.into_inner();
    let predictor = state.into_inner();

    // Decoding and the forward pass are CPU bound
    let prediction = web::block(move || predictor.predict(&req.image))
        .await?
        .map_err(|err| {
            warn!("prediction failed: {err}");
            err
        })?;

    info!(
        class = prediction.class,
        probability = prediction.probability,
        label = prediction.label.as_deref().unwrap_or("-"),
        "finished serving inference request"
    );

    Ok(web::Json(PredictResponse {
        predicted_class: prediction.class,
    }))
}

/// Liveness plus a description of the loaded model
#[get("/health")]
pub async fn health(state: web::Data<Predictor>) -> impl Responder {
    let model = state.model();
    web::Json(HealthResponse {
        status: "ok",
        model_format: model.format().as_str(),
        num_classes: model.num_classes(),
        labels: state.labels().to_vec(),
    })
}
