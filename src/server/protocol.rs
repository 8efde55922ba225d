use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Body of `POST /predict/`: an image of any supported format, base 64 encoded
#[derive(Deserialize)]
pub struct PredictRequest {
    pub image: String,
}

impl Debug for PredictRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PredictRequest {{ image: <{} bytes> }}", self.image.len())
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub predicted_class: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_format: &'static str,
    pub num_classes: i64,
    pub labels: Vec<String>,
}
