use actix_web::{web::Data, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub mode: String,
    pub active_sessions: usize,
}

pub async fn health_handler(state: Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_owned(),
        mode: state.hub().mode().to_owned(),
        active_sessions: state.hub().active_sessions(),
    })
}
