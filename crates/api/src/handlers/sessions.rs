use actix_web::{web, HttpResponse};
use metrics::counter;

use ledger_watch_domain::SessionId;

use crate::state::AppState;

use super::ApiError;

pub async fn list_sessions_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.hub().summaries())
}

pub async fn session_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = SessionId::new(path.into_inner());
    match state.hub().session(&id) {
        Some(session) => Ok(HttpResponse::Ok().json(session.summary())),
        None => {
            counter!("api_session_lookups_total", "status" => "not_found").increment(1);
            Err(ApiError::NotFound)
        }
    }
}
