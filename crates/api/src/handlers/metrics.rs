use actix_web::{web::Data, HttpResponse};
use metrics::gauge;

use crate::state::AppState;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

pub async fn metrics_handler(state: Data<AppState>) -> HttpResponse {
    // Reaper tasks update the gauge lazily; resync before a scrape.
    gauge!("watch_sessions_active").set(state.hub().active_sessions() as f64);
    HttpResponse::Ok()
        .content_type(PROMETHEUS_TEXT)
        .body(state.telemetry().render_metrics())
}
