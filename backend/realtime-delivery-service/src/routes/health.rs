use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde_json::json;

/// GET /health
#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "instance_id": state.config.instance_id,
        "connections": state.registry.total_connections(),
    }))
}
