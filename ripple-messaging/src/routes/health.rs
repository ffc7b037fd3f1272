use axum::Json;

use ripple_shared::types::HealthResponse;

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::healthy(
        "ripple-messaging",
        env!("CARGO_PKG_VERSION"),
    ))
}
