use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod analyze;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/", get(liveness))
}

async fn liveness() -> &'static str {
    "Smart Data Analyst API is running!"
}
