use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::Method,
    routing::post,
    Json, Router,
};
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::{config::Config, error::AppError, services::pipeline, AppState};

const ALLOWED_EXTENSIONS: &[&str] = &["csv", "xls", "xlsx"];

pub fn routes(config: &Config) -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    let upload = Router::new()
        .route("/api/analyze", post(analyze_upload))
        .layer(DefaultBodyLimit::max(config.max_file_size));
    let text = Router::new()
        .route("/api/analyze/text", post(analyze_text))
        .layer(DefaultBodyLimit::max(config.max_json_body));

    upload.merge(text).layer(cors)
}

/// The upload persisted to a temp path for the pipeline. Removal happens on
/// every exit path, success or failure.
struct TempUpload {
    path: PathBuf,
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove temp upload {:?}: {}", self.path, e);
        }
    }
}

#[axum::debug_handler]
async fn analyze_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let start = std::time::Instant::now();

    let mut upload: Option<(String, bytes::Bytes)> = None;
    let mut questions: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Invalid multipart request: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidInput(format!("Failed to read upload: {}", e)))?;
                upload = Some((file_name, data));
            }
            Some("questions") => {
                questions = Some(field.text().await.map_err(|e| {
                    AppError::InvalidInput(format!("Failed to read questions field: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let (file_name, data) =
        upload.ok_or_else(|| AppError::InvalidInput("No file uploaded".to_string()))?;

    let extension = file_name
        .rsplit('.')
        .next()
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if file_name.find('.').is_none() || !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::InvalidInput(
            "Only CSV and Excel files are allowed!".to_string(),
        ));
    }

    tracing::info!(
        "analyzing upload '{}', size {}KB",
        file_name,
        data.len() / 1024
    );

    let temp = store_upload(&file_name, &data).await?;
    let report =
        pipeline::analyze_file(&temp.path, questions.as_deref(), &state.agent, &state.config)
            .await?;

    tracing::info!("upload analysis completed in {:?}", start.elapsed());
    Ok(Json(json!({ "success": true, "data": report })))
}

/// Persists the multipart stream to a timestamp-prefixed temp path and hands
/// back its guard.
async fn store_upload(file_name: &str, data: &[u8]) -> Result<TempUpload, AppError> {
    let safe_name: String = file_name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let path = std::env::temp_dir().join(format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        safe_name
    ));
    tokio::fs::write(&path, data).await?;
    Ok(TempUpload { path })
}

// The body is taken as a raw Value so that a missing or non-array `data`
// field reaches the handler and surfaces as the 400 JSON error, instead of
// being rejected by a typed extractor with a 422.
#[axum::debug_handler]
async fn analyze_text(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let start = std::time::Instant::now();

    let (records, questions) = parse_text_request(&body)?;

    let report =
        pipeline::analyze_records(&records, questions.as_deref(), &state.agent, &state.config)
            .await?;

    tracing::info!("text analysis completed in {:?}", start.elapsed());
    Ok(Json(json!({ "success": true, "data": report })))
}

fn parse_text_request(body: &Value) -> Result<(Vec<Map<String, Value>>, Option<String>), AppError> {
    let invalid =
        || AppError::InvalidInput("Invalid data format. Expected array of objects.".to_string());

    let data = body.get("data").and_then(Value::as_array).ok_or_else(invalid)?;
    let records: Vec<Map<String, Value>> = data
        .iter()
        .map(|v| v.as_object().cloned())
        .collect::<Option<_>>()
        .ok_or_else(invalid)?;
    if records.is_empty() {
        return Err(invalid());
    }

    let questions = body.get("questions").and_then(Value::as_str).map(String::from);
    Ok((records, questions))
}
