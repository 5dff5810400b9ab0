// HTTP surface: router, shared state and handlers

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{
    BatchResponse, PredictForm, ProcessOutcome, SingleResponse, UploadedFile,
};
use crate::orchestration::batch_orchestrator::BatchOrchestrator;
use crate::phases::RequestOrigin;
use crate::services::segmentation::LazyModel;
use crate::services::storage::Storage;
use crate::utils::image_ops::file_stem_sanitized;
use crate::utils::metrics::Metrics;

pub const PREDICT_PATH: &str = "/api/unet/predict/";
pub const DATASET_UPLOAD_PATH: &str = "/api/datasets/";

/// Storage namespace for uploaded dataset files
pub const DATASET_NAMESPACE: &str = "datasets";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub storage: Arc<dyn Storage>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Arc<Config>, storage: Arc<dyn Storage>, model: Arc<LazyModel>) -> Self {
        let metrics = Metrics::new();
        let orchestrator = Arc::new(BatchOrchestrator::new(
            &config,
            Arc::clone(&storage),
            model,
            metrics.clone(),
        ));
        Self {
            config,
            orchestrator,
            storage,
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let media_mount = state.config.storage.media_url.trim_end_matches('/').to_string();
    let media = ServeDir::new(state.config.media_root());
    let body_limit = state.config.max_upload_bytes();

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route(PREDICT_PATH, post(predict))
        .route(DATASET_UPLOAD_PATH, post(upload_dataset))
        .nest_service(&media_mount, media)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    "UNet Segmentation Gateway"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/health");
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": state.orchestrator.model_loaded(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Run segmentation on an upload, a zip archive or a stored dataset file
///
/// # Request Format:
/// - multipart/form-data
/// - `image` (or `file`): image or `.zip` archive
/// - `dataset_path` (or `datasetPath`, `data`): path returned by the dataset upload
/// - `scale_factor` (or `scaleFactor`), `threshold`: optional numbers
async fn predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> PipelineResult<Response> {
    state.metrics.record_endpoint_request(PREDICT_PATH);
    let start_time = std::time::Instant::now();

    let origin = request_origin(&state.config, &headers)?;
    let form = read_predict_form(multipart).await?;

    let outcome = state
        .orchestrator
        .process(form, &origin)
        .await
        .map_err(|e| {
            error!("Prediction failed: {}", e);
            e
        })?;

    info!(
        "Request completed in {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    Ok(match outcome {
        ProcessOutcome::Single { result_url } => Json(SingleResponse {
            message: "Prediction succeeded".to_string(),
            result_url,
        })
        .into_response(),
        ProcessOutcome::Batch(result) => Json(BatchResponse::from(result)).into_response(),
    })
}

/// Store an uploaded file under `datasets/` and return its reference
async fn upload_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> PipelineResult<Json<serde_json::Value>> {
    state.metrics.record_endpoint_request(DATASET_UPLOAD_PATH);

    let origin = request_origin(&state.config, &headers)?;
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            upload = Some(UploadedFile {
                filename,
                bytes: bytes.to_vec(),
            });
        }
    }
    let upload = upload
        .filter(|u| !u.bytes.is_empty())
        .ok_or(PipelineError::MissingInput)?;

    let stored = state
        .storage
        .store(&dataset_name(&upload.filename), &upload.bytes)
        .await?;
    let url = origin.absolute(&state.storage.url_for(&stored))?;
    info!("Stored dataset file {} ({} bytes)", stored, upload.bytes.len());

    Ok(Json(serde_json::json!({ "data": stored, "url": url })))
}

/// `datasets/<token>_<stem>.<ext>`
fn dataset_name(filename: &str) -> String {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!(
        "{}/{}_{}{}",
        DATASET_NAMESPACE,
        Uuid::new_v4().simple(),
        file_stem_sanitized(filename),
        extension
    )
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> PipelineError {
    PipelineError::InvalidParameter(format!("Malformed multipart body: {}", e))
}

/// Origin for absolute result URLs: `PUBLIC_BASE_URL`, else the request's Host header.
fn request_origin(config: &Config, headers: &HeaderMap) -> PipelineResult<RequestOrigin> {
    let origin = match &config.server.public_base_url {
        Some(base) => RequestOrigin::parse(base),
        None => {
            let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
            let scheme = header_str("x-forwarded-proto").unwrap_or("http");
            let host = header_str("x-forwarded-host")
                .or_else(|| header_str(header::HOST.as_str()))
                .unwrap_or("localhost");
            RequestOrigin::from_host(scheme, host)
        }
    };
    origin.map_err(|e| PipelineError::InvalidParameter(e.to_string()))
}

async fn read_predict_form(mut multipart: Multipart) -> PipelineResult<PredictForm> {
    let mut form = PredictForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "image" | "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                // Browsers send an empty part when no file was chosen
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                form.file = Some(UploadedFile {
                    filename: if filename.is_empty() {
                        "upload".to_string()
                    } else {
                        filename
                    },
                    bytes: bytes.to_vec(),
                });
            }
            "dataset_path" | "datasetPath" | "data" => {
                form.dataset_path = Some(field.text().await.map_err(multipart_error)?);
            }
            "scale_factor" | "scaleFactor" => {
                form.scale_factor = Some(field.text().await.map_err(multipart_error)?);
            }
            "threshold" => {
                form.threshold = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::archive::tests::build_zip;
    use crate::services::storage::LocalStorage;
    use crate::test_support::{brightness_model, png_bytes};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "unet-test-boundary";

    enum Part<'a> {
        File(&'a str, &'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(field, filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            field, filename
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(field, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field)
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn app() -> (TempDir, Router) {
        let media = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::with_media_root(media.path()));
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(media.path(), "/media/"));
        let state = AppState::new(config, storage, brightness_model());
        (media, router(state))
    }

    async fn post(app: Router, path: &str, parts: &[Part<'_>]) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::HOST, "testserver")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_predict_single_image() {
        let (_media, app) = app();
        let png = png_bytes(24, 12);
        let (status, body) = post(
            app,
            PREDICT_PATH,
            &[
                Part::File("image", "cat.jpg", &png),
                Part::Text("scaleFactor", "0.5"),
            ],
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let url = body["result_url"].as_str().unwrap();
        assert!(url.starts_with("http://testserver/media/temp/predict_cat_"));
        assert!(url.ends_with("_result.png"));
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_predict_batch_counts() {
        let (_media, app) = app();
        let png = png_bytes(8, 8);
        let archive = build_zip(&[
            ("a.png", png.as_slice()),
            ("b.txt", b"notes"),
            ("c.jpg", b"\xFF\xD8\xFF corrupt"),
        ]);

        let (status, body) = post(app, PREDICT_PATH, &[Part::File("file", "batch.zip", &archive)]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success_count"], 1);
        assert_eq!(body["failure_count"], 1);
        assert_eq!(body["result_urls"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_predict_error_statuses() {
        let (_media, app) = app();

        let (status, body) = post(app.clone(), PREDICT_PATH, &[Part::Text("threshold", "0.5")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = post(
            app.clone(),
            PREDICT_PATH,
            &[Part::Text("dataset_path", "datasets/missing.png")],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let png = png_bytes(4, 4);
        let (status, _) = post(
            app.clone(),
            PREDICT_PATH,
            &[Part::File("image", "a.png", &png), Part::Text("threshold", "2.0")],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(app, PREDICT_PATH, &[Part::File("image", "a.png", b"junk")]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_dataset_upload_then_predict() {
        let (_media, app) = app();
        let png = png_bytes(10, 10);

        let (status, body) = post(
            app.clone(),
            DATASET_UPLOAD_PATH,
            &[Part::File("file", "Lung Scan.PNG", &png)],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = body["data"].as_str().unwrap().to_string();
        assert!(data.starts_with("datasets/"));
        assert!(data.ends_with("_Lung_Scan.png"));
        assert!(body["url"].as_str().unwrap().starts_with("http://testserver/media/datasets/"));

        let (status, body) = post(app, PREDICT_PATH, &[Part::Text("datasetPath", &data)]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["result_url"].as_str().unwrap().contains("predict_"));
    }

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let (_media, app) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);
    }

    #[test]
    fn test_origin_prefers_public_base_url() {
        let mut config = Config::with_media_root("media");
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "internal:8000".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());

        let origin = request_origin(&config, &headers).unwrap();
        assert_eq!(origin.absolute("/media/x.png").unwrap(), "https://internal:8000/media/x.png");

        config.server.public_base_url = Some("https://seg.example.org".to_string());
        let origin = request_origin(&config, &headers).unwrap();
        assert_eq!(origin.absolute("/media/x.png").unwrap(), "https://seg.example.org/media/x.png");
    }
}
