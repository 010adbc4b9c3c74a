//! HTTPエンドポイント

pub mod api_error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::model::config::ServerSettings;
use crate::service::PredictionService;

pub use api_error::ApiError;

pub type AppState = Arc<PredictionService>;

/// ルーターを構築
pub fn router(service: PredictionService, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/process_oral_image", post(handlers::process_oral_image))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(service))
}

/// 指定アドレスで待ち受けを開始し、終了まで処理する
pub async fn serve(service: PredictionService, settings: &ServerSettings) -> std::io::Result<()> {
    let app = router(service, settings.max_upload_bytes);
    let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    tracing::info!("サーバーを起動しました: http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhance::ImageEnhancer;
    use crate::error::OralHealthError;
    use crate::ml::{Classifier, InputTensor};
    use crate::service::prediction::tests::{encoded_image, StubClassifier};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use image::ImageFormat;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    const BOUNDARY: &str = "oralhealthboundary";

    fn app() -> (Router, Arc<StubClassifier>) {
        let stub = Arc::new(StubClassifier::new(vec![0.55, 0.25, 0.15, 0.05]));
        let service = PredictionService::new(stub.clone(), ImageEnhancer::default());
        (router(service, 16 * 1024 * 1024), stub)
    }

    /// 推論で必ず失敗する分類器
    struct FailingClassifier {
        labels: Vec<String>,
    }

    impl Classifier for FailingClassifier {
        fn class_labels(&self) -> &[String] {
            &self.labels
        }

        fn input_size(&self) -> usize {
            32
        }

        fn predict(&self, _input: &InputTensor) -> crate::error::Result<Vec<f32>> {
            Err(OralHealthError::Model("fallo del modelo".to_string()))
        }
    }

    fn multipart_body(field: &str, filename: Option<&str>, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    field, name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/process_oral_image")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, json) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_valid_jpeg_upload() {
        let (app, stub) = app();
        let image = encoded_image(512, 512, ImageFormat::Jpeg);
        let (status, json) = send(app, upload(multipart_body("image", Some("healthy_tooth.jpg"), &image))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        let predictions = json["result"]["predictions"].as_object().unwrap();
        assert_eq!(predictions.len(), 4);
        let sum: f64 = predictions.values().map(|v| v.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(json["result"]["top_class"], "Healthy");
        assert!(json["result"]["message"].as_str().unwrap().contains("Healthy"));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let (app, stub) = app();
        let (status, json) = send(app, upload(multipart_body("document", Some("a.jpg"), b"abc"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], handlers::MSG_NO_IMAGE);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_filename() {
        let (app, _) = app();
        let (status, json) = send(app, upload(multipart_body("image", Some(""), b""))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], handlers::MSG_NO_FILE_SELECTED);
    }

    #[tokio::test]
    async fn test_disallowed_extension() {
        let (app, stub) = app();
        let image = encoded_image(64, 64, ImageFormat::Png);
        let (status, json) = send(app, upload(multipart_body("image", Some("tooth.gif"), &image))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], handlers::MSG_DISALLOWED_TYPE);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_image_bytes_are_rejected() {
        let (app, stub) = app();
        let (status, json) = send(app, upload(multipart_body("image", Some("notes.jpg"), b"plain text notes"))).await;
        assert_ne!(status, StatusCode::OK);
        assert_eq!(json["status"], "failed");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_is_500() {
        let classifier = Arc::new(FailingClassifier {
            labels: vec!["Healthy".into(), "Caries".into()],
        });
        let app = router(PredictionService::new(classifier, ImageEnhancer::default()), 16 * 1024 * 1024);
        let image = encoded_image(64, 64, ImageFormat::Png);
        let (status, json) = send(app, upload(multipart_body("image", Some("tooth.png"), &image))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["status"], "failed");
        assert!(json["error"].as_str().unwrap().contains("fallo del modelo"));
    }

    #[tokio::test]
    async fn test_not_multipart() {
        let (app, _) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/process_oral_image")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, json) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "failed");
    }
}
