use std::path::Path;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde::Serialize;

use crate::server::{ApiError, AppState};
use crate::service::PredictionResult;

/// アップロードを受け付ける拡張子（大文字小文字は区別しない）
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// フォームのファイルフィールド名
pub const IMAGE_FIELD: &str = "image";

pub const MSG_NO_IMAGE: &str = "No se ha enviado ninguna imagen";
pub const MSG_NO_FILE_SELECTED: &str = "No se ha seleccionado ningún archivo";
pub const MSG_DISALLOWED_TYPE: &str = "Tipo de archivo no permitido";

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub status: &'static str,
    pub result: PredictionResult,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn allowed_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.iter().any(|allowed| ext.eq_ignore_ascii_case(allowed)))
        .unwrap_or(false)
}

/// `image` フィールドのファイル名と中身を取り出す
async fn read_image_field(mut multipart: Multipart) -> Result<Option<(String, Vec<u8>)>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        // ファイルでないフォーム値は未送信として扱う
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        return Ok(Some((filename, bytes.to_vec())));
    }
    Ok(None)
}

/// POST /process_oral_image
pub async fn process_oral_image(
    State(service): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let multipart = multipart.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let Some((filename, bytes)) = read_image_field(multipart).await? else {
        return Err(ApiError::bad_request(MSG_NO_IMAGE));
    };
    if filename.is_empty() {
        return Err(ApiError::bad_request(MSG_NO_FILE_SELECTED));
    }
    if !allowed_file(&filename) {
        return Err(ApiError::bad_request(MSG_DISALLOWED_TYPE));
    }

    tracing::info!("画像を受信しました: {} ({} bytes)", filename, bytes.len());

    // デコード・補正・推論はCPUを占有するのでブロッキングスレッドで実行
    let result = tokio::task::spawn_blocking(move || service.process_image(&bytes))
        .await
        .map_err(|e| ApiError::internal(format!("推論タスクが異常終了しました: {}", e)))??;

    Ok(Json(SuccessResponse {
        status: "success",
        result,
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
