//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル、入力サイズ、学習履歴）
//! - model.bin       - モデルの重み（バイナリ）
//! - optimizer.bin   - オプティマイザの状態（任意）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{OralHealthError, Result};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

/// tar.gzから読み込んだモデル一式
#[derive(Debug, Clone)]
pub struct ModelArchive {
    pub metadata: ModelMetadata,
    pub model_binary: Vec<u8>,
    pub optimizer_binary: Option<Vec<u8>>,
}

/// 保存先パスを正規化（.gzで終わらない場合は .tar.gz を付与）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返す
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer_binary) = optimizer_binary {
        append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer_binary)?;
    }

    // gzipストリームまで確実に閉じる
    tar_builder.into_inner()?.finish()?;

    Ok(tar_gz_path)
}

/// 指定した名前のエントリを読み出す
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| {
        OralHealthError::Model(format!("モデルファイルを開けません {}: {}", tar_gz_path.display(), e))
    })?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(Some(buffer));
        }
    }
    Ok(None)
}

fn missing(name: &str) -> OralHealthError {
    OralHealthError::Model(format!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?.ok_or_else(|| missing(METADATA_ENTRY))?;
    let json = String::from_utf8(bytes)
        .map_err(|e| OralHealthError::Model(format!("metadata.json is not UTF-8: {}", e)))?;
    ModelMetadata::from_json_string(&json)
}

/// メタデータ・モデル・オプティマイザ状態をまとめて読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<ModelArchive> {
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| {
        OralHealthError::Model(format!("モデルファイルを開けません {}: {}", tar_gz_path.display(), e))
    })?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;
    let mut optimizer_binary: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();

        match path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            OPTIMIZER_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                optimizer_binary = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(model_binary)) => Ok(ModelArchive {
            metadata,
            model_binary,
            optimizer_binary,
        }),
        (None, _) => Err(missing(METADATA_ENTRY)),
        (_, None) => Err(missing(MODEL_ENTRY)),
    }
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("分類ラベル: {}", metadata.class_labels.join(", "));
    tracing::info!(
        "モデル入力サイズ: {}x{}",
        metadata.model_input_size,
        metadata.model_input_size
    );
    tracing::info!("ドロップアウト率: {}", metadata.dropout);
    tracing::info!("学習エポック数: {}", metadata.num_epochs);
    if let Some(last) = metadata.last_epoch() {
        tracing::info!(
            "最終エポック: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4}",
            last.train_loss,
            last.train_accuracy,
            last.valid_loss,
            last.valid_accuracy
        );
    }
    tracing::info!("学習日時: {}", metadata.trained_at);
}
