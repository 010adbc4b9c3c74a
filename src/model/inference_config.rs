//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得し、
//! アプリケーション設定と食い違っていないかを検証します。

use std::path::Path;

use crate::error::{OralHealthError, Result};
use crate::model::config::ModelSettings;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// 分類ラベル（クラスID順）
    pub class_labels: Vec<String>,

    /// モデル入力解像度（正方形）
    pub model_input_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            model_input_size: metadata.model_input_size as usize,
        }
    }

    /// アプリケーション設定から作成（学習直後や未学習モデル用）
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            class_labels: settings.class_labels.clone(),
            model_input_size: settings.input_size,
        }
    }

    /// モデルファイルから推論設定を読み込む
    pub fn load_from_model(model_path: &Path) -> Result<Self> {
        let metadata = model_storage::load_metadata(model_path)?;
        Ok(Self::from_metadata(&metadata))
    }

    /// 全クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// モデルが設定のラベル集合・入力サイズで学習されたものか確認
    ///
    /// ラベル集合は設定ファイルの値が唯一の正とし、食い違いは起動エラーにする
    pub fn ensure_matches(&self, settings: &ModelSettings) -> Result<()> {
        if self.class_labels != settings.class_labels {
            return Err(OralHealthError::Model(format!(
                "モデルのラベル [{}] が設定のラベル [{}] と一致しません",
                self.class_labels.join(", "),
                settings.class_labels.join(", ")
            )));
        }
        if self.model_input_size != settings.input_size {
            return Err(OralHealthError::Model(format!(
                "モデルの入力サイズ {} が設定値 {} と一致しません",
                self.model_input_size, settings.input_size
            )));
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn print_info(&self) {
        tracing::info!("=== 推論設定 ===");
        tracing::info!("分類ラベル: {}", self.class_labels.join(", "));
        tracing::info!("モデル入力サイズ: {}x{}", self.model_input_size, self.model_input_size);
        tracing::info!("総クラス数: {}", self.num_classes());
    }
}
