//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。

use serde::{Deserialize, Serialize};

use crate::error::{OralHealthError, Result};

/// 1エポック分の学習結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
/// - optimizer.bin: Adamの状態（学習再開用、任意）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 分類ラベル（インデックス順）
    /// 例: ["Healthy", "Caries", "Gingivitis", "Periodontal Disease"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    pub model_input_size: u32,

    /// 学習時のドロップアウト率
    pub dropout: f64,

    /// 累計の学習エポック数
    pub num_epochs: u32,

    /// エポックごとの学習履歴
    #[serde(default)]
    pub history: Vec<EpochMetrics>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        model_input_size: u32,
        dropout: f64,
        history: Vec<EpochMetrics>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            model_input_size,
            dropout,
            num_epochs: history.len() as u32,
            history,
            trained_at,
        }
    }

    /// 最終エポックの結果
    pub fn last_epoch(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OralHealthError::Model(format!("metadata.json が不正です: {}", e)))
    }
}
