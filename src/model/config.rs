//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル、学習、画像補正、HTTPサーバーの設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{OralHealthError, Result};

/// 設定ファイルパスを指定する環境変数
pub const CONFIG_PATH_ENV: &str = "ORAL_HEALTH_CONFIG";
/// モデルパスを上書きする環境変数
pub const MODEL_PATH_ENV: &str = "ORAL_HEALTH_MODEL_PATH";
/// ポート番号を上書きする環境変数
pub const PORT_ENV: &str = "PORT";

/// 3段の畳み込み後に特徴マップが残る最小入力サイズ
pub const MIN_INPUT_SIZE: usize = 18;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 使用するモデルファイル（tar.gz）のパス
    pub model_path: String,
    /// 分類ラベル（順序がクラスIDになる）
    pub class_labels: Vec<String>,
    /// 入力画像サイズ（正方形）
    pub input_size: usize,
    /// ドロップアウト率（学習時のみ有効）
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/oral_health_classifier.tar.gz".to_string(),
            class_labels: vec![
                "Healthy".to_string(),
                "Caries".to_string(),
                "Gingivitis".to_string(),
                "Periodontal Disease".to_string(),
            ],
            input_size: 224,
            dropout: 0.5,
        }
    }
}

impl ModelSettings {
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }
}

/// データ拡張の範囲
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentationSettings {
    /// 回転角度の範囲（度）
    pub rotation_range: f32,
    /// 横方向シフト（幅に対する割合）
    pub width_shift_range: f32,
    /// 縦方向シフト（高さに対する割合）
    pub height_shift_range: f32,
    /// せん断角の範囲（度）
    pub shear_range: f32,
    /// ズーム範囲（1.0 ± zoom_range）
    pub zoom_range: f32,
    /// 左右反転を行うか
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// データ拡張（学習データのみ）
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            augmentation: AugmentationSettings::default(),
        }
    }
}

/// 画像補正（CLAHE）設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EnhancementSettings {
    /// コントラスト制限
    pub clip_limit: f32,
    /// タイル分割数（縦横同数）
    pub tile_grid: u32,
}

impl Default for EnhancementSettings {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 画像補正設定
    #[serde(default)]
    pub enhancement: EnhancementSettings,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス（環境変数で上書き可能）
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"))
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from(path: &Path) -> Self {
        let mut config = if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(&Self::default_path())
    }

    /// 環境変数による上書きを適用
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model_path) = std::env::var(MODEL_PATH_ENV) {
            self.model.model_path = model_path;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("{} の値が不正です: {}", PORT_ENV, port),
            }
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let labels = &self.model.class_labels;
        if labels.is_empty() {
            return Err(OralHealthError::Config("class_labels が空です".to_string()));
        }
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(OralHealthError::Config(format!("class_labels[{}] が空です", i)));
            }
            if labels[..i].contains(label) {
                return Err(OralHealthError::Config(format!("ラベルが重複しています: {}", label)));
            }
        }
        if self.model.input_size < MIN_INPUT_SIZE {
            return Err(OralHealthError::Config(format!(
                "input_size は {} 以上が必要です: {}",
                MIN_INPUT_SIZE, self.model.input_size
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(OralHealthError::Config(format!(
                "dropout は [0, 1) の範囲が必要です: {}",
                self.model.dropout
            )));
        }
        if self.training.batch_size == 0 {
            return Err(OralHealthError::Config("batch_size は 1 以上が必要です".to_string()));
        }
        if self.enhancement.clip_limit <= 0.0 || self.enhancement.tile_grid == 0 {
            return Err(OralHealthError::Config(
                "clip_limit と tile_grid は正の値が必要です".to_string(),
            ));
        }
        Ok(())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("モデルパス: {}", self.model.model_path);
        tracing::info!("分類ラベル: {}", self.model.class_labels.join(", "));
        tracing::info!("入力サイズ: {}x{}", self.model.input_size, self.model.input_size);
        tracing::info!(
            "CLAHE: clip_limit={}, tile_grid={}x{}",
            self.enhancement.clip_limit,
            self.enhancement.tile_grid,
            self.enhancement.tile_grid
        );
        tracing::info!("サーバー: {}:{}", self.server.host, self.server.port);
    }
}
