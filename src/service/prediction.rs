//! 1リクエスト分の推論パイプライン
//!
//! デコード -> CLAHE補正 -> リサイズ・正規化 -> 推論 -> 最大確率クラスの選択

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::enhance::ImageEnhancer;
use crate::error::{OralHealthError, Result};
use crate::ml::{Classifier, InputTensor};

/// 推論結果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PredictionResult {
    /// 全ラベルの確率
    pub predictions: BTreeMap<String, f32>,
    pub top_class: String,
    pub top_confidence: f32,
    pub message: String,
}

impl PredictionResult {
    /// 確率分布から結果を組み立てる（同率の場合は先頭のラベル）
    pub fn from_distribution(labels: &[String], probabilities: &[f32]) -> Result<Self> {
        if labels.len() != probabilities.len() || labels.is_empty() {
            return Err(OralHealthError::Model(format!(
                "ラベル数と出力数が一致しません: {} != {}",
                labels.len(),
                probabilities.len()
            )));
        }

        let (top_index, top_confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        let top_class = labels[top_index].clone();

        let predictions = labels
            .iter()
            .cloned()
            .zip(probabilities.iter().copied())
            .collect();

        Ok(Self {
            message: format!("Predicción: {} (confianza: {:.2}%)", top_class, top_confidence * 100.0),
            predictions,
            top_class,
            top_confidence,
        })
    }
}

/// 推論サービス
///
/// 起動時に一度だけ構築し、ハンドラから共有参照で使う
#[derive(Clone)]
pub struct PredictionService {
    classifier: Arc<dyn Classifier>,
    enhancer: ImageEnhancer,
}

impl PredictionService {
    pub fn new(classifier: Arc<dyn Classifier>, enhancer: ImageEnhancer) -> Self {
        Self { classifier, enhancer }
    }

    /// エンコード済み画像を分類する
    pub fn process_image(&self, bytes: &[u8]) -> Result<PredictionResult> {
        if bytes.is_empty() {
            return Err(OralHealthError::InvalidImage("el archivo está vacío".to_string()));
        }
        let decoded = image::load_from_memory(bytes).map_err(|e| OralHealthError::InvalidImage(e.to_string()))?;
        tracing::debug!("画像をデコードしました: {}x{}", decoded.width(), decoded.height());

        // グレースケール・アルファ付きの画像もRGBとして扱う
        let enhanced = self.enhancer.enhance_rgb(&decoded.to_rgb8());
        let input = InputTensor::from_image(&enhanced, self.classifier.input_size());
        let probabilities = self.classifier.predict(&input)?;

        let result = PredictionResult::from_distribution(self.classifier.class_labels(), &probabilities)?;
        tracing::info!("{}", result.message);
        Ok(result)
    }

    /// ファイルから読み込んで分類する
    pub fn process_path<P: AsRef<Path>>(&self, path: P) -> Result<PredictionResult> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| OralHealthError::InvalidImage(format!("{}: {}", path.display(), e)))?;
        self.process_image(&bytes)
    }
}
