//! 推論側から見た分類器のインターフェース

use crate::error::Result;
use crate::ml::input_tensor::InputTensor;

/// 固定サイズの入力画像をラベル上の確率分布に写像する分類器
///
/// 読み込み後は不変で、複数のリクエストから共有して呼び出せること
pub trait Classifier: Send + Sync {
    /// クラスID順のラベル
    fn class_labels(&self) -> &[String];

    /// 入力画像サイズ（正方形）
    fn input_size(&self) -> usize;

    /// 各ラベルの確率（長さはラベル数、合計1）
    ///
    /// 入力サイズが一致しない場合は `ShapeMismatch`
    fn predict(&self, input: &InputTensor) -> Result<Vec<f32>>;
}
