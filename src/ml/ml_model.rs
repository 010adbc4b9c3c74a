//! 機械学習モデルの共通定義
//!
//! 口腔内写真を分類するCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::OralHealthError;
use crate::model::config::ModelSettings;

/// 各畳み込み層のフィルタ数
pub const CONV_FILTERS: [usize; 3] = [32, 64, 64];

/// 全結合層のユニット数
pub const HIDDEN_UNITS: usize = 64;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

impl ModelConfig {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            num_classes: settings.num_classes(),
            dropout: settings.dropout,
            image_size: settings.input_size,
        }
    }

    /// 3段目の畳み込み後の特徴マップサイズ
    ///
    /// Conv(3x3, padding無し)で2減少、Pool(2x2)で半分（切り捨て）:
    /// size -> size-2 -> /2 -> -2 -> /2 -> -2
    pub fn feature_map_size(&self) -> Option<usize> {
        let after_conv1 = self.image_size.checked_sub(2)?;
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.checked_sub(2)?;
        let after_pool2 = after_conv2 / 2;
        let size = after_pool2.checked_sub(2)?;
        (size > 0).then_some(size)
    }

    /// Flatten後の特徴次元
    pub fn flatten_dim(&self) -> Option<usize> {
        self.feature_map_size().map(|s| CONV_FILTERS[2] * s * s)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<OralHealthClassifier<B>> {
        let d = self.flatten_dim().ok_or_else(|| {
            OralHealthError::Config(format!("入力サイズが小さすぎます: {}", self.image_size))
        })?;
        if self.num_classes == 0 {
            return Err(OralHealthError::Config("クラス数が0です".to_string()));
        }

        tracing::debug!(
            "[Model] 入力 {}x{} -> 特徴次元 {} -> FC {} -> {} クラス",
            self.image_size,
            self.image_size,
            d,
            HIDDEN_UNITS,
            self.num_classes
        );

        Ok(OralHealthClassifier {
            conv1: Conv2dConfig::new([3, CONV_FILTERS[0]], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([CONV_FILTERS[0], CONV_FILTERS[1]], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([CONV_FILTERS[1], CONV_FILTERS[2]], [3, 3]).init(device),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 口腔状態分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (32) + ReLU + MaxPool 2x2
/// - Conv 3x3 (64) + ReLU + MaxPool 2x2
/// - Conv 3x3 (64) + ReLU
/// - Flatten -> FC 64 + ReLU -> Dropout
/// - FC num_classes (-> Softmax)
///
/// ドロップアウトは自動微分バックエンドでのみ有効で、推論時は恒等写像になる
#[derive(Module, Debug)]
pub struct OralHealthClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,

    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> OralHealthClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の合計は1）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// ロジットに対する交差エントロピー（内部でlog-softmax）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    #[test]
    fn test_feature_map_size() {
        let config = ModelConfig::new(4);
        // 224 -> 222 -> 111 -> 109 -> 54 -> 52
        assert_eq!(config.feature_map_size(), Some(52));
        assert_eq!(config.flatten_dim(), Some(64 * 52 * 52));

        assert_eq!(ModelConfig::new(4).with_image_size(18).feature_map_size(), Some(1));
        assert_eq!(ModelConfig::new(4).with_image_size(17).feature_map_size(), None);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = ModelConfig::new(3).with_dropout(0.25).with_image_size(64);
        let json = serde_json::to_string(&config).unwrap();
        let restored: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.num_classes, 3);
        assert_eq!(restored.dropout, 0.25);
        assert_eq!(restored.image_size, 64);

        let partial: ModelConfig = serde_json::from_str(r#"{ "num_classes": 4 }"#).unwrap();
        assert_eq!(partial.image_size, 224);
        assert_eq!(partial.dropout, 0.5);
    }

    #[test]
    fn test_init_rejects_small_input() {
        let device = NdArrayDevice::Cpu;
        let result = ModelConfig::new(4).with_image_size(10).init::<TestBackend>(&device);
        assert!(matches!(result, Err(OralHealthError::Config(_))));
    }

    #[test]
    fn test_forward_shape_and_probabilities() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(4).with_image_size(32).init::<TestBackend>(&device).unwrap();

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device) * 0.5;
        assert_eq!(model.forward(images.clone()).dims(), [2, 4]);

        let probs = model
            .forward_probabilities(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        for row in probs.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }
}
