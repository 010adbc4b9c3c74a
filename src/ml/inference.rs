//! モデル推論機能

use std::path::Path;
use std::sync::Mutex;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};

use crate::error::{OralHealthError, Result};
use crate::ml::classifier::Classifier;
use crate::ml::input_tensor::InputTensor;
use crate::ml::ml_model::{ModelConfig, OralHealthClassifier};
use crate::model::config::{DeviceType, ModelSettings};
use crate::model::{load_model_with_metadata, InferenceConfig};

/// モデルの重みをバイト列にエンコード（f32精度）
pub fn encode_model<B: Backend>(model: OralHealthClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(&recorder, model.into_record(), ())
        .map_err(|e| OralHealthError::Model(format!("モデル重みの保存エラー: {:?}", e)))
}

/// 設定からモデルを初期化し、バイト列の重みを復元
pub fn decode_model<B: Backend>(
    config: &ModelConfig,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<OralHealthClassifier<B>> {
    let model = config.init::<B>(device)?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, model_binary, device)
        .map_err(|e| OralHealthError::Model(format!("モデル重みの読み込みエラー: {:?}", e)))?;
    Ok(model.load_record(record))
}

/// 推論エンジン
///
/// burnのモジュールは `Sync` ではないため、順伝播の間だけロックする
pub struct InferenceEngine<B: Backend> {
    model: Mutex<OralHealthClassifier<B>>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let archive = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&archive.metadata);

        let model_config = ModelConfig {
            num_classes: config.num_classes(),
            dropout: archive.metadata.dropout,
            image_size: config.model_input_size,
        };
        let model = decode_model::<B>(&model_config, archive.model_binary, &device)?;

        Ok(Self::from_model(model, config, device))
    }

    /// 学習済み（または初期化直後）のモデルから作成
    pub fn from_model(model: OralHealthClassifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model),
            config,
            device,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, OralHealthClassifier<B>>> {
        self.model
            .lock()
            .map_err(|_| OralHealthError::Model("モデルのロックに失敗しました".to_string()))
    }
}

impl<B: Backend> Classifier for InferenceEngine<B> {
    fn class_labels(&self) -> &[String] {
        &self.config.class_labels
    }

    fn input_size(&self) -> usize {
        self.config.model_input_size
    }

    fn predict(&self, input: &InputTensor) -> Result<Vec<f32>> {
        input.ensure_size(self.config.model_input_size)?;
        let tensor = input.to_tensor::<B>(&self.device);

        let probabilities = {
            let model = self.lock()?;
            model.forward_probabilities(tensor)
        };

        probabilities
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| OralHealthError::Model(format!("推論結果の取得エラー: {:?}", e)))
    }
}

/// 設定のデバイスでモデルを読み込み、設定のラベル集合と一致するか検証する
pub fn load_classifier(device_type: DeviceType, settings: &ModelSettings) -> Result<Box<dyn Classifier>> {
    let path = Path::new(&settings.model_path);
    // 重みを展開する前にメタデータだけで確認する
    InferenceConfig::load_from_model(path)?.ensure_matches(settings)?;

    let classifier: Box<dyn Classifier> = match device_type {
        DeviceType::Cpu => Box::new(InferenceEngine::<burn_ndarray::NdArray>::load(
            path,
            burn_ndarray::NdArrayDevice::Cpu,
        )?),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => Box::new(InferenceEngine::<burn_wgpu::Wgpu>::load(
            path,
            burn_wgpu::WgpuDevice::default(),
        )?),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            return Err(OralHealthError::Config(
                "wgpu フィーチャーなしでビルドされています".to_string(),
            ))
        }
    };

    Ok(classifier)
}
