//! モデル学習
//!
//! クラスごとのサブディレクトリに分けた画像から学習・検証データを読み込み、
//! Adam + 交差エントロピーで学習します。エポックごとの損失と精度を履歴として返します。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    train::ClassificationOutput,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{OralHealthError, Result};
use crate::ml::augment::Augmenter;
use crate::ml::inference::{decode_model, encode_model};
use crate::ml::input_tensor::{resize_to, InputTensor, CHANNELS};
use crate::ml::ml_model::{ModelConfig, OralHealthClassifier};
use crate::model::config::AppConfig;
use crate::model::model_metadata::{EpochMetrics, ModelMetadata};
use crate::model::model_storage::{save_model_with_metadata, ModelArchive};

/// 学習データとして扱う拡張子
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// ディレクトリ構成 `<root>/<label>/*.png` の画像データセット（パスのみ保持）
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<(PathBuf, usize)>,
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// 指定されたラベル順序でディレクトリから読み込む
    ///
    /// ラベル名のディレクトリが無いクラスは警告のみ。1枚も見つからなければ `EmptyDataset`
    pub fn from_directory_with_order(data_dir: &Path, class_order: &[String]) -> Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut class_samples = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                let is_image = path
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_lowercase())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
                if path.is_file() && is_image {
                    // デコードできない画像はここでエラーにする
                    image::image_dimensions(&path)
                        .map_err(|e| OralHealthError::Decode(format!("{}: {}", path.display(), e)))?;
                    class_samples.push((path, class_id));
                }
            }
            // read_dir の順序はOS依存なので固定する
            class_samples.sort();
            tracing::info!("  クラス '{}': {} 枚", class_name, class_samples.len());
            samples.extend(class_samples);
        }

        if samples.is_empty() {
            return Err(OralHealthError::EmptyDataset(data_dir.display().to_string()));
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 画像を読み込んでモデル入力サイズにリサイズ
pub fn load_training_image(path: &Path, image_size: usize) -> Result<image::RgbImage> {
    let image = image::open(path)
        .map_err(|e| OralHealthError::Decode(format!("{}: {}", path.display(), e)))?
        .to_rgb8();
    Ok(resize_to(&image, image_size))
}

/// バッチャー
///
/// 学習用は拡張器を持ち、検証用は正規化のみ行う
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmenter: Option<Augmenter>,
    rng: Arc<Mutex<StdRng>>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmenter: None,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
        }
    }

    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64) -> Self {
        self.augmenter = Some(augmenter);
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    fn prepare(&self, item: &ImageItem) -> Result<InputTensor> {
        let image = load_training_image(&item.path, self.image_size)?;
        let image = match &self.augmenter {
            Some(augmenter) => {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| OralHealthError::Model("乱数生成器のロックに失敗しました".to_string()))?;
                augmenter.augment(&image, &mut *rng)
            }
            None => image,
        };
        Ok(InputTensor::from_rgb(&image))
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * CHANNELS * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.prepare(&item) {
                Ok(tensor) => all_pixels.extend_from_slice(tensor.as_slice()),
                Err(e) => {
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(CHANNELS * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, CHANNELS, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// エポック内の損失・正解数の集計
#[derive(Debug, Default, Clone, Copy)]
struct EpochAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
    batches: usize,
}

impl EpochAccumulator {
    fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size] = output.targets.dims();
        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let correct = output
            .output
            .clone()
            .argmax(1)
            .reshape([batch_size])
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss;
        self.correct += correct as usize;
        self.samples += batch_size;
        self.batches += 1;
    }

    fn loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// 1エポックあたりのステップ数（端数バッチは使わない）
pub fn steps_per_epoch(split: &str, samples: usize, batch_size: usize) -> Result<usize> {
    let steps = samples / batch_size.max(1);
    if steps == 0 {
        return Err(OralHealthError::InsufficientSamples {
            split: split.to_string(),
            samples,
            batch_size,
        });
    }
    Ok(steps)
}

/// 学習結果
pub struct TrainingOutcome<B: Backend> {
    /// 学習済みモデル（自動微分なしのバックエンド）
    pub model: OralHealthClassifier<B>,
    /// Adamの状態（BinBytesRecorderでエンコード済み）
    pub optimizer_state: Vec<u8>,
    /// 今回の学習を含む全履歴
    pub history: Vec<EpochMetrics>,
}

impl<B: Backend> TrainingOutcome<B> {
    /// モデル・メタデータ・オプティマイザ状態をtar.gzに保存
    pub fn save(&self, output_path: &Path, config: &AppConfig) -> Result<PathBuf> {
        let model_binary = encode_model(self.model.clone())?;
        let metadata = ModelMetadata::new(
            config.model.class_labels.clone(),
            config.model.input_size as u32,
            config.model.dropout,
            self.history.clone(),
        );
        save_model_with_metadata(output_path, &metadata, &model_binary, Some(&self.optimizer_state))
    }
}

/// モデル学習を実行
///
/// `resume_from` を指定すると重みとAdamの状態を復元して学習を続ける
pub fn train_model<B: AutodiffBackend>(
    config: &AppConfig,
    train_dir: &Path,
    validation_dir: &Path,
    num_epochs: usize,
    resume_from: Option<&ModelArchive>,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    config.validate()?;
    let labels = &config.model.class_labels;
    let image_size = config.model.input_size;
    let settings = &config.training;
    let batch_size = settings.batch_size;

    tracing::info!("全クラス順序 ({}個): {}", labels.len(), labels.join(", "));

    tracing::info!("学習データ: {}", train_dir.display());
    let dataset_train = ImageFolderDataset::from_directory_with_order(train_dir, labels)?;
    tracing::info!("検証データ: {}", validation_dir.display());
    let dataset_valid = ImageFolderDataset::from_directory_with_order(validation_dir, labels)?;

    for (label, (train, valid)) in labels
        .iter()
        .zip(dataset_train.class_counts().into_iter().zip(dataset_valid.class_counts()))
    {
        if train == 0 || valid == 0 {
            tracing::warn!("クラス '{}' の画像がありません (学習 {}, 検証 {})", label, train, valid);
        }
    }

    let train_steps = steps_per_epoch("train", dataset_train.len(), batch_size)?;
    let valid_steps = steps_per_epoch("validation", dataset_valid.len(), batch_size)?;
    tracing::info!(
        "学習 {} 枚 ({} steps), 検証 {} 枚 ({} steps), バッチサイズ {}",
        dataset_train.len(),
        train_steps,
        dataset_valid.len(),
        valid_steps,
        batch_size
    );

    let model_config = ModelConfig::from_settings(&config.model);
    let mut model: OralHealthClassifier<B> = model_config.init(device)?;
    let mut optim = AdamConfig::new().init::<B, OralHealthClassifier<B>>();
    let mut history = Vec::new();
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();

    if let Some(archive) = resume_from {
        crate::model::InferenceConfig::from_metadata(&archive.metadata).ensure_matches(&config.model)?;
        model = decode_model(&model_config, archive.model_binary.clone(), device)?;
        if let Some(state) = &archive.optimizer_binary {
            let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, state.clone(), device)
                .map_err(|e| OralHealthError::Model(format!("オプティマイザ状態の読み込みエラー: {:?}", e)))?;
            optim = optim.load_record(record);
        }
        history = archive.metadata.history.clone();
        tracing::info!("既存モデルから学習を再開します（{} エポック学習済み）", history.len());
    }
    tracing::info!("モデルパラメータ数: {}", model.num_params());

    let batcher_train = ImageBatcher::<B>::new(device.clone(), image_size)
        .with_augmentation(Augmenter::new(settings.augmentation.clone()), settings.seed);
    let batcher_valid = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size);

    // 学習用はエポックごとにシャッフル
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(batch_size)
        .shuffle(settings.seed)
        .num_workers(0)
        .build(dataset_train);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(batch_size)
        .num_workers(0)
        .build(dataset_valid);

    let first_epoch = history.len() + 1;
    tracing::info!("学習を開始します: エポック数 {}, 学習率 {}", num_epochs, settings.learning_rate);

    for epoch in first_epoch..first_epoch + num_epochs {
        let mut train_acc = EpochAccumulator::default();
        for batch in dataloader_train.iter().take(train_steps) {
            let output = model.forward_classification(batch.images, batch.targets);
            train_acc.update(&output);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let model_valid = model.valid();
        let mut valid_acc = EpochAccumulator::default();
        for batch in dataloader_valid.iter().take(valid_steps) {
            let output = model_valid.forward_classification(batch.images, batch.targets);
            valid_acc.update(&output);
        }

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_acc.loss(),
            train_accuracy: train_acc.accuracy(),
            valid_loss: valid_acc.loss(),
            valid_accuracy: valid_acc.accuracy(),
        };
        tracing::info!(
            "エポック {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4}",
            epoch - first_epoch + 1,
            num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.valid_loss,
            metrics.valid_accuracy
        );
        history.push(metrics);
    }

    let optimizer_state = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(&recorder, optim.to_record(), ())
        .map_err(|e| OralHealthError::Model(format!("オプティマイザ状態の保存エラー: {:?}", e)))?;

    Ok(TrainingOutcome {
        model: model.valid(),
        optimizer_state,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};

    fn labels() -> Vec<String> {
        vec!["Healthy".to_string(), "Caries".to_string()]
    }

    fn write_images(root: &Path, label: &str, count: usize, color: [u8; 3]) {
        let dir = root.join(label);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let image = RgbImage::from_fn(30, 26, |x, y| {
                let noise = ((x * 7 + y * 3 + i as u32 * 11) % 20) as u8;
                Rgb([color[0].saturating_add(noise), color[1], color[2].saturating_add(noise)])
            });
            image.save(dir.join(format!("img_{}.png", i))).unwrap();
        }
    }

    #[test]
    fn test_dataset_uses_label_order_and_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Caries", 2, [200, 40, 40]);
        write_images(dir.path(), "Healthy", 3, [230, 200, 200]);
        std::fs::write(dir.path().join("Healthy/notes.txt"), "x").unwrap();

        let dataset = ImageFolderDataset::from_directory_with_order(dir.path(), &labels()).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.class_counts(), vec![3, 2]);
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert_eq!(dataset.get(4).unwrap().label, 1);
        assert!(dataset.get(5).is_none());
    }

    #[test]
    fn test_empty_directory_is_empty_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Healthy")).unwrap();
        let err = ImageFolderDataset::from_directory_with_order(dir.path(), &labels()).unwrap_err();
        assert!(matches!(err, OralHealthError::EmptyDataset(_)));
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Caries", 2, [200, 40, 40]);
        std::fs::create_dir_all(dir.path().join("Healthy")).unwrap();
        std::fs::write(dir.path().join("Healthy/broken.png"), b"not a png").unwrap();

        let err = ImageFolderDataset::from_directory_with_order(dir.path(), &labels()).unwrap_err();
        match err {
            OralHealthError::Decode(msg) => assert!(msg.contains("broken.png")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_steps_per_epoch_floors() {
        assert_eq!(steps_per_epoch("train", 100, 32).unwrap(), 3);
        assert_eq!(steps_per_epoch("train", 64, 32).unwrap(), 2);
        assert!(matches!(
            steps_per_epoch("validation", 31, 32),
            Err(OralHealthError::InsufficientSamples { .. })
        ));
    }

    #[test]
    fn test_batcher_shapes_and_range() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Healthy", 3, [10, 20, 30]);
        let items: Vec<ImageItem> = (0..3)
            .map(|i| ImageItem {
                path: dir.path().join(format!("Healthy/img_{}.png", i)),
                label: 0,
            })
            .collect();

        let device = NdArrayDevice::Cpu;
        let batcher = ImageBatcher::<NdArray>::new(NdArrayDevice::Cpu, 20)
            .with_augmentation(Augmenter::new(Default::default()), 1);
        let batch = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 3, 20, 20]);
        assert_eq!(batch.targets.dims(), [3]);

        let values = batch.images.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_train_and_resume_history() {
        let train_dir = tempfile::tempdir().unwrap();
        let valid_dir = tempfile::tempdir().unwrap();
        for root in [train_dir.path(), valid_dir.path()] {
            write_images(root, "Healthy", 2, [230, 200, 200]);
            write_images(root, "Caries", 2, [90, 40, 30]);
        }

        let mut config = AppConfig::default();
        config.model.class_labels = labels();
        config.model.input_size = 20;
        config.training.batch_size = 2;

        let device = NdArrayDevice::Cpu;
        let outcome = train_model::<Autodiff<NdArray>>(&config, train_dir.path(), valid_dir.path(), 2, None, &device)
            .unwrap();
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history[1].epoch, 2);
        assert!(outcome.history.iter().all(|m| m.train_loss.is_finite() && m.valid_loss.is_finite()));
        assert!(!outcome.optimizer_state.is_empty());

        let out_dir = tempfile::tempdir().unwrap();
        let path = outcome.save(&out_dir.path().join("model.tar.gz"), &config).unwrap();
        let archive = crate::model::load_model_with_metadata(&path).unwrap();
        assert_eq!(archive.metadata.num_epochs, 2);

        let resumed = train_model::<Autodiff<NdArray>>(
            &config,
            train_dir.path(),
            valid_dir.path(),
            1,
            Some(&archive),
            &device,
        )
        .unwrap();
        assert_eq!(resumed.history.len(), 3);
        assert_eq!(resumed.history[2].epoch, 3);
    }

    #[test]
    fn test_train_rejects_batch_larger_than_split() {
        let train_dir = tempfile::tempdir().unwrap();
        write_images(train_dir.path(), "Healthy", 3, [230, 200, 200]);

        let mut config = AppConfig::default();
        config.model.class_labels = labels();
        config.model.input_size = 20;

        let device = NdArrayDevice::Cpu;
        let result = train_model::<Autodiff<NdArray>>(&config, train_dir.path(), train_dir.path(), 1, None, &device);
        assert!(matches!(result, Err(OralHealthError::InsufficientSamples { .. })));
    }
}
