//! 学習CLI
//!
//! クラス名のサブディレクトリを持つ学習・検証ディレクトリからモデルを学習し、
//! tar.gzアーカイブとして保存します。

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use oral_health_lib::ml::{train_model, TrainingOutcome};
use oral_health_lib::model::config::{AppConfig, DeviceType};
use oral_health_lib::model::{load_model_with_metadata, EpochMetrics, ModelArchive};

#[derive(Debug, Parser)]
#[command(name = "oral-health-train", about = "口腔内写真分類モデルの学習")]
struct Args {
    /// 学習データのディレクトリ
    #[arg(long)]
    train_dir: PathBuf,

    /// 検証データのディレクトリ
    #[arg(long)]
    validation_dir: PathBuf,

    /// エポック数（省略時は設定値）
    #[arg(long)]
    epochs: Option<usize>,

    /// 出力先（省略時は設定のモデルパス）
    #[arg(long)]
    output: Option<PathBuf>,

    /// 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// 既存のモデルから学習を再開する
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn run<B: AutodiffBackend>(
    config: &AppConfig,
    args: &Args,
    num_epochs: usize,
    resume: Option<&ModelArchive>,
    device: B::Device,
) -> anyhow::Result<TrainingOutcome<B::InnerBackend>> {
    let outcome = train_model::<B>(config, &args.train_dir, &args.validation_dir, num_epochs, resume, &device)?;
    Ok(outcome)
}

fn print_history(history: &[EpochMetrics]) {
    println!("{:>5} {:>10} {:>10} {:>10} {:>10}", "epoch", "loss", "acc", "val_loss", "val_acc");
    for m in history {
        println!(
            "{:>5} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            m.epoch, m.train_loss, m.train_accuracy, m.valid_loss, m.valid_accuracy
        );
    }
}

fn main() -> anyhow::Result<()> {
    oral_health_lib::init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("設定ファイルを読み込めませんでした: {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    config.validate()?;
    config.display();

    let num_epochs = args.epochs.unwrap_or(config.training.num_epochs);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.model.model_path));

    let resume = args
        .resume
        .as_deref()
        .map(|path: &Path| {
            load_model_with_metadata(path)
                .with_context(|| format!("再開用モデルを読み込めませんでした: {}", path.display()))
        })
        .transpose()?;

    let (model_path, history) = match config.device_type {
        DeviceType::Cpu => {
            type B = burn_autodiff::Autodiff<burn_ndarray::NdArray>;
            let outcome = run::<B>(&config, &args, num_epochs, resume.as_ref(), burn_ndarray::NdArrayDevice::Cpu)?;
            (outcome.save(&output, &config)?, outcome.history)
        }
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            type B = burn_autodiff::Autodiff<burn_wgpu::Wgpu>;
            let outcome = run::<B>(&config, &args, num_epochs, resume.as_ref(), burn_wgpu::WgpuDevice::default())?;
            (outcome.save(&output, &config)?, outcome.history)
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => anyhow::bail!("wgpu フィーチャーなしでビルドされています"),
    };

    print_history(&history);
    tracing::info!("モデルを保存しました: {}", model_path.display());
    Ok(())
}
