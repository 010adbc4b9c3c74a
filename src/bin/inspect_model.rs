//! 学習済みモデルのメタデータを表示する

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use oral_health_lib::model::config::AppConfig;
use oral_health_lib::model::{load_metadata, print_metadata_info, InferenceConfig};

#[derive(Debug, Parser)]
#[command(name = "inspect_model", about = "モデルアーカイブの内容を表示")]
struct Args {
    /// モデルファイル（省略時は設定のパス）
    model_path: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    oral_health_lib::init_tracing();
    let args = Args::parse();

    let config = AppConfig::load_or_default();
    let model_path = args
        .model_path
        .unwrap_or_else(|| PathBuf::from(&config.model.model_path));

    let metadata = load_metadata(&model_path)
        .with_context(|| format!("メタデータを読み込めませんでした: {}", model_path.display()))?;
    print_metadata_info(&metadata);

    let inference_config = InferenceConfig::from_metadata(&metadata);
    inference_config.print_info();
    match inference_config.ensure_matches(&config.model) {
        Ok(()) => tracing::info!("✓ 設定のラベル・入力サイズと一致しています"),
        Err(e) => tracing::warn!("✗ {}", e),
    }
    Ok(())
}
