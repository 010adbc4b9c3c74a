//! 推論サーバー
//!
//! 起動時に設定とモデルを読み込み、`POST /process_oral_image` で待ち受けます。

use std::sync::Arc;

use anyhow::Context;
use oral_health_lib::enhance::ImageEnhancer;
use oral_health_lib::ml::load_classifier;
use oral_health_lib::model::config::AppConfig;
use oral_health_lib::service::PredictionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oral_health_lib::init_tracing();

    let config = AppConfig::load_or_default();
    config.validate().context("設定が不正です")?;
    config.display();

    let classifier = load_classifier(config.device_type, &config.model)
        .with_context(|| format!("モデルを読み込めませんでした: {}", config.model.model_path))?;
    tracing::info!("モデルを読み込みました: {}", config.model.model_path);

    let service = PredictionService::new(Arc::from(classifier), ImageEnhancer::new(&config.enhancement));
    oral_health_lib::server::serve(service, &config.server)
        .await
        .context("サーバーの実行に失敗しました")?;
    Ok(())
}
