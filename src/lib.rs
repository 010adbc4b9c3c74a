//! 口腔内写真の状態分類
//!
//! CLAHEによる画像補正、CNNによる分類、HTTPエンドポイントを提供します。

pub mod enhance;
pub mod error;
pub mod ml;
pub mod model;
pub mod server;
pub mod service;

pub use error::{OralHealthError, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログ出力を初期化（`RUST_LOG` 未設定時は info）
///
/// 既に初期化済みの場合は何もしない
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
