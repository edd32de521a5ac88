use anyhow::{Context, Result};
use instrumentkb::app::server::{build_router, AppState};
use instrumentkb::infra::db;
use instrumentkb::infra::storage::FileStorage;
use instrumentkb::types::AppConfig;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 環境変数を読み込み（.envファイルがあれば使用）
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("設定の読み込みに失敗")?;

    let pool = db::setup_database()
        .await
        .context("データベースのセットアップに失敗")?;
    info!("データベース接続とマイグレーションが完了しました");

    let storage = FileStorage::new(config.storage_root.clone());
    storage
        .ensure_layout()
        .context("ストレージディレクトリの作成に失敗")?;
    info!(root = %config.storage_root.display(), "ファイルストレージを準備しました");

    let state = AppState { pool, storage };
    let router = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("アドレスのバインドに失敗: {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "InstrumentKBサーバーを起動します");

    axum::serve(listener, router)
        .await
        .context("サーバーの実行に失敗")?;

    Ok(())
}
