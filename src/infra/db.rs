use crate::types::{CatalogError, CatalogResult, ConfigError};
use sqlx::PgPool;
use std::env;

/// データベース接続プールを作成
/// .envファイルからDATABASE_URLを読み込みます
pub async fn create_pool() -> CatalogResult<PgPool> {
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| CatalogError::from(ConfigError::missing_env_var("DATABASE_URL")))?;

    PgPool::connect(&database_url)
        .await
        .map_err(|e| CatalogError::database("データベース接続プール作成", e))
}

/// データベースの初期化（マイグレーション実行）
pub async fn initialize_database(pool: &PgPool) -> CatalogResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| CatalogError::database("データベースマイグレーション実行", e.into()))
}

/// プールの作成とデータベース初期化を一括で行う便利関数
pub async fn setup_database() -> CatalogResult<PgPool> {
    let pool = create_pool().await?;
    initialize_database(&pool).await?;
    Ok(pool)
}
