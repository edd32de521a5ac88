use crate::types::{CatalogError, CatalogResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// 変数辞書エンティティ
/// 測定変数（温度、圧力など）の共有辞書。nameが自然キーで、
/// 記事の測定変数行からidで参照される（埋め込みコピーはしない）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VariableDict {
    pub id: i32,
    pub name: String,
    pub default_unit: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 変数辞書作成・アップサート用の入力
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDictInput {
    pub name: String,
    #[serde(default)]
    pub default_unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 変数辞書一覧をページネーション付きで取得する
pub async fn list_variables(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> CatalogResult<(Vec<VariableDict>, i64)> {
    let rows = sqlx::query_as::<_, VariableDict>(
        "SELECT id, name, default_unit, description, created_at
         FROM variables_dict ORDER BY name LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("変数辞書一覧取得", e))?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM variables_dict")
        .fetch_one(pool)
        .await
        .map_err(|e| CatalogError::database("変数辞書件数取得", e))?;

    Ok((rows, total))
}

/// 全変数辞書エントリをid順で取得する（エクスポート用）
pub async fn list_all_variables(pool: &PgPool) -> CatalogResult<Vec<VariableDict>> {
    sqlx::query_as::<_, VariableDict>(
        "SELECT id, name, default_unit, description, created_at
         FROM variables_dict ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("変数辞書全件取得", e))
}

/// 変数辞書エントリを新規作成する
pub async fn create_variable(
    pool: &PgPool,
    input: &VariableDictInput,
) -> CatalogResult<VariableDict> {
    if input.name.trim().is_empty() {
        return Err(CatalogError::validation("変数名は必須です"));
    }

    sqlx::query_as::<_, VariableDict>(
        "INSERT INTO variables_dict (name, default_unit, description)
         VALUES ($1, $2, $3)
         RETURNING id, name, default_unit, description, created_at",
    )
    .bind(&input.name)
    .bind(&input.default_unit)
    .bind(&input.description)
    .fetch_one(pool)
    .await
    .map_err(|e| CatalogError::from_sqlx("変数辞書作成", e))
}

/// 変数辞書エントリを自然キー（name）でアップサートし、idを返す
/// インポート時に埋め込みvariable.nameからvariable_idを解決する
pub async fn upsert_variable_by_name(
    tx: &mut Transaction<'_, Postgres>,
    input: &VariableDictInput,
) -> CatalogResult<i32> {
    let id: i32 = sqlx::query_scalar(
        "INSERT INTO variables_dict (name, default_unit, description)
         VALUES ($1, $2, $3)
         ON CONFLICT (name) DO UPDATE SET
             default_unit = EXCLUDED.default_unit,
             description = EXCLUDED.description
         RETURNING id",
    )
    .bind(&input.name)
    .bind(&input.default_unit)
    .bind(&input.description)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| CatalogError::from_sqlx("変数辞書アップサート", e))?;

    Ok(id)
}
