use crate::types::{CatalogError, CatalogResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// メーカーエンティティ
/// 記事からはidで参照される独立エンティティ。nameが自然キー
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Manufacturer {
    pub id: i32,
    pub name: String,
    pub country: Option<String>,
    pub website: Option<String>,
    pub contact_email: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// メーカー作成・アップサート用の入力
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManufacturerInput {
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// メーカーを1件取得する
pub async fn get_manufacturer(pool: &PgPool, id: i32) -> CatalogResult<Option<Manufacturer>> {
    sqlx::query_as::<_, Manufacturer>(
        "SELECT id, name, country, website, contact_email, notes, created_at
         FROM manufacturers WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| CatalogError::database("メーカー取得", e))
}

/// メーカー一覧をページネーション付きで取得する
pub async fn list_manufacturers(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> CatalogResult<(Vec<Manufacturer>, i64)> {
    let rows = sqlx::query_as::<_, Manufacturer>(
        "SELECT id, name, country, website, contact_email, notes, created_at
         FROM manufacturers ORDER BY name LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("メーカー一覧取得", e))?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manufacturers")
        .fetch_one(pool)
        .await
        .map_err(|e| CatalogError::database("メーカー件数取得", e))?;

    Ok((rows, total))
}

/// 全メーカーをid順で取得する（エクスポート用）
pub async fn list_all_manufacturers(pool: &PgPool) -> CatalogResult<Vec<Manufacturer>> {
    sqlx::query_as::<_, Manufacturer>(
        "SELECT id, name, country, website, contact_email, notes, created_at
         FROM manufacturers ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("メーカー全件取得", e))
}

/// メーカーを新規作成する。name重複は一意制約違反として返る
pub async fn create_manufacturer(
    pool: &PgPool,
    input: &ManufacturerInput,
) -> CatalogResult<Manufacturer> {
    if input.name.trim().is_empty() {
        return Err(CatalogError::validation("メーカー名は必須です"));
    }

    sqlx::query_as::<_, Manufacturer>(
        "INSERT INTO manufacturers (name, country, website, contact_email, notes)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id, name, country, website, contact_email, notes, created_at",
    )
    .bind(&input.name)
    .bind(&input.country)
    .bind(&input.website)
    .bind(&input.contact_email)
    .bind(&input.notes)
    .fetch_one(pool)
    .await
    .map_err(|e| CatalogError::from_sqlx("メーカー作成", e))
}

/// メーカーを自然キー（name）でアップサートし、idを返す
///
/// インポート時に埋め込みメーカーを解決するための操作。
/// 既存行がある場合は属性を上書き更新する。
pub async fn upsert_manufacturer_by_name(
    tx: &mut Transaction<'_, Postgres>,
    input: &ManufacturerInput,
) -> CatalogResult<i32> {
    let id: i32 = sqlx::query_scalar(
        "INSERT INTO manufacturers (name, country, website, contact_email, notes)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (name) DO UPDATE SET
             country = EXCLUDED.country,
             website = EXCLUDED.website,
             contact_email = EXCLUDED.contact_email,
             notes = EXCLUDED.notes
         RETURNING id",
    )
    .bind(&input.name)
    .bind(&input.country)
    .bind(&input.website)
    .bind(&input.contact_email)
    .bind(&input.notes)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| CatalogError::from_sqlx("メーカーアップサート", e))?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // データ永続化・DB操作系テスト
    mod storage {
        use super::*;

        #[sqlx::test]
        async fn test_create_and_get(pool: PgPool) -> Result<(), anyhow::Error> {
            let input = ManufacturerInput {
                name: "Sea-Bird Scientific".to_string(),
                country: Some("US".to_string()),
                website: Some("https://www.seabird.com".to_string()),
                contact_email: None,
                notes: None,
            };
            let created = create_manufacturer(&pool, &input).await?;
            assert_eq!(created.name, "Sea-Bird Scientific");

            let fetched = get_manufacturer(&pool, created.id).await?;
            assert!(fetched.is_some(), "作成したメーカーが取得できない");

            Ok(())
        }

        #[sqlx::test]
        async fn test_duplicate_name_is_conflict(pool: PgPool) -> Result<(), anyhow::Error> {
            let input = ManufacturerInput {
                name: "Aanderaa".to_string(),
                country: None,
                website: None,
                contact_email: None,
                notes: None,
            };
            create_manufacturer(&pool, &input).await?;

            // 同名での作成は一意制約違反として分類される
            let result = create_manufacturer(&pool, &input).await;
            match result {
                Err(e) => assert!(e.is_conflict(), "Conflictではないエラー: {}", e),
                Ok(_) => panic!("重複作成が成功してしまった"),
            }

            Ok(())
        }

        #[sqlx::test]
        async fn test_upsert_by_name_is_idempotent(pool: PgPool) -> Result<(), anyhow::Error> {
            let mut input = ManufacturerInput {
                name: "Vaisala".to_string(),
                country: Some("FI".to_string()),
                website: None,
                contact_email: None,
                notes: None,
            };

            let mut tx = pool.begin().await?;
            let first_id = upsert_manufacturer_by_name(&mut tx, &input).await?;
            tx.commit().await?;

            // 2回目は同じidを返し、属性が更新される
            input.website = Some("https://www.vaisala.com".to_string());
            let mut tx = pool.begin().await?;
            let second_id = upsert_manufacturer_by_name(&mut tx, &input).await?;
            tx.commit().await?;

            assert_eq!(first_id, second_id, "アップサートでidが変わった");

            let fetched = get_manufacturer(&pool, first_id).await?.unwrap();
            assert_eq!(fetched.website.as_deref(), Some("https://www.vaisala.com"));

            Ok(())
        }
    }
}
