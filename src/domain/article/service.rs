use crate::domain::article::model::{generate_article_id, ArticleAggregate, ArticleInput};
use crate::domain::article::repository;
use crate::infra::storage::FileStorage;
use crate::types::{CatalogError, CatalogResult};
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{info, warn};

/// 生成idの衝突時に再試行する最大回数
const MAX_ID_GENERATION_ATTEMPTS: usize = 5;

/// 置換チェーン走査の深さ上限
const REPLACEMENT_CHAIN_DEPTH: usize = 32;

/// 記事アグリゲートを新規作成する
///
/// 記事行と供給された全子コレクションを単一トランザクションで挿入する。
/// どこかで失敗した場合は全体がロールバックされ、部分的な記事は残らない。
/// article_id省略時はタイプ別プレフィックスで生成し、一意制約違反時は
/// 上限回数まで再生成して再試行する。
pub async fn create_article(pool: &PgPool, input: &ArticleInput) -> CatalogResult<ArticleAggregate> {
    let article_type = input
        .article_type
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| CatalogError::validation("article_typeは必須です"))?;
    if input
        .sap_description
        .as_deref()
        .map(|d| d.trim().is_empty())
        .unwrap_or(true)
    {
        return Err(CatalogError::validation("sap_descriptionは必須です"));
    }

    if let Some(ref target) = input.replacement_article_id {
        // 新規作成では自己参照のみ弾けばよい（既存チェーンは走査で確認）
        let self_id = input.article_id.as_deref().unwrap_or_default();
        ensure_replacement_acyclic(pool, self_id, target).await?;
    }

    let generated = input.article_id.is_none();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        let article_id = match &input.article_id {
            Some(id) => id.clone(),
            None => generate_article_id(article_type),
        };

        match insert_aggregate(pool, &article_id, input).await {
            Ok(()) => {
                info!(article_id = %article_id, "記事を作成しました");
                let aggregate = repository::fetch_aggregate(pool, &article_id)
                    .await?
                    .ok_or_else(|| CatalogError::not_found(format!("記事 {}", article_id)))?;
                return Ok(aggregate);
            }
            // 生成idの衝突のみ再試行。呼び出し側指定のidはそのまま返す
            Err(e) if e.is_conflict() && generated && attempts < MAX_ID_GENERATION_ATTEMPTS => {
                warn!(attempt = attempts, "生成したarticle_idが衝突したため再生成します");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// トランザクション内で記事行と子コレクションを挿入する
async fn insert_aggregate(pool: &PgPool, article_id: &str, input: &ArticleInput) -> CatalogResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CatalogError::database("トランザクション開始", e))?;

    repository::insert_article(&mut tx, article_id, input).await?;
    repository::apply_child_collections(&mut tx, article_id, input, false).await?;

    tx.commit()
        .await
        .map_err(|e| CatalogError::database("トランザクションコミット", e))?;
    Ok(())
}

/// 記事アグリゲートを更新する
///
/// 供給されたトップレベルフィールドのみ更新し、供給された子コレクションは
/// 全置換する（空配列=全削除、キー欠落=変更なし）。コミット後、置換で
/// 不要になったドキュメント・画像の実ファイルをベストエフォートで削除する。
pub async fn update_article(
    pool: &PgPool,
    storage: &FileStorage,
    article_id: &str,
    input: &ArticleInput,
) -> CatalogResult<ArticleAggregate> {
    let existing = repository::fetch_article(pool, article_id)
        .await?
        .ok_or_else(|| CatalogError::not_found(format!("記事 {}", article_id)))?;

    if let Some(ref target) = input.replacement_article_id {
        ensure_replacement_acyclic(pool, article_id, target).await?;
    }

    // 置換対象コレクションの旧ファイルパスをトランザクション前に控える
    let mut stale_paths: Vec<String> = Vec::new();
    if input.documents.is_some() {
        for doc in children_paths(pool, article_id, "documents").await? {
            stale_paths.push(doc);
        }
    }
    if input.images.is_some() {
        for image in children_paths(pool, article_id, "images").await? {
            stale_paths.push(image);
        }
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CatalogError::database("トランザクション開始", e))?;

    if input.has_scalar_updates() {
        repository::update_article_scalars(&mut tx, article_id, input).await?;
    }
    repository::apply_child_collections(&mut tx, article_id, input, false).await?;

    tx.commit()
        .await
        .map_err(|e| CatalogError::database("トランザクションコミット", e))?;

    // 新しいコレクションに残っていないパスのみ削除対象にする
    let mut kept: HashSet<&str> = HashSet::new();
    if let Some(ref documents) = input.documents {
        kept.extend(documents.iter().map(|d| d.url_or_path.as_str()));
    }
    if let Some(ref images) = input.images {
        kept.extend(images.iter().map(|i| i.url_or_path.as_str()));
    }
    for path in stale_paths {
        if !kept.contains(path.as_str()) {
            storage.remove_best_effort(&path);
        }
    }

    info!(article_id = %existing.article_id, "記事を更新しました");

    let aggregate = repository::fetch_aggregate(pool, article_id)
        .await?
        .ok_or_else(|| CatalogError::not_found(format!("記事 {}", article_id)))?;
    Ok(aggregate)
}

async fn children_paths(pool: &PgPool, article_id: &str, table: &str) -> CatalogResult<Vec<String>> {
    sqlx::query_scalar::<_, String>(&format!(
        "SELECT url_or_path FROM {} WHERE article_id = $1",
        table
    ))
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database(format!("{}パス取得", table), e))
}

/// 記事アグリゲートを削除する
///
/// 先にドキュメント・画像のパスを読み取り、行削除（子はカスケード）後に
/// 外部URL以外の実ファイルをベストエフォートで削除する。ファイル削除の
/// 失敗は記録のみで、削除操作自体は成功として扱う。
pub async fn delete_article(
    pool: &PgPool,
    storage: &FileStorage,
    article_id: &str,
) -> CatalogResult<()> {
    let aggregate = repository::fetch_aggregate(pool, article_id)
        .await?
        .ok_or_else(|| CatalogError::not_found(format!("記事 {}", article_id)))?;

    let deleted = repository::delete_article_row(pool, article_id).await?;
    if !deleted {
        return Err(CatalogError::not_found(format!("記事 {}", article_id)));
    }

    for document in &aggregate.documents {
        storage.remove_best_effort(&document.url_or_path);
    }
    for image in &aggregate.images {
        storage.remove_best_effort(&image.url_or_path);
    }

    info!(article_id = %article_id, "記事を削除しました");
    Ok(())
}

/// 記事アグリゲートを取得する（存在しなければNotFound）
pub async fn get_article(pool: &PgPool, article_id: &str) -> CatalogResult<ArticleAggregate> {
    repository::fetch_aggregate(pool, article_id)
        .await?
        .ok_or_else(|| CatalogError::not_found(format!("記事 {}", article_id)))
}

/// 置換参照がチェーンを循環させないことを確認する
///
/// targetから置換チェーンを上限深さまで辿り、article_id自身へ戻る参照を
/// 拒否する。参照先が存在しない場合も参照整合性違反として弾く。
async fn ensure_replacement_acyclic(
    pool: &PgPool,
    article_id: &str,
    target: &str,
) -> CatalogResult<()> {
    if article_id == target {
        return Err(CatalogError::validation(
            "replacement_article_idに自分自身は指定できません",
        ));
    }

    let mut current = target.to_string();
    for _ in 0..REPLACEMENT_CHAIN_DEPTH {
        let next: Option<Option<String>> =
            sqlx::query_scalar("SELECT replacement_article_id FROM articles WHERE article_id = $1")
                .bind(&current)
                .fetch_optional(pool)
                .await
                .map_err(|e| CatalogError::database("置換チェーン走査", e))?;

        match next {
            None => {
                return Err(CatalogError::invalid_reference(format!(
                    "置換対象の記事が存在しません: {}",
                    current
                )));
            }
            Some(None) => return Ok(()),
            Some(Some(next_id)) => {
                if next_id == article_id {
                    return Err(CatalogError::validation(format!(
                        "置換チェーンが循環します: {} -> {}",
                        article_id, target
                    )));
                }
                current = next_id;
            }
        }
    }

    Err(CatalogError::validation("置換チェーンが深すぎます"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::article::model::{
        ModbusRegisterInput, ProtocolInput, VariableLinkInput,
    };
    use crate::domain::variable::VariableDictInput;
    use tempfile::tempdir;

    fn base_input(sap_description: &str) -> ArticleInput {
        ArticleInput {
            article_type: Some("INSTRUMENTO".to_string()),
            sap_description: Some(sap_description.to_string()),
            ..Default::default()
        }
    }

    fn temperature_link() -> VariableLinkInput {
        VariableLinkInput {
            variable: Some(VariableDictInput {
                name: "Temperature".to_string(),
                default_unit: Some("°C".to_string()),
                description: None,
            }),
            range_min: Some(-5.0),
            range_max: Some(35.0),
            accuracy: Some(0.002),
            ..Default::default()
        }
    }

    fn pressure_link() -> VariableLinkInput {
        VariableLinkInput {
            variable: Some(VariableDictInput {
                name: "Pressure".to_string(),
                default_unit: Some("dbar".to_string()),
                description: None,
            }),
            range_min: Some(0.0),
            range_max: Some(7000.0),
            ..Default::default()
        }
    }

    // ドメインロジック・振る舞い系テスト
    mod domain {
        use super::*;

        #[sqlx::test]
        async fn test_create_requires_sap_description(pool: PgPool) -> Result<(), anyhow::Error> {
            let input = ArticleInput {
                article_type: Some("SENSOR".to_string()),
                ..Default::default()
            };
            let result = create_article(&pool, &input).await;
            match result {
                Err(CatalogError::Validation { message }) => {
                    assert!(message.contains("sap_description"));
                }
                other => panic!("検証エラーになるべき: {:?}", other.map(|a| a.article.article_id)),
            }
            Ok(())
        }

        #[sqlx::test]
        async fn test_create_generates_typed_id(pool: PgPool) -> Result<(), anyhow::Error> {
            let input = base_input("CTDプロファイラ");
            let aggregate = create_article(&pool, &input).await?;

            assert!(
                aggregate.article.article_id.starts_with("INS-"),
                "生成idのプレフィックスが不正: {}",
                aggregate.article.article_id
            );
            assert!(aggregate.article.active, "activeの既定値はtrue");
            assert!(!aggregate.article.discontinued);

            Ok(())
        }

        #[sqlx::test]
        async fn test_create_with_children_and_read_back(pool: PgPool) -> Result<(), anyhow::Error> {
            let mut input = base_input("CTD Profiler SBE 19plus");
            input.article_id = Some("INS-000347".to_string());
            input.article_variables = Some(vec![temperature_link(), pressure_link()]);
            input.article_protocols = Some(vec![ProtocolInput {
                protocol_type: "ModbusRTU".to_string(),
                physical_layer: Some("RS-485".to_string()),
                baudrate: Some(9600),
                data_bits: Some(8),
                parity: Some("N".to_string()),
                stop_bits: Some(1),
                ip_address: None,
                port: None,
                notes: None,
            }]);

            create_article(&pool, &input).await?;

            let aggregate = get_article(&pool, "INS-000347").await?;
            assert_eq!(aggregate.article_variables.len(), 2);
            assert!(aggregate
                .article_variables
                .iter()
                .all(|v| v.variable.is_some()), "変数辞書がJOINされていない");
            assert_eq!(aggregate.article_protocols.len(), 1);
            assert_eq!(aggregate.article_protocols[0].baudrate, Some(9600));

            Ok(())
        }

        #[sqlx::test]
        async fn test_create_atomicity_on_child_failure(pool: PgPool) -> Result<(), anyhow::Error> {
            // 同一の(function_code, address)の重複でトランザクション全体が
            // ロールバックされ、記事行も残らないことを確認
            let mut input = base_input("Modbus計測器");
            input.article_id = Some("INS-777001".to_string());
            let register = ModbusRegisterInput {
                function_code: 3,
                address: 100,
                name: Some("temp".to_string()),
                data_type: None,
                scale: None,
                unit: None,
                access: None,
                description: None,
                document_id: None,
            };
            input.modbus_registers = Some(vec![register.clone(), register]);

            let result = create_article(&pool, &input).await;
            assert!(result.is_err(), "重複レジスタで失敗するべき");
            assert!(result.err().unwrap().is_conflict());

            let article = repository::fetch_article(&pool, "INS-777001").await?;
            assert!(article.is_none(), "部分的な記事が残ってしまった");

            println!("✅ 原子性検証成功: ロールバックで記事行も消えた");
            Ok(())
        }

        #[sqlx::test]
        async fn test_partial_update_semantics(pool: PgPool) -> Result<(), anyhow::Error> {
            let dir = tempdir()?;
            let storage = FileStorage::new(dir.path());

            let mut input = base_input("CTD Profiler");
            input.article_id = Some("INS-000347".to_string());
            input.article_variables = Some(vec![temperature_link(), pressure_link()]);
            input.article_protocols = Some(vec![ProtocolInput {
                protocol_type: "ModbusRTU".to_string(),
                physical_layer: None,
                baudrate: Some(9600),
                data_bits: None,
                parity: None,
                stop_bits: None,
                ip_address: None,
                port: None,
                notes: None,
            }]);
            input.tags = Some(vec!["oceanografia".to_string()]);
            create_article(&pool, &input).await?;

            // article_protocolsキーのみ（空配列）で更新 → プロトコルは全削除、
            // 変数とタグは変更されない
            let update = ArticleInput {
                article_protocols: Some(vec![]),
                ..Default::default()
            };
            let updated = update_article(&pool, &storage, "INS-000347", &update).await?;

            assert!(updated.article_protocols.is_empty(), "プロトコルが残っている");
            assert_eq!(updated.article_variables.len(), 2, "変数が消えてしまった");
            assert_eq!(updated.tags.len(), 1, "タグが消えてしまった");

            // スカラー更新も部分的: modelのみ供給 → 他フィールドは不変
            let update = ArticleInput {
                model: Some("SBE 19plus V2".to_string()),
                ..Default::default()
            };
            let updated = update_article(&pool, &storage, "INS-000347", &update).await?;
            assert_eq!(updated.article.model.as_deref(), Some("SBE 19plus V2"));
            assert_eq!(updated.article.sap_description, "CTD Profiler");
            assert_eq!(updated.article_variables.len(), 2);

            println!("✅ 部分更新セマンティクス検証成功");
            Ok(())
        }

        #[sqlx::test]
        async fn test_update_missing_article_is_not_found(pool: PgPool) -> Result<(), anyhow::Error> {
            let dir = tempdir()?;
            let storage = FileStorage::new(dir.path());

            let result =
                update_article(&pool, &storage, "INS-999999", &ArticleInput::default()).await;
            assert!(matches!(result, Err(CatalogError::NotFound { .. })));

            Ok(())
        }

        #[sqlx::test]
        async fn test_cascade_delete_removes_children_and_files(
            pool: PgPool,
        ) -> Result<(), anyhow::Error> {
            let dir = tempdir()?;
            let storage = FileStorage::new(dir.path());
            storage.ensure_layout()?;

            // 実ファイルを保存し、その相対パスでドキュメントを登録
            let rel_path = storage.save("Documents", "manual.pdf", b"pdf-bytes")?;

            let mut input = base_input("データロガー");
            input.article_id = Some("DTL-000001".to_string());
            input.article_type = Some("DATALOGGER".to_string());
            input.documents = Some(vec![crate::domain::article::model::DocumentInput {
                id: None,
                title: Some("取扱説明書".to_string()),
                doc_type: Some("manual".to_string()),
                url_or_path: rel_path.clone(),
                content_hash: None,
            }, crate::domain::article::model::DocumentInput {
                id: None,
                title: Some("外部データシート".to_string()),
                doc_type: Some("datasheet".to_string()),
                url_or_path: "https://example.com/datasheet.pdf".to_string(),
                content_hash: None,
            }]);
            input.tags = Some(vec!["campo".to_string(), "campo".to_string()]);
            create_article(&pool, &input).await?;

            delete_article(&pool, &storage, "DTL-000001").await?;

            // 行が消えている
            assert!(repository::fetch_article(&pool, "DTL-000001").await?.is_none());
            let tag_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM article_tags WHERE article_id = $1")
                    .bind("DTL-000001")
                    .fetch_one(&pool)
                    .await?;
            assert_eq!(tag_count, 0, "タグがカスケード削除されていない");

            // ローカルファイルは削除され、外部URLは触られない
            assert!(!storage.resolve(&rel_path).exists(), "実ファイルが残っている");

            Ok(())
        }

        #[sqlx::test]
        async fn test_replacement_cycle_is_rejected(pool: PgPool) -> Result<(), anyhow::Error> {
            let dir = tempdir()?;
            let storage = FileStorage::new(dir.path());

            let mut a = base_input("旧型センサー");
            a.article_id = Some("SEN-000001".to_string());
            a.article_type = Some("SENSOR".to_string());
            create_article(&pool, &a).await?;

            let mut b = base_input("新型センサー");
            b.article_id = Some("SEN-000002".to_string());
            b.article_type = Some("SENSOR".to_string());
            b.replacement_article_id = Some("SEN-000001".to_string());
            create_article(&pool, &b).await?;

            // SEN-000001 -> SEN-000002 を張ると循環になる
            let update = ArticleInput {
                replacement_article_id: Some("SEN-000002".to_string()),
                ..Default::default()
            };
            let result = update_article(&pool, &storage, "SEN-000001", &update).await;
            assert!(
                matches!(result, Err(CatalogError::Validation { .. })),
                "循環参照が拒否されなかった"
            );

            // 自己参照も拒否
            let update = ArticleInput {
                replacement_article_id: Some("SEN-000001".to_string()),
                ..Default::default()
            };
            let result = update_article(&pool, &storage, "SEN-000001", &update).await;
            assert!(matches!(result, Err(CatalogError::Validation { .. })));

            Ok(())
        }
    }
}
