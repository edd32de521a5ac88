//! インポートサービス
//!
//! エクスポートと同じ4形式（JSON/SQL/Excel/ZIP）を受け付け、同一データの
//! 再インポートが冪等になるように各エンティティを自然キーでアップサート
//! する。JSONインポートは記事ごとに独立したトランザクションで処理され、
//! 1件の失敗がバッチ全体を中断しない。

use crate::app::export::{do_update_clause, sql_str};
use crate::domain::article::model::ArticleInput;
use crate::domain::article::repository;
use crate::domain::manufacturer::upsert_manufacturer_by_name;
use crate::infra::storage::FileStorage;
use crate::types::summary::MAX_IMPORT_ERRORS;
use crate::types::{CatalogError, CatalogResult, ImportSummary, SqlImportSummary};
use calamine::{DataType, Range, Reader, Xlsx};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{info, warn};

// ---- JSONインポート ----

/// インポートペイロードを記事レコードの配列へ正規化する
///
/// 受け付ける形式: 記事アグリゲートの素の配列、`{articles: [...]}`形式の
/// オブジェクト、または単一の記事オブジェクト。
pub fn parse_import_payload(value: Value) -> CatalogResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            if let Some(articles) = map.remove("articles") {
                match articles {
                    Value::Array(items) => Ok(items),
                    _ => Err(CatalogError::import("articlesフィールドが配列ではありません")),
                }
            } else {
                Ok(vec![Value::Object(map)])
            }
        }
        _ => Err(CatalogError::import(
            "ペイロードは配列・articlesオブジェクト・単一記事のいずれかである必要があります",
        )),
    }
}

/// インポート用にレコードを正規化する
///
/// - 欠落している子コレクションは空配列として扱う（全置換セマンティクス）
/// - 埋め込みvariableを持つ測定変数はvariable_idを破棄し、名前解決を強制
///   する（エクスポート元と取り込み先で辞書idが一致しないため）
fn normalize_for_import(record: &mut ArticleInput) {
    if let Some(ref mut variables) = record.article_variables {
        for link in variables.iter_mut() {
            if link.variable.is_some() {
                link.variable_id = None;
            }
        }
    }

    record.article_variables.get_or_insert_with(Vec::new);
    record.article_protocols.get_or_insert_with(Vec::new);
    record.analog_outputs.get_or_insert_with(Vec::new);
    record.digital_io.get_or_insert_with(Vec::new);
    record.modbus_registers.get_or_insert_with(Vec::new);
    record.sdi12_commands.get_or_insert_with(Vec::new);
    record.nmea_sentences.get_or_insert_with(Vec::new);
    record.documents.get_or_insert_with(Vec::new);
    record.images.get_or_insert_with(Vec::new);
    record.tags.get_or_insert_with(Vec::new);
    record.accessories.get_or_insert_with(Vec::new);
    record.provenance.get_or_insert_with(Vec::new);
}

/// 記事レコードを1件、専用トランザクションでアップサートする
/// 戻り値は既存記事の更新だったかどうか
async fn import_article_record(pool: &PgPool, record: &ArticleInput) -> CatalogResult<bool> {
    let article_id = record
        .article_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| CatalogError::validation("article_idは必須です"))?;

    let mut record = record.clone();
    normalize_for_import(&mut record);

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CatalogError::database("トランザクション開始", e))?;

    // 埋め込みメーカーを自然キーでアップサートしてidを解決
    if let Some(ref manufacturer) = record.manufacturer {
        let id = upsert_manufacturer_by_name(&mut tx, manufacturer).await?;
        record.manufacturer_id = Some(id);
    }

    // 事前チェックSELECTで挿入か更新かを決定する
    let exists = repository::article_exists(&mut tx, article_id).await?;
    if exists {
        repository::update_article_scalars(&mut tx, article_id, &record).await?;
    } else {
        if record.article_type.as_deref().unwrap_or("").trim().is_empty() {
            return Err(CatalogError::validation("article_typeは必須です"));
        }
        if record.sap_description.as_deref().unwrap_or("").trim().is_empty() {
            return Err(CatalogError::validation("sap_descriptionは必須です"));
        }
        repository::insert_article(&mut tx, article_id, &record).await?;
    }

    repository::apply_child_collections(&mut tx, article_id, &record, true).await?;

    tx.commit()
        .await
        .map_err(|e| CatalogError::database("トランザクションコミット", e))?;

    Ok(exists)
}

/// JSONペイロードをインポートする
///
/// 記事単位のエラーはその記事のトランザクションに閉じ、集計に記録して
/// 処理を継続する。置換参照（replacement_article_id）は取り込み順序に
/// 依存しないよう、全記事の取り込み後に第2パスで適用する。
pub async fn import_json(pool: &PgPool, payload: Value) -> CatalogResult<ImportSummary> {
    let items = parse_import_payload(payload)?;
    let mut summary = ImportSummary::empty();
    let mut replacements: Vec<(String, String)> = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        let mut record: ArticleInput = match serde_json::from_value(item) {
            Ok(record) => record,
            Err(e) => {
                summary.record_failure(format!("記事[{}]: パースに失敗 - {}", index, e));
                continue;
            }
        };

        // 置換参照は第2パスで適用する
        if let (Some(id), Some(target)) = (&record.article_id, record.replacement_article_id.take())
        {
            replacements.push((id.clone(), target));
        }

        let label = record
            .article_id
            .clone()
            .unwrap_or_else(|| format!("記事[{}]", index));

        match import_article_record(pool, &record).await {
            Ok(true) => summary.record_updated(),
            Ok(false) => summary.record_imported(),
            Err(e) => summary.record_failure(format!("{}: {}", label, e)),
        }
    }

    for (article_id, target) in replacements {
        let result = sqlx::query(
            "UPDATE articles SET replacement_article_id = $2 WHERE article_id = $1",
        )
        .bind(&article_id)
        .bind(&target)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!(article_id = %article_id, error = %e, "置換参照の適用に失敗しました");
            if summary.errors.len() < MAX_IMPORT_ERRORS {
                summary
                    .errors
                    .push(format!("{}: 置換参照の適用に失敗 - {}", article_id, e));
            }
        }
    }

    info!("{}", summary);
    Ok(summary)
}

// ---- SQLインポート ----

/// SQLテキストを文単位に分割する
///
/// 行単位で読み、セミコロンで終わる行までを1文として蓄積する。
/// 空行とコメント行（--）は読み飛ばす。
pub fn split_sql_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        if trimmed.ends_with(';') {
            let statement = current.trim().trim_end_matches(';').trim().to_string();
            if !statement.is_empty() {
                statements.push(statement);
            }
            current.clear();
        } else {
            current.push('\n');
        }
    }

    let remainder = current.trim();
    if !remainder.is_empty() {
        statements.push(remainder.to_string());
    }
    statements
}

/// インポート対象の文かどうかを判定する
/// INSERT文とシーケンス調整（setval）のみを実行する
pub fn is_importable_statement(statement: &str) -> bool {
    let upper = statement.trim_start().to_uppercase();
    upper.starts_with("INSERT") || (upper.starts_with("SELECT") && upper.contains("SETVAL"))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

/// SQLダンプをインポートする
///
/// 各文を独立したトランザクションで実行し、その間は参照整合性トリガーを
/// ベストエフォートで無効化する。一意制約違反は想定内の重複として
/// スキップ数に数え、エラーにはしない。
pub async fn import_sql(pool: &PgPool, text: &str) -> CatalogResult<SqlImportSummary> {
    let mut summary = SqlImportSummary::empty();

    for statement in split_sql_statements(text) {
        if !is_importable_statement(&statement) {
            continue;
        }

        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                summary.record_failure(format!("トランザクション開始に失敗: {}", e));
                continue;
            }
        };

        // 権限がない環境では無効化できないため、失敗しても文の実行は続ける
        if let Err(e) = sqlx::query("SET LOCAL session_replication_role = replica")
            .execute(&mut *tx)
            .await
        {
            warn!(error = %e, "参照整合性トリガーの無効化に失敗しました");
        }

        match sqlx::query(&statement).execute(&mut *tx).await {
            Ok(_) => match tx.commit().await {
                Ok(()) => summary.record_executed(),
                Err(e) => summary.record_failure(format!("コミットに失敗: {}", e)),
            },
            Err(e) if is_unique_violation(&e) => {
                // ロールバックはDropに任せる
                summary.record_skipped();
            }
            Err(e) => {
                let head: String = statement.chars().take(80).collect();
                summary.record_failure(format!("{} ... : {}", head, e));
            }
        }
    }

    info!("{}", summary);
    Ok(summary)
}

// ---- Excelインポート ----

/// Excelインポートの集計結果
#[derive(Debug, Default, Serialize)]
pub struct ExcelImportSummary {
    /// 記事のアップサート集計
    pub articles: ImportSummary,
    /// メーカー・変数辞書のアップサート件数
    pub manufacturers: usize,
    pub variables: usize,
    /// 子テーブル行の挿入・スキップ件数
    pub child_rows_inserted: usize,
    pub child_rows_skipped: usize,
}

/// セル値の種別（SQLリテラルへの変換規則）
#[derive(Debug, Clone, Copy)]
enum ColKind {
    Text,
    Num,
    Bool,
    Timestamp,
}

/// セルを文字列として読む（空セルはNone）
fn cell_text(row: &[DataType], index: Option<&usize>) -> Option<String> {
    let cell = row.get(*index?)?;
    match cell {
        DataType::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        DataType::Float(f) => Some(f.to_string()),
        DataType::Int(i) => Some(i.to_string()),
        DataType::Bool(b) => Some(b.to_string().to_uppercase()),
        _ => None,
    }
}

/// ヘッダー行からカラム名→インデックスの対応表を作る
fn header_map(range: &Range<DataType>) -> HashMap<String, usize> {
    range
        .rows()
        .next()
        .map(|row| {
            row.iter()
                .enumerate()
                .filter_map(|(index, cell)| match cell {
                    DataType::String(s) => Some((s.trim().to_string(), index)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// セル値をSQLリテラルへ変換する
fn cell_to_sql(value: Option<String>, kind: ColKind) -> String {
    match value {
        None => "NULL".to_string(),
        Some(text) => match kind {
            ColKind::Text => sql_str(&text),
            ColKind::Num => {
                if text.parse::<f64>().is_ok() {
                    text
                } else {
                    "NULL".to_string()
                }
            }
            ColKind::Bool => {
                if text.eq_ignore_ascii_case("true") {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            ColKind::Timestamp => sql_str(&text),
        },
    }
}

/// articlesシートのカラム種別
const ARTICLE_COLUMN_KINDS: &[(&str, ColKind)] = &[
    ("article_id", ColKind::Text),
    ("article_type", ColKind::Text),
    ("sap_item_code", ColKind::Text),
    ("sap_description", ColKind::Text),
    ("model", ColKind::Text),
    ("family", ColKind::Text),
    ("subfamily", ColKind::Text),
    ("category", ColKind::Text),
    ("manufacturer_id", ColKind::Num),
    ("description", ColKind::Text),
    ("datasheet_url", ColKind::Text),
    ("weight_kg", ColKind::Num),
    ("length_mm", ColKind::Num),
    ("width_mm", ColKind::Num),
    ("height_mm", ColKind::Num),
    ("material", ColKind::Text),
    ("ip_rating", ColKind::Text),
    ("operating_temp_min_c", ColKind::Num),
    ("operating_temp_max_c", ColKind::Num),
    ("storage_temp_min_c", ColKind::Num),
    ("storage_temp_max_c", ColKind::Num),
    ("depth_rating_m", ColKind::Num),
    ("supply_voltage_min_v", ColKind::Num),
    ("supply_voltage_max_v", ColKind::Num),
    ("power_consumption_w", ColKind::Num),
    ("battery_type", ColKind::Text),
    ("connector_type", ColKind::Text),
    ("cable_length_m", ColKind::Num),
    ("mounting", ColKind::Text),
    ("firmware_version", ColKind::Text),
    ("calibration_interval_months", ColKind::Num),
    ("warranty_months", ColKind::Num),
    ("country_of_origin", ColKind::Text),
    ("hs_code", ColKind::Text),
    ("unit_price", ColKind::Num),
    ("currency", ColKind::Text),
    ("stock_quantity", ColKind::Num),
    ("minimum_stock", ColKind::Num),
    ("notes", ColKind::Text),
    ("has_heating", ColKind::Bool),
    ("active", ColKind::Bool),
    ("discontinued", ColKind::Bool),
    ("replacement_article_id", ColKind::Text),
    ("created_at", ColKind::Timestamp),
    ("updated_at", ColKind::Timestamp),
];

/// 子テーブルシートの定義（シート名、テーブル名、カラム種別）
const CHILD_SHEETS: &[(&str, &str, &[(&str, ColKind)])] = &[
    (
        "ArticleVariables",
        "article_variables",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("variable_id", ColKind::Num),
            ("range_min", ColKind::Num),
            ("range_max", ColKind::Num),
            ("unit", ColKind::Text),
            ("accuracy", ColKind::Num),
            ("resolution", ColKind::Num),
            ("sample_rate_hz", ColKind::Num),
        ],
    ),
    (
        "Protocols",
        "article_protocols",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("protocol_type", ColKind::Text),
            ("physical_layer", ColKind::Text),
            ("baudrate", ColKind::Num),
            ("data_bits", ColKind::Num),
            ("parity", ColKind::Text),
            ("stop_bits", ColKind::Num),
            ("ip_address", ColKind::Text),
            ("port", ColKind::Num),
            ("notes", ColKind::Text),
        ],
    ),
    (
        "AnalogOutputs",
        "analog_outputs",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("channel_name", ColKind::Text),
            ("signal_type", ColKind::Text),
            ("range_min", ColKind::Num),
            ("range_max", ColKind::Num),
            ("unit", ColKind::Text),
        ],
    ),
    (
        "DigitalIO",
        "digital_io",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("channel_name", ColKind::Text),
            ("direction", ColKind::Text),
            ("signal_level", ColKind::Text),
            ("notes", ColKind::Text),
        ],
    ),
    (
        "Documents",
        "documents",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("title", ColKind::Text),
            ("doc_type", ColKind::Text),
            ("url_or_path", ColKind::Text),
            ("content_hash", ColKind::Text),
            ("uploaded_at", ColKind::Timestamp),
        ],
    ),
    (
        "Images",
        "images",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("title", ColKind::Text),
            ("url_or_path", ColKind::Text),
            ("is_primary", ColKind::Bool),
            ("uploaded_at", ColKind::Timestamp),
        ],
    ),
    (
        "ModbusRegisters",
        "modbus_registers",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("function_code", ColKind::Num),
            ("address", ColKind::Num),
            ("name", ColKind::Text),
            ("data_type", ColKind::Text),
            ("scale", ColKind::Num),
            ("unit", ColKind::Text),
            ("access", ColKind::Text),
            ("description", ColKind::Text),
            ("document_id", ColKind::Num),
        ],
    ),
    (
        "SDI12Commands",
        "sdi12_commands",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("command", ColKind::Text),
            ("description", ColKind::Text),
            ("response_format", ColKind::Text),
        ],
    ),
    (
        "NMEASentences",
        "nmea_sentences",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("sentence", ColKind::Text),
            ("description", ColKind::Text),
            ("fields", ColKind::Text),
        ],
    ),
    (
        "Tags",
        "article_tags",
        &[("article_id", ColKind::Text), ("tag", ColKind::Text)],
    ),
    (
        "Accessories",
        "accessories",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("name", ColKind::Text),
            ("sap_item_code", ColKind::Text),
            ("quantity", ColKind::Num),
            ("notes", ColKind::Text),
        ],
    ),
    (
        "Provenance",
        "provenance",
        &[
            ("id", ColKind::Num),
            ("article_id", ColKind::Text),
            ("source", ColKind::Text),
            ("document_id", ColKind::Num),
            ("imported_at", ColKind::Timestamp),
            ("notes", ColKind::Text),
        ],
    ),
];

/// シートの1行から、ヘッダーに存在するカラムのみのINSERT文を組み立てる
/// シートにないカラムは挿入対象から外れ、テーブルの既定値に任せる
fn row_insert_statement(
    table: &str,
    columns: &[(&str, ColKind)],
    headers: &HashMap<String, usize>,
    row: &[DataType],
    conflict_clause: &str,
) -> Option<String> {
    let mut names: Vec<&str> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    for (name, kind) in columns {
        if let Some(index) = headers.get(*name) {
            names.push(name);
            values.push(cell_to_sql(cell_text(row, Some(index)), *kind));
        }
    }

    if names.is_empty() || values.iter().all(|v| v == "NULL") {
        return None;
    }

    Some(format!(
        "INSERT INTO {} ({}) VALUES ({}) {}",
        table,
        names.join(", "),
        values.join(", "),
        conflict_clause
    ))
}

/// Excelワークブックをインポートする
///
/// エクスポートと同名のシートを読み、メーカー・変数辞書を自然キーで
/// 先にアップサートしてから記事をアップサート、子テーブルはON CONFLICT
/// DO NOTHINGで挿入する。行単位のエラーは黙って数えるだけで処理は続く。
pub async fn import_excel(pool: &PgPool, bytes: &[u8]) -> CatalogResult<ExcelImportSummary> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook: Xlsx<_> = Xlsx::new(cursor)
        .map_err(|e| CatalogError::import(format!("Excelファイルの読み込みに失敗: {}", e)))?;

    let mut summary = ExcelImportSummary::default();

    // メーカー（自然キーアップサート）
    if let Some(Ok(range)) = workbook.worksheet_range("Manufacturers") {
        let headers = header_map(&range);
        let columns: &[(&str, ColKind)] = &[
            ("id", ColKind::Num),
            ("name", ColKind::Text),
            ("country", ColKind::Text),
            ("website", ColKind::Text),
            ("contact_email", ColKind::Text),
            ("notes", ColKind::Text),
        ];
        let conflict = do_update_clause(
            "name",
            &["id", "name", "country", "website", "contact_email", "notes"],
            &["id", "name"],
        );
        for row in range.rows().skip(1) {
            if let Some(statement) =
                row_insert_statement("manufacturers", columns, &headers, row, &conflict)
            {
                if sqlx::query(&statement).execute(pool).await.is_ok() {
                    summary.manufacturers += 1;
                }
            }
        }
    }

    // 変数辞書（自然キーアップサート）
    if let Some(Ok(range)) = workbook.worksheet_range("Variables") {
        let headers = header_map(&range);
        let columns: &[(&str, ColKind)] = &[
            ("id", ColKind::Num),
            ("name", ColKind::Text),
            ("default_unit", ColKind::Text),
            ("description", ColKind::Text),
        ];
        let conflict = do_update_clause(
            "name",
            &["id", "name", "default_unit", "description"],
            &["id", "name"],
        );
        for row in range.rows().skip(1) {
            if let Some(statement) =
                row_insert_statement("variables_dict", columns, &headers, row, &conflict)
            {
                if sqlx::query(&statement).execute(pool).await.is_ok() {
                    summary.variables += 1;
                }
            }
        }
    }

    // 記事（article_idでのアップサート、シートにある全カラムを反映）
    if let Some(Ok(range)) = workbook.worksheet_range("Articles") {
        let headers = header_map(&range);
        let present: Vec<&str> = ARTICLE_COLUMN_KINDS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| headers.contains_key(*name))
            .collect();
        let conflict = do_update_clause("article_id", &present, &["article_id", "created_at"]);

        for row in range.rows().skip(1) {
            let article_id = cell_text(row, headers.get("article_id"));
            let Some(article_id) = article_id else {
                continue;
            };

            let existed: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM articles WHERE article_id = $1")
                    .bind(&article_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| CatalogError::database("記事存在確認", e))?;

            match row_insert_statement("articles", ARTICLE_COLUMN_KINDS, &headers, row, &conflict) {
                Some(statement) => match sqlx::query(&statement).execute(pool).await {
                    Ok(_) => {
                        if existed.is_some() {
                            summary.articles.record_updated();
                        } else {
                            summary.articles.record_imported();
                        }
                    }
                    Err(e) => summary
                        .articles
                        .record_failure(format!("{}: {}", article_id, e)),
                },
                None => summary
                    .articles
                    .record_failure(format!("{}: 行が空です", article_id)),
            }
        }
    }

    // 子テーブル（重複は黙って落とす）
    for (sheet_name, table, columns) in CHILD_SHEETS {
        if let Some(Ok(range)) = workbook.worksheet_range(sheet_name) {
            let headers = header_map(&range);
            for row in range.rows().skip(1) {
                let Some(statement) = row_insert_statement(
                    table,
                    columns,
                    &headers,
                    row,
                    "ON CONFLICT DO NOTHING",
                ) else {
                    continue;
                };

                match sqlx::query(&statement).execute(pool).await {
                    Ok(result) if result.rows_affected() > 0 => summary.child_rows_inserted += 1,
                    Ok(_) => summary.child_rows_skipped += 1,
                    Err(_) => summary.child_rows_skipped += 1,
                }
            }
        }
    }

    // 明示idの挿入後にシーケンスを再同期する
    for table in [
        "manufacturers",
        "variables_dict",
        "article_variables",
        "article_protocols",
        "analog_outputs",
        "digital_io",
        "documents",
        "images",
        "modbus_registers",
        "sdi12_commands",
        "nmea_sentences",
        "article_tags",
        "accessories",
        "provenance",
    ] {
        let statement = format!(
            "SELECT setval(pg_get_serial_sequence('{table}', 'id'), COALESCE((SELECT MAX(id) FROM {table}), 1))",
            table = table
        );
        if let Err(e) = sqlx::query(&statement).execute(pool).await {
            warn!(table = table, error = %e, "シーケンス再同期に失敗しました");
        }
    }

    info!(
        "Excelインポート完了: 記事 新規{}件/更新{}件/失敗{}件、子テーブル 挿入{}件/スキップ{}件",
        summary.articles.imported,
        summary.articles.updated,
        summary.articles.failed,
        summary.child_rows_inserted,
        summary.child_rows_skipped
    );
    Ok(summary)
}

// ---- ZIPインポート ----

/// ZIPバンドルをインポートする
///
/// 一時ディレクトリへ展開し、ルートのdata.jsonを必須とする（なければ
/// エラー）。uploads/配下はストレージルートへ構造を維持してコピーし、
/// その後data.jsonに対してJSONインポートを実行する。一時ディレクトリは
/// 成否にかかわらず削除される（TempDirのDrop）。
pub async fn import_zip(
    pool: &PgPool,
    storage: &FileStorage,
    bytes: &[u8],
) -> CatalogResult<ImportSummary> {
    let temp = tempfile::tempdir()
        .map_err(|e| CatalogError::storage("一時ディレクトリ", e))?;

    extract_zip(bytes, temp.path())?;

    let data_path = temp.path().join("data.json");
    if !data_path.is_file() {
        return Err(CatalogError::import(
            "ZIPアーカイブのルートにdata.jsonが見つかりません",
        ));
    }

    let uploads_dir = temp.path().join("uploads");
    if uploads_dir.is_dir() {
        let copied = storage.copy_tree_into(&uploads_dir)?;
        info!(copied = copied, "uploads/からファイルをコピーしました");
    }

    let file = std::fs::File::open(&data_path)
        .map_err(|e| CatalogError::storage(data_path.to_string_lossy(), e))?;
    let payload: Value = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| CatalogError::import(format!("data.jsonの解析に失敗: {}", e)))?;

    import_json(pool, payload).await
}

/// ZIPアーカイブを展開する（パストラバーサル対策込み）
fn extract_zip(bytes: &[u8], target: &std::path::Path) -> CatalogResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| CatalogError::import(format!("ZIPアーカイブの読み込みに失敗: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| CatalogError::import(format!("ZIPエントリの読み込みに失敗: {}", e)))?;
        if entry.is_dir() {
            continue;
        }

        // enclosed_nameはルート外への脱出を含むエントリを拒否する
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };

        let out_path = target.join(&relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CatalogError::storage(parent.to_string_lossy(), e))?;
        }
        let mut out_file = std::fs::File::create(&out_path)
            .map_err(|e| CatalogError::storage(out_path.to_string_lossy(), e))?;
        std::io::copy(&mut entry, &mut out_file)
            .map_err(|e| CatalogError::storage(out_path.to_string_lossy(), e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ペイロード解析系テスト
    mod parsing {
        use super::*;

        #[test]
        fn test_parse_bare_array() {
            let payload = json!([{"article_id": "INS-1"}, {"article_id": "INS-2"}]);
            let items = parse_import_payload(payload).expect("解析に失敗");
            assert_eq!(items.len(), 2);
        }

        #[test]
        fn test_parse_envelope_object() {
            let payload = json!({
                "exported_at": "2026-08-07T00:00:00Z",
                "version": "2.0",
                "articles": [{"article_id": "INS-1"}]
            });
            let items = parse_import_payload(payload).expect("解析に失敗");
            assert_eq!(items.len(), 1);
        }

        #[test]
        fn test_parse_single_object() {
            let payload = json!({"article_id": "INS-1", "sap_description": "CTD"});
            let items = parse_import_payload(payload).expect("解析に失敗");
            assert_eq!(items.len(), 1);
        }

        #[test]
        fn test_parse_rejects_scalar() {
            let result = parse_import_payload(json!("not an article"));
            assert!(result.is_err(), "スカラーが受理されてしまった");
        }

        #[test]
        fn test_normalize_forces_name_resolution() {
            let mut record: ArticleInput = serde_json::from_value(json!({
                "article_id": "INS-1",
                "article_variables": [
                    {"variable_id": 42, "variable": {"name": "Temperature"}}
                ]
            }))
            .expect("パースに失敗");

            normalize_for_import(&mut record);

            // 埋め込みvariableがある場合はvariable_idを破棄して名前解決を強制
            let links = record.article_variables.as_ref().unwrap();
            assert!(links[0].variable_id.is_none());
            assert!(links[0].variable.is_some());

            // 欠落コレクションは空配列（全置換）になる
            assert_eq!(record.tags.as_deref(), Some(&[][..]));
            assert!(record.article_protocols.as_ref().unwrap().is_empty());
        }
    }

    // SQL文分割系テスト
    mod sql_statements {
        use super::*;

        #[test]
        fn test_split_and_filter() {
            let dump = "-- コメント行\n\
                        BEGIN;\n\
                        SET session_replication_role = replica;\n\
                        INSERT INTO manufacturers (id, name) VALUES (1, 'Aanderaa') ON CONFLICT DO NOTHING;\n\
                        SELECT setval(pg_get_serial_sequence('manufacturers', 'id'), 1);\n\
                        COMMIT;\n";

            let statements = split_sql_statements(dump);
            assert_eq!(statements.len(), 5, "コメント以外の全文が分割されるべき");

            let importable: Vec<&String> = statements
                .iter()
                .filter(|s| is_importable_statement(s))
                .collect();
            assert_eq!(importable.len(), 2, "INSERTとsetvalのみが対象");
            assert!(importable[0].starts_with("INSERT"));
            assert!(importable[1].to_uppercase().contains("SETVAL"));
        }

        #[test]
        fn test_split_multiline_statement() {
            let dump = "INSERT INTO articles (article_id)\nVALUES ('INS-1');\n";
            let statements = split_sql_statements(dump);
            assert_eq!(statements.len(), 1);
            assert!(statements[0].contains("VALUES"));
        }
    }

    // データ永続化・DB操作系テスト
    mod storage {
        use super::*;
        use sqlx::PgPool;

        #[sqlx::test]
        async fn test_import_json_creates_and_is_idempotent(
            pool: PgPool,
        ) -> Result<(), anyhow::Error> {
            let payload = json!({
                "articles": [{
                    "article_id": "INS-000347",
                    "article_type": "INSTRUMENTO",
                    "sap_description": "CTD Profiler",
                    "manufacturer": {"name": "Sea-Bird Scientific", "country": "US"},
                    "article_variables": [
                        {
                            "range_min": -5.0, "range_max": 35.0, "accuracy": 0.002,
                            "variable": {"name": "Temperature", "default_unit": "°C"}
                        },
                        {
                            "range_min": 0.0, "range_max": 7000.0,
                            "variable": {"name": "Pressure", "default_unit": "dbar"}
                        }
                    ],
                    "article_protocols": [
                        {"protocol_type": "ModbusRTU", "baudrate": 9600}
                    ],
                    "tags": ["oceanografia", "ctd"]
                }]
            });

            // 1回目: 新規作成
            let first = import_json(&pool, payload.clone()).await?;
            assert_eq!(first.imported, 1);
            assert_eq!(first.updated, 0);
            assert_eq!(first.failed, 0);

            // 2回目: 同一データの再インポートは更新として冪等
            let second = import_json(&pool, payload).await?;
            assert_eq!(second.imported, 0);
            assert_eq!(second.updated, 1);
            assert_eq!(second.failed, 0);

            // 子コレクションが重複していないことを確認
            let aggregate = repository::fetch_aggregate(&pool, "INS-000347")
                .await?
                .expect("インポートした記事が見つからない");
            assert_eq!(aggregate.article_variables.len(), 2);
            assert_eq!(aggregate.article_protocols.len(), 1);
            assert_eq!(aggregate.tags.len(), 2);
            assert_eq!(
                aggregate.manufacturer.as_ref().map(|m| m.name.as_str()),
                Some("Sea-Bird Scientific")
            );

            println!("✅ 冪等インポート検証成功: {}", second);
            Ok(())
        }

        #[sqlx::test]
        async fn test_import_json_isolates_failures(pool: PgPool) -> Result<(), anyhow::Error> {
            let payload = json!([
                {
                    "article_id": "SEN-000001",
                    "article_type": "SENSOR",
                    "sap_description": "酸素センサー"
                },
                {
                    // article_typeなし → この記事のみ失敗
                    "article_id": "SEN-000002",
                    "sap_description": "不完全なレコード"
                }
            ]);

            let summary = import_json(&pool, payload).await?;
            assert_eq!(summary.imported, 1);
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.errors.len(), 1);
            assert!(summary.errors[0].contains("SEN-000002"));

            // 成功した記事は残っている
            assert!(repository::fetch_article(&pool, "SEN-000001").await?.is_some());
            assert!(repository::fetch_article(&pool, "SEN-000002").await?.is_none());

            Ok(())
        }

        #[sqlx::test]
        async fn test_import_sql_counts_duplicates(pool: PgPool) -> Result<(), anyhow::Error> {
            let dump = "INSERT INTO manufacturers (name, country) VALUES ('Aanderaa', 'NO');\n\
                        INSERT INTO manufacturers (name, country) VALUES ('Aanderaa', 'NO');\n\
                        DELETE FROM manufacturers;\n";

            let summary = import_sql(&pool, dump).await?;

            // 1件目は実行、2件目は重複スキップ、DELETEは対象外
            assert_eq!(summary.executed, 1);
            assert_eq!(summary.skipped_duplicate, 1);
            assert_eq!(summary.failed, 0);

            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manufacturers")
                .fetch_one(&pool)
                .await?;
            assert_eq!(count, 1, "DELETE文が実行されてしまっている");

            Ok(())
        }
    }
}
