//! エクスポートサービス
//!
//! 全記事アグリゲートをJSONエンベロープ、PostgreSQL向けSQLダンプ、
//! Excelワークブック、ファイル同梱ZIPの各形式へ直列化する。
//! レンダラはすべて取得済みデータに対する純関数で、プールからの取得は
//! `fetch_all_aggregates` に分離されている。

use crate::domain::article::model::{Article, ArticleAggregate};
use crate::domain::article::repository;
use crate::domain::manufacturer::{list_all_manufacturers, Manufacturer};
use crate::domain::variable::{list_all_variables, VariableDict};
use crate::infra::storage::{is_external_url, FileStorage};
use crate::types::{CatalogError, CatalogResult};
use chrono::{DateTime, Utc};
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// エクスポート形式のバージョン表記
pub const EXPORT_VERSION: &str = "2.0";

/// JSONエクスポートのエンベロープ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub exported_at: DateTime<Utc>,
    pub version: String,
    pub sap_integration: bool,
    pub total_articles: usize,
    pub articles: Vec<ArticleAggregate>,
}

/// アグリゲート一覧からエンベロープを組み立てる
pub fn build_envelope(articles: Vec<ArticleAggregate>) -> ExportEnvelope {
    ExportEnvelope {
        exported_at: Utc::now(),
        version: EXPORT_VERSION.to_string(),
        sap_integration: true,
        total_articles: articles.len(),
        articles,
    }
}

/// 全記事のアグリゲートを取得する
/// 読み出し形はgetArticleByIdと同一で、全記事に対して適用される
pub async fn fetch_all_aggregates(pool: &PgPool) -> CatalogResult<Vec<ArticleAggregate>> {
    let ids = repository::list_article_ids(pool).await?;
    let mut aggregates = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(aggregate) = repository::fetch_aggregate(pool, &id).await? {
            aggregates.push(aggregate);
        }
    }
    Ok(aggregates)
}

/// JSONエクスポートを実行する
pub async fn export_json(pool: &PgPool) -> CatalogResult<ExportEnvelope> {
    let aggregates = fetch_all_aggregates(pool).await?;
    Ok(build_envelope(aggregates))
}

// ---- SQLダンプ ----

/// 文字列をSQLリテラルとして引用する
///
/// シングルクォートは二重化し、改行・バックスラッシュを含む値は
/// E文字列としてエスケープする（ダンプを1文1行に保つため）。
pub(crate) fn sql_str(value: &str) -> String {
    if value.contains('\n') || value.contains('\r') || value.contains('\\') {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('\'', "''")
            .replace('\n', "\\n")
            .replace('\r', "\\r");
        format!("E'{}'", escaped)
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

fn sql_opt_str(value: &Option<String>) -> String {
    match value {
        Some(s) => sql_str(s),
        None => "NULL".to_string(),
    }
}

fn sql_opt_num<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(n) => n.to_string(),
        None => "NULL".to_string(),
    }
}

fn sql_bool(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

fn sql_timestamp(value: &DateTime<Utc>) -> String {
    format!("'{}'", value.to_rfc3339())
}

/// articlesテーブルのカラム一覧（INSERT順）
pub(crate) const ARTICLE_COLUMNS: &[&str] = &[
    "article_id",
    "article_type",
    "sap_item_code",
    "sap_description",
    "model",
    "family",
    "subfamily",
    "category",
    "manufacturer_id",
    "description",
    "datasheet_url",
    "weight_kg",
    "length_mm",
    "width_mm",
    "height_mm",
    "material",
    "ip_rating",
    "operating_temp_min_c",
    "operating_temp_max_c",
    "storage_temp_min_c",
    "storage_temp_max_c",
    "depth_rating_m",
    "supply_voltage_min_v",
    "supply_voltage_max_v",
    "power_consumption_w",
    "battery_type",
    "connector_type",
    "cable_length_m",
    "mounting",
    "firmware_version",
    "calibration_interval_months",
    "warranty_months",
    "country_of_origin",
    "hs_code",
    "unit_price",
    "currency",
    "stock_quantity",
    "minimum_stock",
    "notes",
    "has_heating",
    "active",
    "discontinued",
    "replacement_article_id",
    "created_at",
    "updated_at",
];

fn article_sql_values(a: &Article) -> Vec<String> {
    vec![
        sql_str(&a.article_id),
        sql_str(&a.article_type),
        sql_opt_str(&a.sap_item_code),
        sql_str(&a.sap_description),
        sql_opt_str(&a.model),
        sql_opt_str(&a.family),
        sql_opt_str(&a.subfamily),
        sql_opt_str(&a.category),
        sql_opt_num(&a.manufacturer_id),
        sql_opt_str(&a.description),
        sql_opt_str(&a.datasheet_url),
        sql_opt_num(&a.weight_kg),
        sql_opt_num(&a.length_mm),
        sql_opt_num(&a.width_mm),
        sql_opt_num(&a.height_mm),
        sql_opt_str(&a.material),
        sql_opt_str(&a.ip_rating),
        sql_opt_num(&a.operating_temp_min_c),
        sql_opt_num(&a.operating_temp_max_c),
        sql_opt_num(&a.storage_temp_min_c),
        sql_opt_num(&a.storage_temp_max_c),
        sql_opt_num(&a.depth_rating_m),
        sql_opt_num(&a.supply_voltage_min_v),
        sql_opt_num(&a.supply_voltage_max_v),
        sql_opt_num(&a.power_consumption_w),
        sql_opt_str(&a.battery_type),
        sql_opt_str(&a.connector_type),
        sql_opt_num(&a.cable_length_m),
        sql_opt_str(&a.mounting),
        sql_opt_str(&a.firmware_version),
        sql_opt_num(&a.calibration_interval_months),
        sql_opt_num(&a.warranty_months),
        sql_opt_str(&a.country_of_origin),
        sql_opt_str(&a.hs_code),
        sql_opt_num(&a.unit_price),
        sql_opt_str(&a.currency),
        sql_opt_num(&a.stock_quantity),
        sql_opt_num(&a.minimum_stock),
        sql_opt_str(&a.notes),
        sql_bool(a.has_heating).to_string(),
        sql_bool(a.active).to_string(),
        sql_bool(a.discontinued).to_string(),
        sql_opt_str(&a.replacement_article_id),
        sql_timestamp(&a.created_at),
        sql_timestamp(&a.updated_at),
    ]
}

fn push_insert(
    out: &mut String,
    table: &str,
    columns: &[&str],
    values: &[String],
    conflict_clause: &str,
) {
    out.push_str(&format!(
        "INSERT INTO {} ({}) VALUES ({}) {};\n",
        table,
        columns.join(", "),
        values.join(", "),
        conflict_clause
    ));
}

/// 自然キーを持つテーブル用のDO UPDATE句を組み立てる
pub(crate) fn do_update_clause(conflict_target: &str, columns: &[&str], skip: &[&str]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !skip.contains(*c))
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    format!(
        "ON CONFLICT ({}) DO UPDATE SET {}",
        conflict_target,
        updates.join(", ")
    )
}

/// シーケンス再同期の文を生成する
fn setval_statement(table: &str) -> String {
    format!(
        "SELECT setval(pg_get_serial_sequence('{table}', 'id'), COALESCE((SELECT MAX(id) FROM {table}), 1));\n",
        table = table
    )
}

/// PostgreSQL向けSQLダンプを生成する純レンダラ
///
/// 依存順（メーカー → 変数辞書 → 記事 → 子テーブル）のINSERT文、
/// 自然キーを持つ3テーブルはON CONFLICT DO UPDATE、それ以外はDO NOTHING。
/// 全体をトランザクションで包み、実行中は参照整合性トリガーを無効化する。
pub fn render_sql_dump(
    manufacturers: &[Manufacturer],
    variables: &[VariableDict],
    aggregates: &[ArticleAggregate],
) -> String {
    let mut out = String::new();
    out.push_str("-- InstrumentKB SQL export\n");
    out.push_str(&format!("-- exported_at: {}\n", Utc::now().to_rfc3339()));
    out.push_str("BEGIN;\n");
    out.push_str("SET session_replication_role = replica;\n");

    let manufacturer_columns = [
        "id",
        "name",
        "country",
        "website",
        "contact_email",
        "notes",
        "created_at",
    ];
    for m in manufacturers {
        push_insert(
            &mut out,
            "manufacturers",
            &manufacturer_columns,
            &[
                m.id.to_string(),
                sql_str(&m.name),
                sql_opt_str(&m.country),
                sql_opt_str(&m.website),
                sql_opt_str(&m.contact_email),
                sql_opt_str(&m.notes),
                sql_timestamp(&m.created_at),
            ],
            &do_update_clause("name", &manufacturer_columns, &["id", "name", "created_at"]),
        );
    }

    let variable_columns = ["id", "name", "default_unit", "description", "created_at"];
    for v in variables {
        push_insert(
            &mut out,
            "variables_dict",
            &variable_columns,
            &[
                v.id.to_string(),
                sql_str(&v.name),
                sql_opt_str(&v.default_unit),
                sql_opt_str(&v.description),
                sql_timestamp(&v.created_at),
            ],
            &do_update_clause("name", &variable_columns, &["id", "name", "created_at"]),
        );
    }

    for aggregate in aggregates {
        push_insert(
            &mut out,
            "articles",
            ARTICLE_COLUMNS,
            &article_sql_values(&aggregate.article),
            &do_update_clause(
                "article_id",
                ARTICLE_COLUMNS,
                &["article_id", "created_at"],
            ),
        );
    }

    // 子テーブルはidを明示して挿入し、重複はDO NOTHINGで黙って落とす
    for aggregate in aggregates {
        let id = &aggregate.article.article_id;

        for v in &aggregate.article_variables {
            push_insert(
                &mut out,
                "article_variables",
                &[
                    "id",
                    "article_id",
                    "variable_id",
                    "range_min",
                    "range_max",
                    "unit",
                    "accuracy",
                    "resolution",
                    "sample_rate_hz",
                ],
                &[
                    v.id.to_string(),
                    sql_str(id),
                    v.variable_id.to_string(),
                    sql_opt_num(&v.range_min),
                    sql_opt_num(&v.range_max),
                    sql_opt_str(&v.unit),
                    sql_opt_num(&v.accuracy),
                    sql_opt_num(&v.resolution),
                    sql_opt_num(&v.sample_rate_hz),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for p in &aggregate.article_protocols {
            push_insert(
                &mut out,
                "article_protocols",
                &[
                    "id",
                    "article_id",
                    "protocol_type",
                    "physical_layer",
                    "baudrate",
                    "data_bits",
                    "parity",
                    "stop_bits",
                    "ip_address",
                    "port",
                    "notes",
                ],
                &[
                    p.id.to_string(),
                    sql_str(id),
                    sql_str(&p.protocol_type),
                    sql_opt_str(&p.physical_layer),
                    sql_opt_num(&p.baudrate),
                    sql_opt_num(&p.data_bits),
                    sql_opt_str(&p.parity),
                    sql_opt_num(&p.stop_bits),
                    sql_opt_str(&p.ip_address),
                    sql_opt_num(&p.port),
                    sql_opt_str(&p.notes),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for o in &aggregate.analog_outputs {
            push_insert(
                &mut out,
                "analog_outputs",
                &[
                    "id",
                    "article_id",
                    "channel_name",
                    "signal_type",
                    "range_min",
                    "range_max",
                    "unit",
                ],
                &[
                    o.id.to_string(),
                    sql_str(id),
                    sql_opt_str(&o.channel_name),
                    sql_opt_str(&o.signal_type),
                    sql_opt_num(&o.range_min),
                    sql_opt_num(&o.range_max),
                    sql_opt_str(&o.unit),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for d in &aggregate.digital_io {
            push_insert(
                &mut out,
                "digital_io",
                &["id", "article_id", "channel_name", "direction", "signal_level", "notes"],
                &[
                    d.id.to_string(),
                    sql_str(id),
                    sql_opt_str(&d.channel_name),
                    sql_opt_str(&d.direction),
                    sql_opt_str(&d.signal_level),
                    sql_opt_str(&d.notes),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for doc in &aggregate.documents {
            push_insert(
                &mut out,
                "documents",
                &[
                    "id",
                    "article_id",
                    "title",
                    "doc_type",
                    "url_or_path",
                    "content_hash",
                    "uploaded_at",
                ],
                &[
                    doc.id.to_string(),
                    sql_str(id),
                    sql_opt_str(&doc.title),
                    sql_opt_str(&doc.doc_type),
                    sql_str(&doc.url_or_path),
                    sql_opt_str(&doc.content_hash),
                    sql_timestamp(&doc.uploaded_at),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for img in &aggregate.images {
            push_insert(
                &mut out,
                "images",
                &["id", "article_id", "title", "url_or_path", "is_primary", "uploaded_at"],
                &[
                    img.id.to_string(),
                    sql_str(id),
                    sql_opt_str(&img.title),
                    sql_str(&img.url_or_path),
                    sql_bool(img.is_primary).to_string(),
                    sql_timestamp(&img.uploaded_at),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for r in &aggregate.modbus_registers {
            push_insert(
                &mut out,
                "modbus_registers",
                &[
                    "id",
                    "article_id",
                    "function_code",
                    "address",
                    "name",
                    "data_type",
                    "scale",
                    "unit",
                    "access",
                    "description",
                    "document_id",
                ],
                &[
                    r.id.to_string(),
                    sql_str(id),
                    r.function_code.to_string(),
                    r.address.to_string(),
                    sql_opt_str(&r.name),
                    sql_opt_str(&r.data_type),
                    sql_opt_num(&r.scale),
                    sql_opt_str(&r.unit),
                    sql_opt_str(&r.access),
                    sql_opt_str(&r.description),
                    sql_opt_num(&r.document_id),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for c in &aggregate.sdi12_commands {
            push_insert(
                &mut out,
                "sdi12_commands",
                &["id", "article_id", "command", "description", "response_format"],
                &[
                    c.id.to_string(),
                    sql_str(id),
                    sql_str(&c.command),
                    sql_opt_str(&c.description),
                    sql_opt_str(&c.response_format),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for n in &aggregate.nmea_sentences {
            push_insert(
                &mut out,
                "nmea_sentences",
                &["id", "article_id", "sentence", "description", "fields"],
                &[
                    n.id.to_string(),
                    sql_str(id),
                    sql_str(&n.sentence),
                    sql_opt_str(&n.description),
                    sql_opt_str(&n.fields),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for tag in &aggregate.tags {
            push_insert(
                &mut out,
                "article_tags",
                &["article_id", "tag"],
                &[sql_str(id), sql_str(tag)],
                "ON CONFLICT DO NOTHING",
            );
        }

        for acc in &aggregate.accessories {
            push_insert(
                &mut out,
                "accessories",
                &["id", "article_id", "name", "sap_item_code", "quantity", "notes"],
                &[
                    acc.id.to_string(),
                    sql_str(id),
                    sql_str(&acc.name),
                    sql_opt_str(&acc.sap_item_code),
                    sql_opt_num(&acc.quantity),
                    sql_opt_str(&acc.notes),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }

        for prov in &aggregate.provenance {
            push_insert(
                &mut out,
                "provenance",
                &["id", "article_id", "source", "document_id", "imported_at", "notes"],
                &[
                    prov.id.to_string(),
                    sql_str(id),
                    sql_opt_str(&prov.source),
                    sql_opt_num(&prov.document_id),
                    sql_timestamp(&prov.imported_at),
                    sql_opt_str(&prov.notes),
                ],
                "ON CONFLICT DO NOTHING",
            );
        }
    }

    // 自動採番テーブルのシーケンスを再同期する
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
        out.push_str(&setval_statement(table));
    }

    out.push_str("SET session_replication_role = DEFAULT;\n");
    out.push_str("COMMIT;\n");
    out
}

/// SQLエクスポートを実行する
pub async fn export_sql(pool: &PgPool) -> CatalogResult<String> {
    let manufacturers = list_all_manufacturers(pool).await?;
    let variables = list_all_variables(pool).await?;
    let aggregates = fetch_all_aggregates(pool).await?;
    Ok(render_sql_dump(&manufacturers, &variables, &aggregates))
}

// ---- Excel ----

/// NULLは空文字列として出力する
fn xl_opt_str(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn xl_opt_num<T: std::fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// 真偽値は文字列リテラル "TRUE"/"FALSE" として出力する
fn xl_bool(value: bool) -> String {
    if value { "TRUE" } else { "FALSE" }.to_string()
}

fn xl_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

/// 1シートを書き出す（ヘッダー行 + 文字列レンダリング済みの行データ）
fn write_sheet(
    workbook: &mut Workbook,
    name: &str,
    headers: &[&str],
    rows: &[Vec<String>],
) -> Result<(), rust_xlsxwriter::XlsxError> {
    let sheet = workbook.add_worksheet();
    sheet.set_name(name)?;
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }
    for (row_idx, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            sheet.write_string((row_idx + 1) as u32, col as u16, value)?;
        }
    }
    Ok(())
}

pub(crate) fn article_excel_row(a: &Article) -> Vec<String> {
    vec![
        a.article_id.clone(),
        a.article_type.clone(),
        xl_opt_str(&a.sap_item_code),
        a.sap_description.clone(),
        xl_opt_str(&a.model),
        xl_opt_str(&a.family),
        xl_opt_str(&a.subfamily),
        xl_opt_str(&a.category),
        xl_opt_num(&a.manufacturer_id),
        xl_opt_str(&a.description),
        xl_opt_str(&a.datasheet_url),
        xl_opt_num(&a.weight_kg),
        xl_opt_num(&a.length_mm),
        xl_opt_num(&a.width_mm),
        xl_opt_num(&a.height_mm),
        xl_opt_str(&a.material),
        xl_opt_str(&a.ip_rating),
        xl_opt_num(&a.operating_temp_min_c),
        xl_opt_num(&a.operating_temp_max_c),
        xl_opt_num(&a.storage_temp_min_c),
        xl_opt_num(&a.storage_temp_max_c),
        xl_opt_num(&a.depth_rating_m),
        xl_opt_num(&a.supply_voltage_min_v),
        xl_opt_num(&a.supply_voltage_max_v),
        xl_opt_num(&a.power_consumption_w),
        xl_opt_str(&a.battery_type),
        xl_opt_str(&a.connector_type),
        xl_opt_num(&a.cable_length_m),
        xl_opt_str(&a.mounting),
        xl_opt_str(&a.firmware_version),
        xl_opt_num(&a.calibration_interval_months),
        xl_opt_num(&a.warranty_months),
        xl_opt_str(&a.country_of_origin),
        xl_opt_str(&a.hs_code),
        xl_opt_num(&a.unit_price),
        xl_opt_str(&a.currency),
        xl_opt_num(&a.stock_quantity),
        xl_opt_num(&a.minimum_stock),
        xl_opt_str(&a.notes),
        xl_bool(a.has_heating),
        xl_bool(a.active),
        xl_bool(a.discontinued),
        xl_opt_str(&a.replacement_article_id),
        xl_timestamp(&a.created_at),
        xl_timestamp(&a.updated_at),
    ]
}

/// Excelワークブックを生成する純レンダラ
/// 1テーブル1シート + Metadataシート
pub fn render_excel(
    manufacturers: &[Manufacturer],
    variables: &[VariableDict],
    aggregates: &[ArticleAggregate],
) -> CatalogResult<Vec<u8>> {
    let mut workbook = Workbook::new();

    let result: Result<(), rust_xlsxwriter::XlsxError> = (|| {
        write_sheet(
            &mut workbook,
            "Articles",
            ARTICLE_COLUMNS,
            &aggregates
                .iter()
                .map(|a| article_excel_row(&a.article))
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Manufacturers",
            &["id", "name", "country", "website", "contact_email", "notes", "created_at"],
            &manufacturers
                .iter()
                .map(|m| {
                    vec![
                        m.id.to_string(),
                        m.name.clone(),
                        xl_opt_str(&m.country),
                        xl_opt_str(&m.website),
                        xl_opt_str(&m.contact_email),
                        xl_opt_str(&m.notes),
                        xl_timestamp(&m.created_at),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Variables",
            &["id", "name", "default_unit", "description", "created_at"],
            &variables
                .iter()
                .map(|v| {
                    vec![
                        v.id.to_string(),
                        v.name.clone(),
                        xl_opt_str(&v.default_unit),
                        xl_opt_str(&v.description),
                        xl_timestamp(&v.created_at),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "ArticleVariables",
            &[
                "id", "article_id", "variable_id", "variable_name", "range_min", "range_max",
                "unit", "accuracy", "resolution", "sample_rate_hz",
            ],
            &aggregates
                .iter()
                .flat_map(|a| a.article_variables.iter())
                .map(|v| {
                    vec![
                        v.id.to_string(),
                        v.article_id.clone(),
                        v.variable_id.to_string(),
                        v.variable
                            .as_ref()
                            .map(|d| d.name.clone())
                            .unwrap_or_default(),
                        xl_opt_num(&v.range_min),
                        xl_opt_num(&v.range_max),
                        xl_opt_str(&v.unit),
                        xl_opt_num(&v.accuracy),
                        xl_opt_num(&v.resolution),
                        xl_opt_num(&v.sample_rate_hz),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Protocols",
            &[
                "id", "article_id", "protocol_type", "physical_layer", "baudrate", "data_bits",
                "parity", "stop_bits", "ip_address", "port", "notes",
            ],
            &aggregates
                .iter()
                .flat_map(|a| a.article_protocols.iter())
                .map(|p| {
                    vec![
                        p.id.to_string(),
                        p.article_id.clone(),
                        p.protocol_type.clone(),
                        xl_opt_str(&p.physical_layer),
                        xl_opt_num(&p.baudrate),
                        xl_opt_num(&p.data_bits),
                        xl_opt_str(&p.parity),
                        xl_opt_num(&p.stop_bits),
                        xl_opt_str(&p.ip_address),
                        xl_opt_num(&p.port),
                        xl_opt_str(&p.notes),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "AnalogOutputs",
            &["id", "article_id", "channel_name", "signal_type", "range_min", "range_max", "unit"],
            &aggregates
                .iter()
                .flat_map(|a| a.analog_outputs.iter())
                .map(|o| {
                    vec![
                        o.id.to_string(),
                        o.article_id.clone(),
                        xl_opt_str(&o.channel_name),
                        xl_opt_str(&o.signal_type),
                        xl_opt_num(&o.range_min),
                        xl_opt_num(&o.range_max),
                        xl_opt_str(&o.unit),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "DigitalIO",
            &["id", "article_id", "channel_name", "direction", "signal_level", "notes"],
            &aggregates
                .iter()
                .flat_map(|a| a.digital_io.iter())
                .map(|d| {
                    vec![
                        d.id.to_string(),
                        d.article_id.clone(),
                        xl_opt_str(&d.channel_name),
                        xl_opt_str(&d.direction),
                        xl_opt_str(&d.signal_level),
                        xl_opt_str(&d.notes),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "ModbusRegisters",
            &[
                "id", "article_id", "function_code", "address", "name", "data_type", "scale",
                "unit", "access", "description", "document_id",
            ],
            &aggregates
                .iter()
                .flat_map(|a| a.modbus_registers.iter())
                .map(|r| {
                    vec![
                        r.id.to_string(),
                        r.article_id.clone(),
                        r.function_code.to_string(),
                        r.address.to_string(),
                        xl_opt_str(&r.name),
                        xl_opt_str(&r.data_type),
                        xl_opt_num(&r.scale),
                        xl_opt_str(&r.unit),
                        xl_opt_str(&r.access),
                        xl_opt_str(&r.description),
                        xl_opt_num(&r.document_id),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "SDI12Commands",
            &["id", "article_id", "command", "description", "response_format"],
            &aggregates
                .iter()
                .flat_map(|a| a.sdi12_commands.iter())
                .map(|c| {
                    vec![
                        c.id.to_string(),
                        c.article_id.clone(),
                        c.command.clone(),
                        xl_opt_str(&c.description),
                        xl_opt_str(&c.response_format),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "NMEASentences",
            &["id", "article_id", "sentence", "description", "fields"],
            &aggregates
                .iter()
                .flat_map(|a| a.nmea_sentences.iter())
                .map(|n| {
                    vec![
                        n.id.to_string(),
                        n.article_id.clone(),
                        n.sentence.clone(),
                        xl_opt_str(&n.description),
                        xl_opt_str(&n.fields),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Documents",
            &["id", "article_id", "title", "doc_type", "url_or_path", "content_hash", "uploaded_at"],
            &aggregates
                .iter()
                .flat_map(|a| a.documents.iter())
                .map(|d| {
                    vec![
                        d.id.to_string(),
                        d.article_id.clone(),
                        xl_opt_str(&d.title),
                        xl_opt_str(&d.doc_type),
                        d.url_or_path.clone(),
                        xl_opt_str(&d.content_hash),
                        xl_timestamp(&d.uploaded_at),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Images",
            &["id", "article_id", "title", "url_or_path", "is_primary", "uploaded_at"],
            &aggregates
                .iter()
                .flat_map(|a| a.images.iter())
                .map(|i| {
                    vec![
                        i.id.to_string(),
                        i.article_id.clone(),
                        xl_opt_str(&i.title),
                        i.url_or_path.clone(),
                        xl_bool(i.is_primary),
                        xl_timestamp(&i.uploaded_at),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Tags",
            &["article_id", "tag"],
            &aggregates
                .iter()
                .flat_map(|a| a.tags.iter().map(move |t| (a.article.article_id.clone(), t)))
                .map(|(id, tag)| vec![id, tag.clone()])
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Accessories",
            &["id", "article_id", "name", "sap_item_code", "quantity", "notes"],
            &aggregates
                .iter()
                .flat_map(|a| a.accessories.iter())
                .map(|acc| {
                    vec![
                        acc.id.to_string(),
                        acc.article_id.clone(),
                        acc.name.clone(),
                        xl_opt_str(&acc.sap_item_code),
                        xl_opt_num(&acc.quantity),
                        xl_opt_str(&acc.notes),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Provenance",
            &["id", "article_id", "source", "document_id", "imported_at", "notes"],
            &aggregates
                .iter()
                .flat_map(|a| a.provenance.iter())
                .map(|p| {
                    vec![
                        p.id.to_string(),
                        p.article_id.clone(),
                        xl_opt_str(&p.source),
                        xl_opt_num(&p.document_id),
                        xl_timestamp(&p.imported_at),
                        xl_opt_str(&p.notes),
                    ]
                })
                .collect::<Vec<_>>(),
        )?;

        write_sheet(
            &mut workbook,
            "Metadata",
            &["key", "value"],
            &[
                vec!["exported_at".to_string(), Utc::now().to_rfc3339()],
                vec!["version".to_string(), EXPORT_VERSION.to_string()],
                vec!["sap_integration".to_string(), "TRUE".to_string()],
                vec!["total_articles".to_string(), aggregates.len().to_string()],
            ],
        )?;

        Ok(())
    })();

    result.map_err(|e| CatalogError::export(format!("Excelワークブック生成に失敗: {}", e)))?;

    workbook
        .save_to_buffer()
        .map(|b| b.to_vec())
        .map_err(|e| CatalogError::export(format!("Excelバッファ書き出しに失敗: {}", e)))
}

/// Excelエクスポートを実行する
pub async fn export_excel(pool: &PgPool) -> CatalogResult<Vec<u8>> {
    let manufacturers = list_all_manufacturers(pool).await?;
    let variables = list_all_variables(pool).await?;
    let aggregates = fetch_all_aggregates(pool).await?;
    render_excel(&manufacturers, &variables, &aggregates)
}

// ---- ZIP ----

/// アグリゲート群が参照するストレージ管理下のファイルパスを重複なしで集める
/// （外部URLは対象外）
pub(crate) fn collect_file_references(aggregates: &[ArticleAggregate]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for aggregate in aggregates {
        for path in aggregate
            .documents
            .iter()
            .map(|d| d.url_or_path.as_str())
            .chain(aggregate.images.iter().map(|i| i.url_or_path.as_str()))
        {
            if is_external_url(path) {
                continue;
            }
            if seen.insert(path.to_string()) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// ZIPバンドルを生成する純レンダラ
///
/// data.json（JSONエクスポートと同一のエンベロープ）、参照される実ファイル
/// （uploads/プレフィックス配下、相対パス維持）、所在不明ファイルの一覧を
/// 含むREADME.txtをまとめる。
pub fn render_zip(
    envelope: &ExportEnvelope,
    storage: &FileStorage,
) -> CatalogResult<Vec<u8>> {
    let json_bytes = serde_json::to_vec_pretty(envelope)
        .map_err(|e| CatalogError::export(format!("data.jsonの直列化に失敗: {}", e)))?;

    let mut cursor = Cursor::new(Vec::new());
    let mut missing: Vec<String> = Vec::new();
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        writer
            .start_file("data.json", options)
            .map_err(|e| CatalogError::export(format!("data.jsonエントリ作成に失敗: {}", e)))?;
        writer
            .write_all(&json_bytes)
            .map_err(|e| CatalogError::export(format!("data.json書き込みに失敗: {}", e)))?;

        for relative in collect_file_references(&envelope.articles) {
            let full_path = storage.resolve(&relative);
            if !full_path.is_file() {
                missing.push(relative);
                continue;
            }

            let mut file = std::fs::File::open(&full_path)
                .map_err(|e| CatalogError::storage(full_path.to_string_lossy(), e))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| CatalogError::storage(full_path.to_string_lossy(), e))?;

            let entry_name = format!("uploads/{}", relative.replace('\\', "/"));
            writer
                .start_file(entry_name, options)
                .map_err(|e| CatalogError::export(format!("ZIPエントリ作成に失敗: {}", e)))?;
            writer
                .write_all(&contents)
                .map_err(|e| CatalogError::export(format!("ZIPエントリ書き込みに失敗: {}", e)))?;
        }

        let mut readme = String::new();
        readme.push_str("InstrumentKB export bundle\n");
        readme.push_str(&format!("exported_at: {}\n", envelope.exported_at.to_rfc3339()));
        readme.push_str(&format!("total_articles: {}\n", envelope.total_articles));
        readme.push_str("\ndata.json: 全記事アグリゲートのJSONエクスポート\n");
        readme.push_str("uploads/: ドキュメント・画像の実ファイル（相対パス維持）\n");
        if missing.is_empty() {
            readme.push_str("\nすべての参照ファイルを同梱しました。\n");
        } else {
            readme.push_str("\n以下の参照ファイルはディスク上に見つからず、同梱されていません:\n");
            for path in &missing {
                readme.push_str(&format!("  - {}\n", path));
            }
        }

        writer
            .start_file("README.txt", options)
            .map_err(|e| CatalogError::export(format!("READMEエントリ作成に失敗: {}", e)))?;
        writer
            .write_all(readme.as_bytes())
            .map_err(|e| CatalogError::export(format!("README書き込みに失敗: {}", e)))?;

        writer
            .finish()
            .map_err(|e| CatalogError::export(format!("ZIPの完了処理に失敗: {}", e)))?;
    }

    Ok(cursor.into_inner())
}

/// ZIPエクスポートを実行する
pub async fn export_zip(pool: &PgPool, storage: &FileStorage) -> CatalogResult<Vec<u8>> {
    let envelope = export_json(pool).await?;
    render_zip(&envelope, storage)
}
