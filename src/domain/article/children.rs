//! 子テーブル行の操作
//!
//! アグリゲート書き込み経路（全置換）と子テーブル単体のRESTルートの
//! 両方から使用されるSQL群。挿入はExecutor総称で、トランザクション内
//! （`&mut **tx`）からもプール直接からも呼び出せる。

use crate::domain::article::model::{
    Accessory, AccessoryInput, AnalogOutput, AnalogOutputInput, ArticleProtocol, ArticleVariable,
    DigitalIo, DigitalIoInput, Document, DocumentInput, Image, ImageInput, ModbusRegister,
    ModbusRegisterInput, NmeaSentence, NmeaSentenceInput, ProtocolInput, Provenance,
    ProvenanceInput, Sdi12Command, Sdi12CommandInput, VariableLinkInput,
};
use crate::domain::variable::{upsert_variable_by_name, VariableDict};
use crate::types::{CatalogError, CatalogResult};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgRow};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};

/// 全置換の対象となる子テーブル名
/// （タグと来歴も含む。削除順は外部キーの都合でmodbus/provenanceを
/// documentsより先にする）
pub(crate) const CHILD_TABLES: &[&str] = &[
    "article_variables",
    "article_protocols",
    "analog_outputs",
    "digital_io",
    "modbus_registers",
    "sdi12_commands",
    "nmea_sentences",
    "provenance",
    "documents",
    "images",
    "article_tags",
    "accessories",
];

/// 指定した子テーブルから記事の行を全削除する
/// テーブル名はCHILD_TABLESの固定値のみを渡すこと
pub(crate) async fn delete_child_rows(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    article_id: &str,
) -> CatalogResult<()> {
    debug_assert!(CHILD_TABLES.contains(&table));
    sqlx::query(&format!("DELETE FROM {} WHERE article_id = $1", table))
        .bind(article_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| CatalogError::database(format!("{}の全削除", table), e))?;
    Ok(())
}

// ---- 測定変数 ----

/// 変数辞書JOIN済みの測定変数行
#[derive(FromRow)]
struct VariableLinkRow {
    id: i32,
    article_id: String,
    variable_id: i32,
    range_min: Option<f64>,
    range_max: Option<f64>,
    unit: Option<String>,
    accuracy: Option<f64>,
    resolution: Option<f64>,
    sample_rate_hz: Option<f64>,
    v_name: String,
    v_default_unit: Option<String>,
    v_description: Option<String>,
    v_created_at: DateTime<Utc>,
}

impl From<VariableLinkRow> for ArticleVariable {
    fn from(row: VariableLinkRow) -> Self {
        ArticleVariable {
            id: row.id,
            article_id: row.article_id,
            variable_id: row.variable_id,
            range_min: row.range_min,
            range_max: row.range_max,
            unit: row.unit,
            accuracy: row.accuracy,
            resolution: row.resolution,
            sample_rate_hz: row.sample_rate_hz,
            variable: Some(VariableDict {
                id: row.variable_id,
                name: row.v_name,
                default_unit: row.v_default_unit,
                description: row.v_description,
                created_at: row.v_created_at,
            }),
        }
    }
}

const VARIABLE_LINK_SELECT: &str = "SELECT av.id, av.article_id, av.variable_id, av.range_min, \
     av.range_max, av.unit, av.accuracy, av.resolution, av.sample_rate_hz, \
     v.name AS v_name, v.default_unit AS v_default_unit, \
     v.description AS v_description, v.created_at AS v_created_at \
     FROM article_variables av JOIN variables_dict v ON av.variable_id = v.id";

/// 記事の測定変数を変数辞書JOIN付きで取得する
pub async fn fetch_variables(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<ArticleVariable>> {
    let rows = sqlx::query_as::<_, VariableLinkRow>(&format!(
        "{} WHERE av.article_id = $1 ORDER BY av.id",
        VARIABLE_LINK_SELECT
    ))
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("測定変数取得", e))?;

    Ok(rows.into_iter().map(ArticleVariable::from).collect())
}

/// 複数記事の測定変数を一括取得する（検索ページ用のバッチクエリ）
pub async fn fetch_variables_for_articles(
    pool: &PgPool,
    article_ids: &[String],
) -> CatalogResult<Vec<ArticleVariable>> {
    let rows = sqlx::query_as::<_, VariableLinkRow>(&format!(
        "{} WHERE av.article_id = ANY($1) ORDER BY av.id",
        VARIABLE_LINK_SELECT
    ))
    .bind(article_ids)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("測定変数一括取得", e))?;

    Ok(rows.into_iter().map(ArticleVariable::from).collect())
}

/// 測定変数リンクを挿入する
///
/// variable_id直接指定がなければ、埋め込みvariable.nameで変数辞書を
/// アップサートして解決する。どちらも無い場合は検証エラー。
pub async fn insert_variable_link(
    tx: &mut Transaction<'_, Postgres>,
    article_id: &str,
    link: &VariableLinkInput,
) -> CatalogResult<()> {
    let variable_id = match (link.variable_id, &link.variable) {
        (Some(id), _) => id,
        (None, Some(dict)) => upsert_variable_by_name(tx, dict).await?,
        (None, None) => {
            return Err(CatalogError::validation(
                "測定変数にはvariable_idまたはvariable.nameが必要です",
            ));
        }
    };

    sqlx::query(
        "INSERT INTO article_variables \
         (article_id, variable_id, range_min, range_max, unit, accuracy, resolution, sample_rate_hz) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(article_id)
    .bind(variable_id)
    .bind(link.range_min)
    .bind(link.range_max)
    .bind(&link.unit)
    .bind(link.accuracy)
    .bind(link.resolution)
    .bind(link.sample_rate_hz)
    .execute(&mut **tx)
    .await
    .map_err(|e| CatalogError::from_sqlx("測定変数挿入", e))?;

    Ok(())
}

// ---- 通信プロトコル ----

pub async fn fetch_protocols(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<ArticleProtocol>> {
    sqlx::query_as::<_, ArticleProtocol>(
        "SELECT * FROM article_protocols WHERE article_id = $1 ORDER BY id",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("プロトコル取得", e))
}

pub async fn fetch_protocols_for_articles(
    pool: &PgPool,
    article_ids: &[String],
) -> CatalogResult<Vec<ArticleProtocol>> {
    sqlx::query_as::<_, ArticleProtocol>(
        "SELECT * FROM article_protocols WHERE article_id = ANY($1) ORDER BY id",
    )
    .bind(article_ids)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("プロトコル一括取得", e))
}

pub async fn insert_protocol<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &ProtocolInput,
) -> CatalogResult<ArticleProtocol> {
    sqlx::query_as::<_, ArticleProtocol>(
        "INSERT INTO article_protocols \
         (article_id, protocol_type, physical_layer, baudrate, data_bits, parity, stop_bits, \
          ip_address, port, notes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.protocol_type)
    .bind(&input.physical_layer)
    .bind(input.baudrate)
    .bind(input.data_bits)
    .bind(&input.parity)
    .bind(input.stop_bits)
    .bind(&input.ip_address)
    .bind(input.port)
    .bind(&input.notes)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("プロトコル挿入", e))
}

// ---- アナログ出力 ----

pub async fn fetch_analog_outputs(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<AnalogOutput>> {
    sqlx::query_as::<_, AnalogOutput>(
        "SELECT * FROM analog_outputs WHERE article_id = $1 ORDER BY id",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("アナログ出力取得", e))
}

pub async fn insert_analog_output<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &AnalogOutputInput,
) -> CatalogResult<AnalogOutput> {
    sqlx::query_as::<_, AnalogOutput>(
        "INSERT INTO analog_outputs (article_id, channel_name, signal_type, range_min, range_max, unit) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.channel_name)
    .bind(&input.signal_type)
    .bind(input.range_min)
    .bind(input.range_max)
    .bind(&input.unit)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("アナログ出力挿入", e))
}

// ---- デジタル入出力 ----

pub async fn fetch_digital_io(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<DigitalIo>> {
    sqlx::query_as::<_, DigitalIo>("SELECT * FROM digital_io WHERE article_id = $1 ORDER BY id")
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("デジタル入出力取得", e))
}

pub async fn insert_digital_io<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &DigitalIoInput,
) -> CatalogResult<DigitalIo> {
    sqlx::query_as::<_, DigitalIo>(
        "INSERT INTO digital_io (article_id, channel_name, direction, signal_level, notes) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.channel_name)
    .bind(&input.direction)
    .bind(&input.signal_level)
    .bind(&input.notes)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("デジタル入出力挿入", e))
}

// ---- Modbusレジスタ ----

pub async fn fetch_modbus_registers(
    pool: &PgPool,
    article_id: &str,
) -> CatalogResult<Vec<ModbusRegister>> {
    // レジスタはアドレス順で返す
    sqlx::query_as::<_, ModbusRegister>(
        "SELECT * FROM modbus_registers WHERE article_id = $1 ORDER BY address",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("Modbusレジスタ取得", e))
}

pub async fn insert_modbus_register<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &ModbusRegisterInput,
    document_id: Option<i32>,
) -> CatalogResult<ModbusRegister> {
    sqlx::query_as::<_, ModbusRegister>(
        "INSERT INTO modbus_registers \
         (article_id, function_code, address, name, data_type, scale, unit, access, description, document_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
    )
    .bind(article_id)
    .bind(input.function_code)
    .bind(input.address)
    .bind(&input.name)
    .bind(&input.data_type)
    .bind(input.scale)
    .bind(&input.unit)
    .bind(&input.access)
    .bind(&input.description)
    .bind(document_id)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("Modbusレジスタ挿入", e))
}

// ---- SDI-12コマンド ----

pub async fn fetch_sdi12_commands(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<Sdi12Command>> {
    sqlx::query_as::<_, Sdi12Command>(
        "SELECT * FROM sdi12_commands WHERE article_id = $1 ORDER BY command",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("SDI-12コマンド取得", e))
}

pub async fn insert_sdi12_command<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &Sdi12CommandInput,
) -> CatalogResult<Sdi12Command> {
    sqlx::query_as::<_, Sdi12Command>(
        "INSERT INTO sdi12_commands (article_id, command, description, response_format) \
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.command)
    .bind(&input.description)
    .bind(&input.response_format)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("SDI-12コマンド挿入", e))
}

// ---- NMEAセンテンス ----

pub async fn fetch_nmea_sentences(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<NmeaSentence>> {
    sqlx::query_as::<_, NmeaSentence>(
        "SELECT * FROM nmea_sentences WHERE article_id = $1 ORDER BY sentence",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("NMEAセンテンス取得", e))
}

pub async fn insert_nmea_sentence<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &NmeaSentenceInput,
) -> CatalogResult<NmeaSentence> {
    sqlx::query_as::<_, NmeaSentence>(
        "INSERT INTO nmea_sentences (article_id, sentence, description, fields) \
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.sentence)
    .bind(&input.description)
    .bind(&input.fields)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("NMEAセンテンス挿入", e))
}

// ---- ドキュメント・画像 ----

pub async fn fetch_documents(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<Document>> {
    sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE article_id = $1 ORDER BY id")
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("ドキュメント取得", e))
}

/// ドキュメント行を挿入し、新しいidを返す
pub async fn insert_document<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &DocumentInput,
) -> CatalogResult<Document> {
    sqlx::query_as::<_, Document>(
        "INSERT INTO documents (article_id, title, doc_type, url_or_path, content_hash) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.title)
    .bind(&input.doc_type)
    .bind(&input.url_or_path)
    .bind(&input.content_hash)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("ドキュメント挿入", e))
}

pub async fn fetch_images(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<Image>> {
    sqlx::query_as::<_, Image>("SELECT * FROM images WHERE article_id = $1 ORDER BY id")
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("画像取得", e))
}

pub async fn insert_image<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &ImageInput,
) -> CatalogResult<Image> {
    sqlx::query_as::<_, Image>(
        "INSERT INTO images (article_id, title, url_or_path, is_primary) \
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.title)
    .bind(&input.url_or_path)
    .bind(input.is_primary.unwrap_or(false))
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("画像挿入", e))
}

/// ドキュメント・画像行を1件削除し、ファイル削除用にパスを返す
pub async fn delete_file_row(
    pool: &PgPool,
    table: &str,
    id: i32,
) -> CatalogResult<Option<String>> {
    debug_assert!(table == "documents" || table == "images");
    sqlx::query_scalar::<_, String>(&format!(
        "DELETE FROM {} WHERE id = $1 RETURNING url_or_path",
        table
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| CatalogError::database(format!("{}の削除", table), e))
}

// ---- タグ ----

pub async fn fetch_tags(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT tag FROM article_tags WHERE article_id = $1 ORDER BY id",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("タグ取得", e))
}

/// 複数記事のタグを一括取得する（検索ページ用）
#[derive(FromRow)]
pub(crate) struct TagRow {
    pub article_id: String,
    pub tag: String,
}

pub(crate) async fn fetch_tags_for_articles(
    pool: &PgPool,
    article_ids: &[String],
) -> CatalogResult<Vec<TagRow>> {
    sqlx::query_as::<_, TagRow>(
        "SELECT article_id, tag FROM article_tags WHERE article_id = ANY($1) ORDER BY id",
    )
    .bind(article_ids)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("タグ一括取得", e))
}

pub async fn insert_tag<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    tag: &str,
) -> CatalogResult<()> {
    sqlx::query("INSERT INTO article_tags (article_id, tag) VALUES ($1, $2)")
        .bind(article_id)
        .bind(tag)
        .execute(executor)
        .await
        .map_err(|e| CatalogError::from_sqlx("タグ挿入", e))?;
    Ok(())
}

// ---- アクセサリ ----

pub async fn fetch_accessories(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<Accessory>> {
    sqlx::query_as::<_, Accessory>("SELECT * FROM accessories WHERE article_id = $1 ORDER BY id")
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("アクセサリ取得", e))
}

pub async fn insert_accessory<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &AccessoryInput,
) -> CatalogResult<Accessory> {
    sqlx::query_as::<_, Accessory>(
        "INSERT INTO accessories (article_id, name, sap_item_code, quantity, notes) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(article_id)
    .bind(&input.name)
    .bind(&input.sap_item_code)
    .bind(input.quantity)
    .bind(&input.notes)
    .fetch_one(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("アクセサリ挿入", e))
}

// ---- 来歴 ----

pub async fn fetch_provenance(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<Provenance>> {
    sqlx::query_as::<_, Provenance>("SELECT * FROM provenance WHERE article_id = $1 ORDER BY id")
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("来歴取得", e))
}

pub async fn insert_provenance<'e, E: PgExecutor<'e>>(
    executor: E,
    article_id: &str,
    input: &ProvenanceInput,
    document_id: Option<i32>,
) -> CatalogResult<()> {
    sqlx::query(
        "INSERT INTO provenance (article_id, source, document_id, notes) VALUES ($1, $2, $3, $4)",
    )
    .bind(article_id)
    .bind(&input.source)
    .bind(document_id)
    .bind(&input.notes)
    .execute(executor)
    .await
    .map_err(|e| CatalogError::from_sqlx("来歴挿入", e))?;
    Ok(())
}

// ---- 子テーブル単体ルート用の汎用操作 ----

/// 子テーブルの行を汎用的に一覧取得する（任意でarticle_id絞り込み）
pub async fn list_child_rows<T>(
    pool: &PgPool,
    table: &str,
    article_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> CatalogResult<(Vec<T>, i64)>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    debug_assert!(CHILD_TABLES.contains(&table));

    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {}", table));
    if let Some(id) = article_id {
        qb.push(" WHERE article_id = ").push_bind(id);
    }
    qb.push(" ORDER BY id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb
        .build_query_as::<T>()
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database(format!("{}一覧取得", table), e))?;

    let mut count_qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", table));
    if let Some(id) = article_id {
        count_qb.push(" WHERE article_id = ").push_bind(id);
    }
    let total: i64 = count_qb
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .map_err(|e| CatalogError::database(format!("{}件数取得", table), e))?;

    Ok((rows, total))
}

/// 子テーブルの行をidで1件削除する。削除された場合trueを返す
pub async fn delete_child_row(pool: &PgPool, table: &str, id: i32) -> CatalogResult<bool> {
    debug_assert!(CHILD_TABLES.contains(&table));
    let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", table))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| CatalogError::database(format!("{}の行削除", table), e))?;
    Ok(result.rows_affected() > 0)
}
