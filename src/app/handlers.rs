//! HTTPハンドラ
//!
//! ルートは薄く保ち、検証・SQL・トランザクションはドメイン層のサービスに
//! 委譲する。CatalogErrorはIntoResponseでHTTPステータスへ写像される。

use crate::app::export;
use crate::app::import;
use crate::app::server::AppState;
use crate::domain::article::model::{
    AccessoryInput, AnalogOutputInput, ArticleInput, DigitalIoInput, DocumentInput, ImageInput,
    ModbusRegisterInput, NmeaSentenceInput, ProtocolInput, Sdi12CommandInput,
};
use crate::domain::article::repository::{self, MetaField, SearchQuery};
use crate::domain::article::{children, service};
use crate::domain::manufacturer::{self, ManufacturerInput};
use crate::domain::variable::{self, VariableDictInput};
use crate::infra::compute::hash_bytes;
use crate::infra::storage::file::{DOCUMENTS_DIR, IMAGES_DIR};
use crate::types::CatalogError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

impl IntoResponse for CatalogError {
    fn into_response(self) -> Response {
        let status = match &self {
            CatalogError::Validation { .. }
            | CatalogError::Conflict { .. }
            | CatalogError::InvalidReference { .. }
            | CatalogError::Import { .. } => StatusCode::BAD_REQUEST,
            CatalogError::NotFound { .. } => StatusCode::NOT_FOUND,
            CatalogError::Database { .. }
            | CatalogError::Storage { .. }
            | CatalogError::Export { .. }
            | CatalogError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "内部エラー");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// ページネーションのクエリパラメータ
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl PageParams {
    /// (page, limit, offset) に解決する。limitは1〜500に制限
    pub fn resolve(&self) -> (i64, i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(50).clamp(1, 500);
        (page, limit, (page - 1) * limit)
    }
}

/// レスポンスのページネーション情報
#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        Self {
            page,
            limit,
            total,
            pages: (total + limit - 1) / limit,
        }
    }
}

// ---- ヘルスチェック ----

pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, CatalogError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| CatalogError::database("ヘルスチェック", e))?;
    Ok(Json(json!({ "status": "ok" })))
}

// ---- 記事 ----

pub async fn list_articles(
    State(state): State<AppState>,
    Query(page_params): Query<PageParams>,
) -> Result<Json<Value>, CatalogError> {
    let (page, limit, offset) = page_params.resolve();
    let (articles, total) =
        repository::search_articles(&state.pool, &SearchQuery::default(), limit, offset).await?;

    Ok(Json(json!({
        "articles": articles,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn search_articles(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    Query(page_params): Query<PageParams>,
) -> Result<Json<Value>, CatalogError> {
    let (page, limit, offset) = page_params.resolve();
    let (articles, total) =
        repository::search_articles(&state.pool, &query, limit, offset).await?;

    Ok(Json(json!({
        "articles": articles,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn create_article(
    State(state): State<AppState>,
    Json(input): Json<ArticleInput>,
) -> Result<impl IntoResponse, CatalogError> {
    let aggregate = service::create_article(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(aggregate)))
}

pub async fn get_article(
    State(state): State<AppState>,
    Path(article_id): Path<String>,
) -> Result<impl IntoResponse, CatalogError> {
    let aggregate = service::get_article(&state.pool, &article_id).await?;
    Ok(Json(aggregate))
}

pub async fn update_article(
    State(state): State<AppState>,
    Path(article_id): Path<String>,
    Json(input): Json<ArticleInput>,
) -> Result<impl IntoResponse, CatalogError> {
    let aggregate =
        service::update_article(&state.pool, &state.storage, &article_id, &input).await?;
    Ok(Json(aggregate))
}

pub async fn delete_article(
    State(state): State<AppState>,
    Path(article_id): Path<String>,
) -> Result<impl IntoResponse, CatalogError> {
    service::delete_article(&state.pool, &state.storage, &article_id).await?;
    Ok(Json(json!({ "message": format!("記事 {} を削除しました", article_id) })))
}

// ---- メタ情報 ----

async fn meta_values(state: &AppState, field: MetaField, key: &str) -> Result<Json<Value>, CatalogError> {
    let values = repository::distinct_meta_values(&state.pool, field).await?;
    Ok(Json(json!({ key: values })))
}

pub async fn meta_families(State(state): State<AppState>) -> Result<Json<Value>, CatalogError> {
    meta_values(&state, MetaField::Family, "families").await
}

pub async fn meta_subfamilies(State(state): State<AppState>) -> Result<Json<Value>, CatalogError> {
    meta_values(&state, MetaField::Subfamily, "subfamilies").await
}

pub async fn meta_types(State(state): State<AppState>) -> Result<Json<Value>, CatalogError> {
    meta_values(&state, MetaField::ArticleType, "types").await
}

pub async fn meta_categories(State(state): State<AppState>) -> Result<Json<Value>, CatalogError> {
    meta_values(&state, MetaField::Category, "categories").await
}

// ---- 子テーブルルート ----

/// 子テーブル一覧のクエリパラメータ
#[derive(Debug, Default, Deserialize)]
pub struct ChildListParams {
    pub article_id: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// 子テーブル作成ペイロード（article_id + 各テーブルの入力）
#[derive(Debug, Deserialize)]
pub struct WithArticleId<T> {
    pub article_id: String,
    #[serde(flatten)]
    pub input: T,
}

macro_rules! child_handlers {
    ($list_fn:ident, $create_fn:ident, $delete_fn:ident, $table:literal, $key:literal,
     $row_ty:ty, $input_ty:ty, $insert:path) => {
        pub async fn $list_fn(
            State(state): State<AppState>,
            Query(params): Query<ChildListParams>,
        ) -> Result<Json<Value>, CatalogError> {
            let page_params = PageParams {
                page: params.page,
                limit: params.limit,
            };
            let (page, limit, offset) = page_params.resolve();
            let (rows, total) = children::list_child_rows::<$row_ty>(
                &state.pool,
                $table,
                params.article_id.as_deref(),
                limit,
                offset,
            )
            .await?;

            Ok(Json(json!({
                $key: rows,
                "pagination": Pagination::new(page, limit, total),
            })))
        }

        pub async fn $create_fn(
            State(state): State<AppState>,
            Json(payload): Json<WithArticleId<$input_ty>>,
        ) -> Result<impl IntoResponse, CatalogError> {
            let row = $insert(&state.pool, &payload.article_id, &payload.input).await?;
            Ok((StatusCode::CREATED, Json(row)))
        }

        pub async fn $delete_fn(
            State(state): State<AppState>,
            Path(id): Path<i32>,
        ) -> Result<impl IntoResponse, CatalogError> {
            let deleted = children::delete_child_row(&state.pool, $table, id).await?;
            if !deleted {
                return Err(CatalogError::not_found(format!("{} {}", $table, id)));
            }
            Ok(Json(json!({ "message": "削除しました" })))
        }
    };
}

child_handlers!(
    list_protocols,
    create_protocol,
    delete_protocol,
    "article_protocols",
    "protocols",
    crate::domain::article::model::ArticleProtocol,
    ProtocolInput,
    children::insert_protocol
);

child_handlers!(
    list_analog_outputs,
    create_analog_output,
    delete_analog_output,
    "analog_outputs",
    "analog_outputs",
    crate::domain::article::model::AnalogOutput,
    AnalogOutputInput,
    children::insert_analog_output
);

child_handlers!(
    list_digital_io,
    create_digital_io,
    delete_digital_io,
    "digital_io",
    "digital_io",
    crate::domain::article::model::DigitalIo,
    DigitalIoInput,
    children::insert_digital_io
);

child_handlers!(
    list_sdi12_commands,
    create_sdi12_command,
    delete_sdi12_command,
    "sdi12_commands",
    "sdi12_commands",
    crate::domain::article::model::Sdi12Command,
    Sdi12CommandInput,
    children::insert_sdi12_command
);

child_handlers!(
    list_nmea_sentences,
    create_nmea_sentence,
    delete_nmea_sentence,
    "nmea_sentences",
    "nmea_sentences",
    crate::domain::article::model::NmeaSentence,
    NmeaSentenceInput,
    children::insert_nmea_sentence
);

child_handlers!(
    list_accessories,
    create_accessory,
    delete_accessory,
    "accessories",
    "accessories",
    crate::domain::article::model::Accessory,
    AccessoryInput,
    children::insert_accessory
);

/// Modbusレジスタはdocument_id引数があるためマクロの外で定義する
pub async fn list_modbus_registers(
    State(state): State<AppState>,
    Query(params): Query<ChildListParams>,
) -> Result<Json<Value>, CatalogError> {
    let page_params = PageParams {
        page: params.page,
        limit: params.limit,
    };
    let (page, limit, offset) = page_params.resolve();
    let (rows, total) = children::list_child_rows::<crate::domain::article::model::ModbusRegister>(
        &state.pool,
        "modbus_registers",
        params.article_id.as_deref(),
        limit,
        offset,
    )
    .await?;

    Ok(Json(json!({
        "modbus_registers": rows,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn create_modbus_register(
    State(state): State<AppState>,
    Json(payload): Json<WithArticleId<ModbusRegisterInput>>,
) -> Result<impl IntoResponse, CatalogError> {
    let document_id = payload.input.document_id;
    let row = children::insert_modbus_register(
        &state.pool,
        &payload.article_id,
        &payload.input,
        document_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn delete_modbus_register(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, CatalogError> {
    let deleted = children::delete_child_row(&state.pool, "modbus_registers", id).await?;
    if !deleted {
        return Err(CatalogError::not_found(format!("modbus_registers {}", id)));
    }
    Ok(Json(json!({ "message": "削除しました" })))
}

// ---- メーカー・変数辞書 ----

pub async fn list_manufacturers(
    State(state): State<AppState>,
    Query(page_params): Query<PageParams>,
) -> Result<Json<Value>, CatalogError> {
    let (page, limit, offset) = page_params.resolve();
    let (manufacturers, total) =
        manufacturer::list_manufacturers(&state.pool, limit, offset).await?;

    Ok(Json(json!({
        "manufacturers": manufacturers,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn create_manufacturer(
    State(state): State<AppState>,
    Json(input): Json<ManufacturerInput>,
) -> Result<impl IntoResponse, CatalogError> {
    let manufacturer = manufacturer::create_manufacturer(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(manufacturer)))
}

pub async fn list_variables(
    State(state): State<AppState>,
    Query(page_params): Query<PageParams>,
) -> Result<Json<Value>, CatalogError> {
    let (page, limit, offset) = page_params.resolve();
    let (variables, total) = variable::list_variables(&state.pool, limit, offset).await?;

    Ok(Json(json!({
        "variables": variables,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn create_variable(
    State(state): State<AppState>,
    Json(input): Json<VariableDictInput>,
) -> Result<impl IntoResponse, CatalogError> {
    let variable = variable::create_variable(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(variable)))
}

// ---- アップロード ----

/// multipartフォームからファイルとメタ情報を取り出す
struct UploadPayload {
    article_id: String,
    title: Option<String>,
    doc_type: Option<String>,
    filename: String,
    bytes: Vec<u8>,
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadPayload, CatalogError> {
    let mut article_id = None;
    let mut title = None;
    let mut doc_type = None;
    let mut filename = None;
    let mut bytes = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CatalogError::validation(format!("multipartの解析に失敗: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| {
                            CatalogError::validation(format!("ファイルの読み込みに失敗: {}", e))
                        })?
                        .to_vec(),
                );
            }
            "article_id" => {
                article_id = field.text().await.ok();
            }
            "title" => {
                title = field.text().await.ok();
            }
            "doc_type" => {
                doc_type = field.text().await.ok();
            }
            _ => {}
        }
    }

    Ok(UploadPayload {
        article_id: article_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CatalogError::validation("article_idは必須です"))?,
        title,
        doc_type,
        filename: filename.unwrap_or_else(|| "unnamed".to_string()),
        bytes: bytes.ok_or_else(|| CatalogError::validation("fileフィールドは必須です"))?,
    })
}

pub async fn upload_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let payload = read_upload(multipart).await?;
    let relative = state
        .storage
        .save(DOCUMENTS_DIR, &payload.filename, &payload.bytes)?;

    let input = DocumentInput {
        id: None,
        title: payload.title,
        doc_type: payload.doc_type,
        url_or_path: relative,
        content_hash: Some(hash_bytes(&payload.bytes)),
    };
    let document = children::insert_document(&state.pool, &payload.article_id, &input).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let payload = read_upload(multipart).await?;
    let relative = state
        .storage
        .save(IMAGES_DIR, &payload.filename, &payload.bytes)?;

    let input = ImageInput {
        title: payload.title,
        url_or_path: relative,
        is_primary: None,
    };
    let image = children::insert_image(&state.pool, &payload.article_id, &input).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, CatalogError> {
    match children::delete_file_row(&state.pool, "documents", id).await? {
        Some(path) => {
            state.storage.remove_best_effort(&path);
            Ok(Json(json!({ "message": "ドキュメントを削除しました" })))
        }
        None => Err(CatalogError::not_found(format!("ドキュメント {}", id))),
    }
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, CatalogError> {
    match children::delete_file_row(&state.pool, "images", id).await? {
        Some(path) => {
            state.storage.remove_best_effort(&path);
            Ok(Json(json!({ "message": "画像を削除しました" })))
        }
        None => Err(CatalogError::not_found(format!("画像 {}", id))),
    }
}

// ---- エクスポート ----

pub async fn export_json(State(state): State<AppState>) -> Result<impl IntoResponse, CatalogError> {
    let envelope = export::export_json(&state.pool).await?;
    Ok(Json(envelope))
}

pub async fn export_sql(State(state): State<AppState>) -> Result<impl IntoResponse, CatalogError> {
    let dump = export::export_sql(&state.pool).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/sql; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"instrumentkb_export.sql\"",
            ),
        ],
        dump,
    ))
}

pub async fn export_excel(State(state): State<AppState>) -> Result<impl IntoResponse, CatalogError> {
    let bytes = export::export_excel(&state.pool).await?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"instrumentkb_export.xlsx\"",
            ),
        ],
        bytes,
    ))
}

pub async fn export_zip(State(state): State<AppState>) -> Result<impl IntoResponse, CatalogError> {
    let bytes = export::export_zip(&state.pool, &state.storage).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"instrumentkb_export.zip\"",
            ),
        ],
        bytes,
    ))
}

// ---- インポート ----

/// multipartアップロードから最初のファイルの内容を取り出す
async fn read_import_file(mut multipart: Multipart) -> Result<Vec<u8>, CatalogError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CatalogError::validation(format!("multipartの解析に失敗: {}", e)))?
    {
        if field.name() == Some("file") || field.file_name().is_some() {
            return Ok(field
                .bytes()
                .await
                .map_err(|e| CatalogError::validation(format!("ファイルの読み込みに失敗: {}", e)))?
                .to_vec());
        }
    }
    Err(CatalogError::validation("fileフィールドは必須です"))
}

pub async fn import_json(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let bytes = read_import_file(multipart).await?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|e| CatalogError::import(format!("JSONの解析に失敗: {}", e)))?;
    let summary = import::import_json(&state.pool, payload).await?;
    Ok(Json(summary))
}

pub async fn import_sql(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let bytes = read_import_file(multipart).await?;
    let text = String::from_utf8(bytes)
        .map_err(|e| CatalogError::import(format!("SQLファイルがUTF-8ではありません: {}", e)))?;
    let summary = import::import_sql(&state.pool, &text).await?;
    Ok(Json(summary))
}

pub async fn import_excel(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let bytes = read_import_file(multipart).await?;
    let summary = import::import_excel(&state.pool, &bytes).await?;
    Ok(Json(summary))
}

pub async fn import_zip(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, CatalogError> {
    let bytes = read_import_file(multipart).await?;
    let summary = import::import_zip(&state.pool, &state.storage, &bytes).await?;
    Ok(Json(summary))
}
