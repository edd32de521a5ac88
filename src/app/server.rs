//! HTTPサーバー構成
//!
//! ルーティング定義と共有状態。ハンドラ本体はhandlers.rsに置く。

use crate::app::handlers;
use crate::infra::storage::FileStorage;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;

/// ハンドラ間で共有されるアプリケーション状態
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub storage: FileStorage,
}

/// ルーターを組み立てる
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // 記事
        .route(
            "/articles",
            get(handlers::list_articles).post(handlers::create_article),
        )
        .route("/articles/search", get(handlers::search_articles))
        .route("/articles/meta/families", get(handlers::meta_families))
        .route("/articles/meta/subfamilies", get(handlers::meta_subfamilies))
        .route("/articles/meta/types", get(handlers::meta_types))
        .route("/articles/meta/categories", get(handlers::meta_categories))
        .route(
            "/articles/:id",
            get(handlers::get_article)
                .put(handlers::update_article)
                .delete(handlers::delete_article),
        )
        // 子テーブル
        .route(
            "/protocols",
            get(handlers::list_protocols).post(handlers::create_protocol),
        )
        .route("/protocols/:id", axum::routing::delete(handlers::delete_protocol))
        .route(
            "/modbus-registers",
            get(handlers::list_modbus_registers).post(handlers::create_modbus_register),
        )
        .route(
            "/modbus-registers/:id",
            axum::routing::delete(handlers::delete_modbus_register),
        )
        .route(
            "/sdi12-commands",
            get(handlers::list_sdi12_commands).post(handlers::create_sdi12_command),
        )
        .route(
            "/sdi12-commands/:id",
            axum::routing::delete(handlers::delete_sdi12_command),
        )
        .route(
            "/nmea-sentences",
            get(handlers::list_nmea_sentences).post(handlers::create_nmea_sentence),
        )
        .route(
            "/nmea-sentences/:id",
            axum::routing::delete(handlers::delete_nmea_sentence),
        )
        .route(
            "/analog-outputs",
            get(handlers::list_analog_outputs).post(handlers::create_analog_output),
        )
        .route(
            "/analog-outputs/:id",
            axum::routing::delete(handlers::delete_analog_output),
        )
        .route(
            "/digital-io",
            get(handlers::list_digital_io).post(handlers::create_digital_io),
        )
        .route(
            "/digital-io/:id",
            axum::routing::delete(handlers::delete_digital_io),
        )
        .route(
            "/accessories",
            get(handlers::list_accessories).post(handlers::create_accessory),
        )
        .route(
            "/accessories/:id",
            axum::routing::delete(handlers::delete_accessory),
        )
        // 参照エンティティ
        .route(
            "/manufacturers",
            get(handlers::list_manufacturers).post(handlers::create_manufacturer),
        )
        .route(
            "/variables",
            get(handlers::list_variables).post(handlers::create_variable),
        )
        // アップロード
        .route("/upload/document", post(handlers::upload_document))
        .route(
            "/upload/document/:id",
            axum::routing::delete(handlers::delete_document),
        )
        .route("/upload/image", post(handlers::upload_image))
        .route(
            "/upload/image/:id",
            axum::routing::delete(handlers::delete_image),
        )
        // エクスポート・インポート
        .route("/export/json", get(handlers::export_json))
        .route("/export/sql", get(handlers::export_sql))
        .route("/export/excel", get(handlers::export_excel))
        .route("/export/zip", get(handlers::export_zip))
        .route("/import/json", post(handlers::import_json))
        .route("/import/sql", post(handlers::import_sql))
        .route("/import/excel", post(handlers::import_excel))
        .route("/import/zip", post(handlers::import_zip))
        .with_state(state)
}
