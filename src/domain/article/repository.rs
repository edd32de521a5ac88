use crate::domain::article::children;
use crate::domain::article::model::{
    Article, ArticleAggregate, ArticleInput, ArticleRef, ArticleSummary,
};
use crate::types::{CatalogError, CatalogResult};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;

/// 記事検索のフィルター条件を表す構造体
///
/// すべて任意で、指定された条件のみがANDで結合される。
/// 子テーブル条件はEXISTS相関サブクエリとして適用される。
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    /// 自由文検索（article_id / SAPコード / SAP記述 / 型式 / カテゴリの部分一致）
    pub q: Option<String>,
    pub article_type: Option<String>,
    pub family: Option<String>,
    pub subfamily: Option<String>,
    pub category: Option<String>,
    pub manufacturer_id: Option<i32>,
    pub active: Option<bool>,
    pub discontinued: Option<bool>,
    /// 測定変数名の部分一致
    pub variable_name: Option<String>,
    /// 精度がこの値以下
    pub max_accuracy: Option<f64>,
    /// プロトコルタイプの一致
    pub protocol_type: Option<String>,
    /// Modbusレジスタアドレスの一致
    pub modbus_address: Option<i32>,
    /// タグの完全一致メンバーシップ
    pub tag: Option<String>,
}

impl SearchQuery {
    fn has_conditions(&self) -> bool {
        self.q.is_some()
            || self.article_type.is_some()
            || self.family.is_some()
            || self.subfamily.is_some()
            || self.category.is_some()
            || self.manufacturer_id.is_some()
            || self.active.is_some()
            || self.discontinued.is_some()
            || self.variable_name.is_some()
            || self.max_accuracy.is_some()
            || self.protocol_type.is_some()
            || self.modbus_address.is_some()
            || self.tag.is_some()
    }
}

/// 検索条件をQueryBuilderへWHERE句として追加する
/// ページクエリとCOUNTクエリの両方で同一の述語を共有する
fn push_search_filters(qb: &mut QueryBuilder<Postgres>, query: &SearchQuery) {
    if !query.has_conditions() {
        return;
    }

    qb.push(" WHERE ");
    let mut separated = qb.separated(" AND ");

    if let Some(ref q) = query.q {
        let pattern = format!("%{}%", q);
        separated
            .push("(article_id ILIKE ")
            .push_bind_unseparated(pattern.clone())
            .push_unseparated(" OR sap_item_code ILIKE ")
            .push_bind_unseparated(pattern.clone())
            .push_unseparated(" OR sap_description ILIKE ")
            .push_bind_unseparated(pattern.clone())
            .push_unseparated(" OR model ILIKE ")
            .push_bind_unseparated(pattern.clone())
            .push_unseparated(" OR category ILIKE ")
            .push_bind_unseparated(pattern)
            .push_unseparated(")");
    }
    if let Some(ref article_type) = query.article_type {
        separated
            .push("article_type = ")
            .push_bind_unseparated(article_type.clone());
    }
    if let Some(ref family) = query.family {
        separated
            .push("family = ")
            .push_bind_unseparated(family.clone());
    }
    if let Some(ref subfamily) = query.subfamily {
        separated
            .push("subfamily = ")
            .push_bind_unseparated(subfamily.clone());
    }
    if let Some(ref category) = query.category {
        separated
            .push("category = ")
            .push_bind_unseparated(category.clone());
    }
    if let Some(manufacturer_id) = query.manufacturer_id {
        separated
            .push("manufacturer_id = ")
            .push_bind_unseparated(manufacturer_id);
    }
    if let Some(active) = query.active {
        separated.push("active = ").push_bind_unseparated(active);
    }
    if let Some(discontinued) = query.discontinued {
        separated
            .push("discontinued = ")
            .push_bind_unseparated(discontinued);
    }
    if let Some(ref variable_name) = query.variable_name {
        let pattern = format!("%{}%", variable_name);
        separated
            .push(
                "EXISTS (SELECT 1 FROM article_variables av \
                 JOIN variables_dict v ON av.variable_id = v.id \
                 WHERE av.article_id = articles.article_id AND v.name ILIKE ",
            )
            .push_bind_unseparated(pattern)
            .push_unseparated(")");
    }
    if let Some(max_accuracy) = query.max_accuracy {
        separated
            .push(
                "EXISTS (SELECT 1 FROM article_variables av \
                 WHERE av.article_id = articles.article_id AND av.accuracy <= ",
            )
            .push_bind_unseparated(max_accuracy)
            .push_unseparated(")");
    }
    if let Some(ref protocol_type) = query.protocol_type {
        separated
            .push(
                "EXISTS (SELECT 1 FROM article_protocols ap \
                 WHERE ap.article_id = articles.article_id AND ap.protocol_type = ",
            )
            .push_bind_unseparated(protocol_type.clone())
            .push_unseparated(")");
    }
    if let Some(modbus_address) = query.modbus_address {
        separated
            .push(
                "EXISTS (SELECT 1 FROM modbus_registers mr \
                 WHERE mr.article_id = articles.article_id AND mr.address = ",
            )
            .push_bind_unseparated(modbus_address)
            .push_unseparated(")");
    }
    if let Some(ref tag) = query.tag {
        separated
            .push(
                "EXISTS (SELECT 1 FROM article_tags t \
                 WHERE t.article_id = articles.article_id AND t.tag = ",
            )
            .push_bind_unseparated(tag.clone())
            .push_unseparated(")");
    }
}

/// 記事を検索し、ページ分の要約（変数・プロトコル・タグ埋め込み）と
/// 総件数を返す
///
/// ページ内の子コレクションは子テーブルごとに1回のバッチクエリ
/// （article_id = ANY）で取得し、メモリ上でidごとに組み立てる。
pub async fn search_articles(
    pool: &PgPool,
    query: &SearchQuery,
    limit: i64,
    offset: i64,
) -> CatalogResult<(Vec<ArticleSummary>, i64)> {
    // 件数は同一述語のCOUNTクエリで取得
    let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM articles");
    push_search_filters(&mut count_qb, query);
    let total: i64 = count_qb
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .map_err(|e| CatalogError::database("記事件数取得", e))?;

    let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM articles");
    push_search_filters(&mut qb, query);
    qb.push(" ORDER BY article_id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let articles = qb
        .build_query_as::<Article>()
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("記事検索", e))?;

    if articles.is_empty() {
        return Ok((Vec::new(), total));
    }

    let ids: Vec<String> = articles.iter().map(|a| a.article_id.clone()).collect();

    let mut variables_by_id: HashMap<String, Vec<_>> = HashMap::new();
    for variable in children::fetch_variables_for_articles(pool, &ids).await? {
        variables_by_id
            .entry(variable.article_id.clone())
            .or_default()
            .push(variable);
    }

    let mut protocols_by_id: HashMap<String, Vec<_>> = HashMap::new();
    for protocol in children::fetch_protocols_for_articles(pool, &ids).await? {
        protocols_by_id
            .entry(protocol.article_id.clone())
            .or_default()
            .push(protocol);
    }

    let mut tags_by_id: HashMap<String, Vec<String>> = HashMap::new();
    for row in children::fetch_tags_for_articles(pool, &ids).await? {
        tags_by_id.entry(row.article_id).or_default().push(row.tag);
    }

    let summaries = articles
        .into_iter()
        .map(|article| {
            let id = article.article_id.clone();
            ArticleSummary {
                article,
                article_variables: variables_by_id.remove(&id).unwrap_or_default(),
                article_protocols: protocols_by_id.remove(&id).unwrap_or_default(),
                tags: tags_by_id.remove(&id).unwrap_or_default(),
            }
        })
        .collect();

    Ok((summaries, total))
}

/// 記事行を1件取得する
pub async fn fetch_article(pool: &PgPool, article_id: &str) -> CatalogResult<Option<Article>> {
    sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE article_id = $1")
        .bind(article_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| CatalogError::database("記事取得", e))
}

/// トランザクション内で記事の存在を確認する
pub async fn article_exists(
    tx: &mut Transaction<'_, Postgres>,
    article_id: &str,
) -> CatalogResult<bool> {
    let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM articles WHERE article_id = $1")
        .bind(article_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| CatalogError::database("記事存在確認", e))?;
    Ok(found.is_some())
}

/// エクスポート用に全article_idを取得する
pub async fn list_article_ids(pool: &PgPool) -> CatalogResult<Vec<String>> {
    sqlx::query_scalar::<_, String>("SELECT article_id FROM articles ORDER BY article_id")
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::database("記事id一覧取得", e))
}

/// 記事アグリゲートを取得する
///
/// 記事行、メーカー、各子コレクション（それぞれ独立のクエリ）、
/// 置換チェーンの前方・後方参照をまとめて返す。
pub async fn fetch_aggregate(
    pool: &PgPool,
    article_id: &str,
) -> CatalogResult<Option<ArticleAggregate>> {
    let article = match fetch_article(pool, article_id).await? {
        Some(article) => article,
        None => return Ok(None),
    };

    let manufacturer = match article.manufacturer_id {
        Some(id) => crate::domain::manufacturer::get_manufacturer(pool, id).await?,
        None => None,
    };

    let replacement_for = match &article.replacement_article_id {
        Some(target) => fetch_article_ref(pool, target).await?,
        None => None,
    };
    let replaced_by = fetch_replaced_by(pool, article_id).await?;

    Ok(Some(ArticleAggregate {
        manufacturer,
        article_variables: children::fetch_variables(pool, article_id).await?,
        article_protocols: children::fetch_protocols(pool, article_id).await?,
        analog_outputs: children::fetch_analog_outputs(pool, article_id).await?,
        digital_io: children::fetch_digital_io(pool, article_id).await?,
        modbus_registers: children::fetch_modbus_registers(pool, article_id).await?,
        sdi12_commands: children::fetch_sdi12_commands(pool, article_id).await?,
        nmea_sentences: children::fetch_nmea_sentences(pool, article_id).await?,
        documents: children::fetch_documents(pool, article_id).await?,
        images: children::fetch_images(pool, article_id).await?,
        tags: children::fetch_tags(pool, article_id).await?,
        accessories: children::fetch_accessories(pool, article_id).await?,
        provenance: children::fetch_provenance(pool, article_id).await?,
        replacement_for,
        replaced_by,
        article,
    }))
}

async fn fetch_article_ref(pool: &PgPool, article_id: &str) -> CatalogResult<Option<ArticleRef>> {
    sqlx::query_as::<_, ArticleRef>(
        "SELECT article_id, article_type, sap_description, active \
         FROM articles WHERE article_id = $1",
    )
    .bind(article_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| CatalogError::database("置換対象取得", e))
}

async fn fetch_replaced_by(pool: &PgPool, article_id: &str) -> CatalogResult<Vec<ArticleRef>> {
    sqlx::query_as::<_, ArticleRef>(
        "SELECT article_id, article_type, sap_description, active \
         FROM articles WHERE replacement_article_id = $1 ORDER BY article_id",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database("後継記事取得", e))
}

/// 記事行を挿入する
///
/// 省略されたフィールドはNULL、真偽フラグはhas_heating/discontinued=false、
/// activeは明示的にfalseでない限りtrueで初期化される。
pub async fn insert_article(
    tx: &mut Transaction<'_, Postgres>,
    article_id: &str,
    input: &ArticleInput,
) -> CatalogResult<()> {
    sqlx::query(
        "INSERT INTO articles (\
             article_id, article_type, sap_item_code, sap_description, model, family, \
             subfamily, category, manufacturer_id, description, datasheet_url, weight_kg, \
             length_mm, width_mm, height_mm, material, ip_rating, operating_temp_min_c, \
             operating_temp_max_c, storage_temp_min_c, storage_temp_max_c, depth_rating_m, \
             supply_voltage_min_v, supply_voltage_max_v, power_consumption_w, battery_type, \
             connector_type, cable_length_m, mounting, firmware_version, \
             calibration_interval_months, warranty_months, country_of_origin, hs_code, \
             unit_price, currency, stock_quantity, minimum_stock, notes, has_heating, \
             active, discontinued, replacement_article_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, \
                 $31, $32, $33, $34, $35, $36, $37, $38, $39, $40, $41, $42, $43)",
    )
    .bind(article_id)
    .bind(&input.article_type)
    .bind(&input.sap_item_code)
    .bind(&input.sap_description)
    .bind(&input.model)
    .bind(&input.family)
    .bind(&input.subfamily)
    .bind(&input.category)
    .bind(input.manufacturer_id)
    .bind(&input.description)
    .bind(&input.datasheet_url)
    .bind(input.weight_kg)
    .bind(input.length_mm)
    .bind(input.width_mm)
    .bind(input.height_mm)
    .bind(&input.material)
    .bind(&input.ip_rating)
    .bind(input.operating_temp_min_c)
    .bind(input.operating_temp_max_c)
    .bind(input.storage_temp_min_c)
    .bind(input.storage_temp_max_c)
    .bind(input.depth_rating_m)
    .bind(input.supply_voltage_min_v)
    .bind(input.supply_voltage_max_v)
    .bind(input.power_consumption_w)
    .bind(&input.battery_type)
    .bind(&input.connector_type)
    .bind(input.cable_length_m)
    .bind(&input.mounting)
    .bind(&input.firmware_version)
    .bind(input.calibration_interval_months)
    .bind(input.warranty_months)
    .bind(&input.country_of_origin)
    .bind(&input.hs_code)
    .bind(input.unit_price)
    .bind(&input.currency)
    .bind(input.stock_quantity)
    .bind(input.minimum_stock)
    .bind(&input.notes)
    .bind(input.has_heating.unwrap_or(false))
    .bind(input.active.unwrap_or(true))
    .bind(input.discontinued.unwrap_or(false))
    .bind(&input.replacement_article_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| CatalogError::from_sqlx("記事挿入", e))?;

    Ok(())
}

/// 供給されたトップレベルフィールドのみを動的なSET句で更新する
///
/// カラム許可リストはArticleInputの固定フィールド集合そのもので、
/// 実行時のキーフィルタリングは行わない。updated_atは常に更新される。
pub async fn update_article_scalars(
    tx: &mut Transaction<'_, Postgres>,
    article_id: &str,
    input: &ArticleInput,
) -> CatalogResult<()> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE articles SET updated_at = now()");

    macro_rules! push_set {
        ($field:ident) => {
            if let Some(ref value) = input.$field {
                qb.push(concat!(", ", stringify!($field), " = "))
                    .push_bind(value.clone());
            }
        };
    }

    push_set!(article_type);
    push_set!(sap_item_code);
    push_set!(sap_description);
    push_set!(model);
    push_set!(family);
    push_set!(subfamily);
    push_set!(category);
    push_set!(manufacturer_id);
    push_set!(description);
    push_set!(datasheet_url);
    push_set!(weight_kg);
    push_set!(length_mm);
    push_set!(width_mm);
    push_set!(height_mm);
    push_set!(material);
    push_set!(ip_rating);
    push_set!(operating_temp_min_c);
    push_set!(operating_temp_max_c);
    push_set!(storage_temp_min_c);
    push_set!(storage_temp_max_c);
    push_set!(depth_rating_m);
    push_set!(supply_voltage_min_v);
    push_set!(supply_voltage_max_v);
    push_set!(power_consumption_w);
    push_set!(battery_type);
    push_set!(connector_type);
    push_set!(cable_length_m);
    push_set!(mounting);
    push_set!(firmware_version);
    push_set!(calibration_interval_months);
    push_set!(warranty_months);
    push_set!(country_of_origin);
    push_set!(hs_code);
    push_set!(unit_price);
    push_set!(currency);
    push_set!(stock_quantity);
    push_set!(minimum_stock);
    push_set!(notes);
    push_set!(has_heating);
    push_set!(active);
    push_set!(discontinued);
    push_set!(replacement_article_id);

    qb.push(" WHERE article_id = ").push_bind(article_id);

    qb.build()
        .execute(&mut **tx)
        .await
        .map_err(|e| CatalogError::from_sqlx("記事更新", e))?;

    Ok(())
}

/// 入力に含まれる子コレクションを全置換する
///
/// 存在するキーのみが対象（部分更新）。ドキュメントは先に挿入して
/// 旧id→新idの対応表を作り、Modbusレジスタ・来歴のdocument_id参照を
/// 付け替える。対応が取れない参照はNULLになる。
pub async fn apply_child_collections(
    tx: &mut Transaction<'_, Postgres>,
    article_id: &str,
    input: &ArticleInput,
    include_provenance: bool,
) -> CatalogResult<()> {
    // ドキュメントはmodbus_registers/provenanceから参照されるため最初に処理。
    // 旧行の削除で残る参照はON DELETE SET NULLが解決する
    let mut document_id_map: HashMap<i32, i32> = HashMap::new();
    let documents_replaced = input.documents.is_some();
    if let Some(ref documents) = input.documents {
        children::delete_child_rows(tx, "documents", article_id).await?;
        for doc in documents {
            let inserted = children::insert_document(&mut **tx, article_id, doc).await?;
            if let Some(old_id) = doc.id {
                document_id_map.insert(old_id, inserted.id);
            }
        }
    }

    if let Some(ref variables) = input.article_variables {
        children::delete_child_rows(tx, "article_variables", article_id).await?;
        for link in variables {
            children::insert_variable_link(tx, article_id, link).await?;
        }
    }

    if let Some(ref protocols) = input.article_protocols {
        children::delete_child_rows(tx, "article_protocols", article_id).await?;
        for protocol in protocols {
            children::insert_protocol(&mut **tx, article_id, protocol).await?;
        }
    }

    if let Some(ref outputs) = input.analog_outputs {
        children::delete_child_rows(tx, "analog_outputs", article_id).await?;
        for output in outputs {
            children::insert_analog_output(&mut **tx, article_id, output).await?;
        }
    }

    if let Some(ref ios) = input.digital_io {
        children::delete_child_rows(tx, "digital_io", article_id).await?;
        for io in ios {
            children::insert_digital_io(&mut **tx, article_id, io).await?;
        }
    }

    if let Some(ref registers) = input.modbus_registers {
        children::delete_child_rows(tx, "modbus_registers", article_id).await?;
        for register in registers {
            // ドキュメントを置換した場合は旧idを新idへ付け替える
            let document_id = match (register.document_id, documents_replaced) {
                (Some(old_id), true) => document_id_map.get(&old_id).copied(),
                (Some(old_id), false) => Some(old_id),
                (None, _) => None,
            };
            children::insert_modbus_register(&mut **tx, article_id, register, document_id).await?;
        }
    }

    if let Some(ref commands) = input.sdi12_commands {
        children::delete_child_rows(tx, "sdi12_commands", article_id).await?;
        for command in commands {
            children::insert_sdi12_command(&mut **tx, article_id, command).await?;
        }
    }

    if let Some(ref sentences) = input.nmea_sentences {
        children::delete_child_rows(tx, "nmea_sentences", article_id).await?;
        for sentence in sentences {
            children::insert_nmea_sentence(&mut **tx, article_id, sentence).await?;
        }
    }

    if let Some(ref images) = input.images {
        children::delete_child_rows(tx, "images", article_id).await?;
        for image in images {
            children::insert_image(&mut **tx, article_id, image).await?;
        }
    }

    if let Some(ref tags) = input.tags {
        children::delete_child_rows(tx, "article_tags", article_id).await?;
        for tag in tags {
            children::insert_tag(&mut **tx, article_id, tag).await?;
        }
    }

    if let Some(ref accessories) = input.accessories {
        children::delete_child_rows(tx, "accessories", article_id).await?;
        for accessory in accessories {
            children::insert_accessory(&mut **tx, article_id, accessory).await?;
        }
    }

    // 来歴は書き込みAPIでは無視され、インポート経路でのみ反映される
    if include_provenance {
        if let Some(ref provenance) = input.provenance {
            children::delete_child_rows(tx, "provenance", article_id).await?;
            for entry in provenance {
                let document_id = match (entry.document_id, documents_replaced) {
                    (Some(old_id), true) => document_id_map.get(&old_id).copied(),
                    (Some(old_id), false) => Some(old_id),
                    (None, _) => None,
                };
                children::insert_provenance(&mut **tx, article_id, entry, document_id).await?;
            }
        }
    }

    Ok(())
}

/// 記事行を削除する。子テーブルはON DELETE CASCADEで連鎖削除される
pub async fn delete_article_row(pool: &PgPool, article_id: &str) -> CatalogResult<bool> {
    let result = sqlx::query("DELETE FROM articles WHERE article_id = $1")
        .bind(article_id)
        .execute(pool)
        .await
        .map_err(|e| CatalogError::from_sqlx("記事削除", e))?;
    Ok(result.rows_affected() > 0)
}

/// メタ情報の対象カラム
#[derive(Debug, Clone, Copy)]
pub enum MetaField {
    Family,
    Subfamily,
    ArticleType,
    Category,
}

impl MetaField {
    fn column(self) -> &'static str {
        match self {
            MetaField::Family => "family",
            MetaField::Subfamily => "subfamily",
            MetaField::ArticleType => "article_type",
            MetaField::Category => "category",
        }
    }
}

/// 指定カラムの重複なし値一覧を返す（UIのドロップダウン用）
pub async fn distinct_meta_values(pool: &PgPool, field: MetaField) -> CatalogResult<Vec<String>> {
    let column = field.column();
    sqlx::query_scalar::<_, String>(&format!(
        "SELECT DISTINCT {col} FROM articles WHERE {col} IS NOT NULL ORDER BY {col}",
        col = column
    ))
    .fetch_all(pool)
    .await
    .map_err(|e| CatalogError::database(format!("{}メタ情報取得", column), e))
}
