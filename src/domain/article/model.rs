use crate::domain::manufacturer::{Manufacturer, ManufacturerInput};
use crate::domain::variable::{VariableDict, VariableDictInput};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::{SystemTime, UNIX_EPOCH};

/// 記事タイプ → article_idプレフィックスの対応表
///
/// SAP品目マスタ由来の閉じた分類。未知のタイプは汎用プレフィックスに
/// フォールバックする（実行時には文字列として受け付ける）。
pub const ARTICLE_TYPE_PREFIXES: &[(&str, &str)] = &[
    ("INSTRUMENTO", "INS"),
    ("SENSOR", "SEN"),
    ("SONDA", "SON"),
    ("CABLE", "CAB"),
    ("CONECTOR", "CON"),
    ("FUENTE", "FUE"),
    ("BATERIA", "BAT"),
    ("CARGADOR", "CAR"),
    ("DATALOGGER", "DTL"),
    ("MODEM", "MOD"),
    ("ANTENA", "ANT"),
    ("BOYA", "BOY"),
    ("FLOTADOR", "FLO"),
    ("LASTRE", "LAS"),
    ("ABRAZADERA", "ABR"),
    ("CARCASA", "CRC"),
    ("KIT_MANTENIMIENTO", "KIT"),
    ("REPUESTO", "REP"),
    ("HERRAMIENTA", "HER"),
    ("SOFTWARE", "SOF"),
    ("LICENCIA", "LIC"),
    ("ACCESORIO", "ACC"),
];

/// 未知の記事タイプに使用する汎用プレフィックス
pub const GENERIC_PREFIX: &str = "ART";

/// 記事タイプに対応するidプレフィックスを返す
pub fn prefix_for_type(article_type: &str) -> &'static str {
    ARTICLE_TYPE_PREFIXES
        .iter()
        .find(|(t, _)| *t == article_type)
        .map(|(_, p)| *p)
        .unwrap_or(GENERIC_PREFIX)
}

/// 既知の記事タイプ一覧を返す
pub fn known_article_types() -> Vec<&'static str> {
    ARTICLE_TYPE_PREFIXES.iter().map(|(t, _)| *t).collect()
}

/// 新しいarticle_idを生成する
///
/// 形式: `{プレフィックス}-{エポックミリ秒の下位8桁}{3桁乱数}`。
/// この生成は同一ミリ秒内の並行生成で衝突しうるため、一意性の最終的な
/// 担保はデータベースの一意制約とし、衝突時は呼び出し側が再生成する。
pub fn generate_article_id(article_type: &str) -> String {
    let prefix = prefix_for_type(article_type);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let time_part = millis % 100_000_000;
    let suffix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{}-{:08}{:03}", prefix, time_part, suffix)
}

/// 記事マスタ行（articlesテーブル）
///
/// SAPスタイルの品目マスタ。大半の技術・物理・環境属性はNULL許容で、
/// article_idは一度割り当てたら不変の業務キー。
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Article {
    pub article_id: String,
    pub article_type: String,
    pub sap_item_code: Option<String>,
    pub sap_description: String,
    pub model: Option<String>,
    pub family: Option<String>,
    pub subfamily: Option<String>,
    pub category: Option<String>,
    pub manufacturer_id: Option<i32>,
    pub description: Option<String>,
    pub datasheet_url: Option<String>,
    pub weight_kg: Option<f64>,
    pub length_mm: Option<f64>,
    pub width_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub material: Option<String>,
    pub ip_rating: Option<String>,
    pub operating_temp_min_c: Option<f64>,
    pub operating_temp_max_c: Option<f64>,
    pub storage_temp_min_c: Option<f64>,
    pub storage_temp_max_c: Option<f64>,
    pub depth_rating_m: Option<f64>,
    pub supply_voltage_min_v: Option<f64>,
    pub supply_voltage_max_v: Option<f64>,
    pub power_consumption_w: Option<f64>,
    pub battery_type: Option<String>,
    pub connector_type: Option<String>,
    pub cable_length_m: Option<f64>,
    pub mounting: Option<String>,
    pub firmware_version: Option<String>,
    pub calibration_interval_months: Option<i32>,
    pub warranty_months: Option<i32>,
    pub country_of_origin: Option<String>,
    pub hs_code: Option<String>,
    pub unit_price: Option<f64>,
    pub currency: Option<String>,
    pub stock_quantity: Option<i32>,
    pub minimum_stock: Option<i32>,
    pub notes: Option<String>,
    pub has_heating: bool,
    pub active: bool,
    pub discontinued: bool,
    pub replacement_article_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 記事の測定変数（変数辞書への参照と測定レンジ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleVariable {
    pub id: i32,
    pub article_id: String,
    pub variable_id: i32,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub unit: Option<String>,
    pub accuracy: Option<f64>,
    pub resolution: Option<f64>,
    pub sample_rate_hz: Option<f64>,
    /// JOINで埋め込まれる変数辞書エントリ
    pub variable: Option<VariableDict>,
}

/// 通信インターフェース記述子
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArticleProtocol {
    pub id: i32,
    pub article_id: String,
    pub protocol_type: String,
    pub physical_layer: Option<String>,
    pub baudrate: Option<i32>,
    pub data_bits: Option<i32>,
    pub parity: Option<String>,
    pub stop_bits: Option<i32>,
    pub ip_address: Option<String>,
    pub port: Option<i32>,
    pub notes: Option<String>,
}

/// アナログ出力チャンネル
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalogOutput {
    pub id: i32,
    pub article_id: String,
    pub channel_name: Option<String>,
    pub signal_type: Option<String>,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub unit: Option<String>,
}

/// デジタル入出力チャンネル
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DigitalIo {
    pub id: i32,
    pub article_id: String,
    pub channel_name: Option<String>,
    pub direction: Option<String>,
    pub signal_level: Option<String>,
    pub notes: Option<String>,
}

/// Modbusレジスタ定義
/// (article_id, function_code, address) が一意
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModbusRegister {
    pub id: i32,
    pub article_id: String,
    pub function_code: i32,
    pub address: i32,
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub scale: Option<f64>,
    pub unit: Option<String>,
    pub access: Option<String>,
    pub description: Option<String>,
    pub document_id: Option<i32>,
}

/// SDI-12コマンド定義
/// (article_id, command) が一意
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sdi12Command {
    pub id: i32,
    pub article_id: String,
    pub command: String,
    pub description: Option<String>,
    pub response_format: Option<String>,
}

/// NMEAセンテンス定義
/// (article_id, sentence) が一意
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NmeaSentence {
    pub id: i32,
    pub article_id: String,
    pub sentence: String,
    pub description: Option<String>,
    pub fields: Option<String>,
}

/// ドキュメント（データシート、マニュアルなど）
/// url_or_pathは外部URLまたはストレージルート配下の相対パス
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: i32,
    pub article_id: String,
    pub title: Option<String>,
    pub doc_type: Option<String>,
    pub url_or_path: String,
    pub content_hash: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// 画像
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: i32,
    pub article_id: String,
    pub title: Option<String>,
    pub url_or_path: String,
    pub is_primary: bool,
    pub uploaded_at: DateTime<Utc>,
}

/// 同梱アクセサリ
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Accessory {
    pub id: i32,
    pub article_id: String,
    pub name: String,
    pub sap_item_code: Option<String>,
    pub quantity: Option<i32>,
    pub notes: Option<String>,
}

/// 来歴（トレーサビリティ）行
/// 書き込み経路からは読み取り専用。エクスポート・インポートでのみ移送される
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Provenance {
    pub id: i32,
    pub article_id: String,
    pub source: Option<String>,
    pub document_id: Option<i32>,
    pub imported_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// 置換チェーン表示用の軽量参照
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArticleRef {
    pub article_id: String,
    pub article_type: String,
    pub sap_description: String,
    pub active: bool,
}

/// 記事アグリゲート
/// 記事行と全子コレクション、埋め込みメーカー、置換チェーン参照の統合表現
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleAggregate {
    #[serde(flatten)]
    pub article: Article,
    pub manufacturer: Option<Manufacturer>,
    pub article_variables: Vec<ArticleVariable>,
    pub article_protocols: Vec<ArticleProtocol>,
    pub analog_outputs: Vec<AnalogOutput>,
    pub digital_io: Vec<DigitalIo>,
    pub modbus_registers: Vec<ModbusRegister>,
    pub sdi12_commands: Vec<Sdi12Command>,
    pub nmea_sentences: Vec<NmeaSentence>,
    pub documents: Vec<Document>,
    pub images: Vec<Image>,
    pub tags: Vec<String>,
    pub accessories: Vec<Accessory>,
    pub provenance: Vec<Provenance>,
    /// この記事が置き換える対象（replacement_article_idの参照先）
    pub replacement_for: Option<ArticleRef>,
    /// この記事を置き換える記事の一覧（逆参照）
    pub replaced_by: Vec<ArticleRef>,
}

/// 検索・一覧結果の1要素
/// 画面で常用される子コレクション（変数・プロトコル・タグ）のみを埋め込む
#[derive(Debug, Clone, Serialize)]
pub struct ArticleSummary {
    #[serde(flatten)]
    pub article: Article,
    pub article_variables: Vec<ArticleVariable>,
    pub article_protocols: Vec<ArticleProtocol>,
    pub tags: Vec<String>,
}

// ---- 入力型 ----
//
// 作成・更新・インポートで受け付けるペイロード。トップレベル項目は
// 固定のOptionフィールド集合であり、動的なカラム許可リストを型で
// 強制する。子コレクションは None=変更なし / Some(vec![])=全削除。

/// 測定変数リンクの入力
/// variable_id直接指定、または埋め込みvariable.nameによる解決のいずれか
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableLinkInput {
    pub variable_id: Option<i32>,
    pub variable: Option<VariableDictInput>,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub unit: Option<String>,
    pub accuracy: Option<f64>,
    pub resolution: Option<f64>,
    pub sample_rate_hz: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolInput {
    pub protocol_type: String,
    #[serde(default)]
    pub physical_layer: Option<String>,
    #[serde(default)]
    pub baudrate: Option<i32>,
    #[serde(default)]
    pub data_bits: Option<i32>,
    #[serde(default)]
    pub parity: Option<String>,
    #[serde(default)]
    pub stop_bits: Option<i32>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogOutputInput {
    pub channel_name: Option<String>,
    pub signal_type: Option<String>,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalIoInput {
    pub channel_name: Option<String>,
    pub direction: Option<String>,
    pub signal_level: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusRegisterInput {
    pub function_code: i32,
    pub address: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub document_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sdi12CommandInput {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmeaSentenceInput {
    pub sentence: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    /// エクスポート由来のid（インポート時のdocument_id再対応付けに使用）
    #[serde(default)]
    pub id: Option<i32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    pub url_or_path: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInput {
    #[serde(default)]
    pub title: Option<String>,
    pub url_or_path: String,
    #[serde(default)]
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryInput {
    pub name: String,
    #[serde(default)]
    pub sap_item_code: Option<String>,
    #[serde(default)]
    pub quantity: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceInput {
    pub source: Option<String>,
    pub document_id: Option<i32>,
    pub notes: Option<String>,
}

/// 記事の作成・更新ペイロード
///
/// 更新時は存在するフィールドのみが反映される（部分更新）。
/// JSONのnullはフィールド欠落と同義に扱われ、該当カラムは変更されない。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticleInput {
    pub article_id: Option<String>,
    pub article_type: Option<String>,
    pub sap_item_code: Option<String>,
    pub sap_description: Option<String>,
    pub model: Option<String>,
    pub family: Option<String>,
    pub subfamily: Option<String>,
    pub category: Option<String>,
    pub manufacturer_id: Option<i32>,
    pub description: Option<String>,
    pub datasheet_url: Option<String>,
    pub weight_kg: Option<f64>,
    pub length_mm: Option<f64>,
    pub width_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub material: Option<String>,
    pub ip_rating: Option<String>,
    pub operating_temp_min_c: Option<f64>,
    pub operating_temp_max_c: Option<f64>,
    pub storage_temp_min_c: Option<f64>,
    pub storage_temp_max_c: Option<f64>,
    pub depth_rating_m: Option<f64>,
    pub supply_voltage_min_v: Option<f64>,
    pub supply_voltage_max_v: Option<f64>,
    pub power_consumption_w: Option<f64>,
    pub battery_type: Option<String>,
    pub connector_type: Option<String>,
    pub cable_length_m: Option<f64>,
    pub mounting: Option<String>,
    pub firmware_version: Option<String>,
    pub calibration_interval_months: Option<i32>,
    pub warranty_months: Option<i32>,
    pub country_of_origin: Option<String>,
    pub hs_code: Option<String>,
    pub unit_price: Option<f64>,
    pub currency: Option<String>,
    pub stock_quantity: Option<i32>,
    pub minimum_stock: Option<i32>,
    pub notes: Option<String>,
    pub has_heating: Option<bool>,
    pub active: Option<bool>,
    pub discontinued: Option<bool>,
    pub replacement_article_id: Option<String>,

    /// インポート時のみ使用される埋め込みメーカー
    pub manufacturer: Option<ManufacturerInput>,

    // 子コレクション: None=変更なし / Some(vec![])=全削除して空にする
    pub article_variables: Option<Vec<VariableLinkInput>>,
    pub article_protocols: Option<Vec<ProtocolInput>>,
    pub analog_outputs: Option<Vec<AnalogOutputInput>>,
    pub digital_io: Option<Vec<DigitalIoInput>>,
    pub modbus_registers: Option<Vec<ModbusRegisterInput>>,
    pub sdi12_commands: Option<Vec<Sdi12CommandInput>>,
    pub nmea_sentences: Option<Vec<NmeaSentenceInput>>,
    pub documents: Option<Vec<DocumentInput>>,
    pub images: Option<Vec<ImageInput>>,
    pub tags: Option<Vec<String>>,
    pub accessories: Option<Vec<AccessoryInput>>,
    /// 書き込みAPIでは無視される。JSONインポートでのみ反映
    pub provenance: Option<Vec<ProvenanceInput>>,
}

impl ArticleInput {
    /// トップレベルのカラム更新対象が1つでも含まれるか
    /// （article_idと子コレクション、埋め込みメーカーは含めない）
    pub fn has_scalar_updates(&self) -> bool {
        self.article_type.is_some()
            || self.sap_item_code.is_some()
            || self.sap_description.is_some()
            || self.model.is_some()
            || self.family.is_some()
            || self.subfamily.is_some()
            || self.category.is_some()
            || self.manufacturer_id.is_some()
            || self.description.is_some()
            || self.datasheet_url.is_some()
            || self.weight_kg.is_some()
            || self.length_mm.is_some()
            || self.width_mm.is_some()
            || self.height_mm.is_some()
            || self.material.is_some()
            || self.ip_rating.is_some()
            || self.operating_temp_min_c.is_some()
            || self.operating_temp_max_c.is_some()
            || self.storage_temp_min_c.is_some()
            || self.storage_temp_max_c.is_some()
            || self.depth_rating_m.is_some()
            || self.supply_voltage_min_v.is_some()
            || self.supply_voltage_max_v.is_some()
            || self.power_consumption_w.is_some()
            || self.battery_type.is_some()
            || self.connector_type.is_some()
            || self.cable_length_m.is_some()
            || self.mounting.is_some()
            || self.firmware_version.is_some()
            || self.calibration_interval_months.is_some()
            || self.warranty_months.is_some()
            || self.country_of_origin.is_some()
            || self.hs_code.is_some()
            || self.unit_price.is_some()
            || self.currency.is_some()
            || self.stock_quantity.is_some()
            || self.minimum_stock.is_some()
            || self.notes.is_some()
            || self.has_heating.is_some()
            || self.active.is_some()
            || self.discontinued.is_some()
            || self.replacement_article_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ドメインロジック・振る舞い系テスト
    mod domain {
        use super::*;

        #[test]
        fn test_prefix_for_known_types() {
            assert_eq!(prefix_for_type("INSTRUMENTO"), "INS");
            assert_eq!(prefix_for_type("SENSOR"), "SEN");
            assert_eq!(prefix_for_type("DATALOGGER"), "DTL");
        }

        #[test]
        fn test_prefix_fallback_for_unknown_type() {
            // 未知のタイプは汎用プレフィックスにフォールバック
            assert_eq!(prefix_for_type("DESCONOCIDO"), GENERIC_PREFIX);
            assert_eq!(prefix_for_type(""), GENERIC_PREFIX);
        }

        #[test]
        fn test_known_types_count() {
            assert_eq!(known_article_types().len(), 22);
        }

        #[test]
        fn test_generate_article_id_format() {
            let id = generate_article_id("INSTRUMENTO");

            // 形式: INS-{8桁}{3桁} = プレフィックス + ハイフン + 11桁
            assert!(id.starts_with("INS-"), "プレフィックスが不正: {}", id);
            let digits = &id["INS-".len()..];
            assert_eq!(digits.len(), 11, "数字部の桁数が不正: {}", id);
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
        }

        #[test]
        fn test_generate_article_id_unknown_type() {
            let id = generate_article_id("SOMETHING_ELSE");
            assert!(id.starts_with("ART-"));
        }
    }

    // シリアライゼーション系テスト
    mod serde_shape {
        use super::*;

        #[test]
        fn test_input_missing_keys_are_none() {
            // 欠落キーはNone（部分更新: 変更なし）、空配列はSome(vec![])（全削除）
            let input: ArticleInput =
                serde_json::from_str(r#"{"article_protocols": []}"#).expect("パースに失敗");

            assert!(input.article_protocols.is_some());
            assert!(input.article_protocols.as_ref().unwrap().is_empty());
            assert!(input.tags.is_none());
            assert!(!input.has_scalar_updates());
        }

        #[test]
        fn test_input_null_is_treated_as_absent() {
            // JSONのnullはフィールド欠落と同義（該当カラムは変更されない）
            let input: ArticleInput =
                serde_json::from_str(r#"{"model": null, "weight_kg": 1.5}"#).expect("パースに失敗");

            assert!(input.model.is_none());
            assert_eq!(input.weight_kg, Some(1.5));
            assert!(input.has_scalar_updates());
        }

        #[test]
        fn test_variable_link_accepts_embedded_variable() {
            let json = r#"{
                "range_min": -5.0,
                "range_max": 35.0,
                "accuracy": 0.002,
                "variable": {"name": "Temperature", "default_unit": "°C"}
            }"#;
            let link: VariableLinkInput = serde_json::from_str(json).expect("パースに失敗");

            assert!(link.variable_id.is_none());
            assert_eq!(link.variable.as_ref().unwrap().name, "Temperature");
            assert_eq!(link.range_min, Some(-5.0));
        }
    }
}
