//! エクスポート・インポートの往復テスト（データベース不要）
//!
//! レンダラは取得済みアグリゲートに対する純関数なので、メモリ上で
//! 組み立てたデータに対してJSON/SQL/Excel/ZIPの各形式を検証する。

use calamine::{DataType, Reader, Xlsx};
use chrono::Utc;
use instrumentkb::app::export::{
    build_envelope, render_excel, render_sql_dump, render_zip, ExportEnvelope, EXPORT_VERSION,
};
use instrumentkb::app::import::{
    is_importable_statement, parse_import_payload, split_sql_statements,
};
use instrumentkb::domain::article::model::{
    Article, ArticleAggregate, ArticleInput, ArticleProtocol, ArticleVariable, Document,
};
use instrumentkb::domain::manufacturer::Manufacturer;
use instrumentkb::domain::variable::VariableDict;
use instrumentkb::infra::storage::FileStorage;
use std::io::{Cursor, Read};

fn sample_article(article_id: &str) -> Article {
    let now = Utc::now();
    Article {
        article_id: article_id.to_string(),
        article_type: "INSTRUMENTO".to_string(),
        sap_item_code: Some(format!("SAP-{}", article_id)),
        sap_description: "CTD Profiler SBE 19plus".to_string(),
        model: Some("SBE 19plus V2".to_string()),
        family: Some("CTD".to_string()),
        subfamily: None,
        category: Some("Perfiladores".to_string()),
        manufacturer_id: Some(1),
        description: Some("O'Brien改修版\n2行目の説明".to_string()),
        datasheet_url: None,
        weight_kg: Some(7.3),
        length_mm: None,
        width_mm: None,
        height_mm: None,
        material: Some("Titanium".to_string()),
        ip_rating: Some("IP68".to_string()),
        operating_temp_min_c: Some(-5.0),
        operating_temp_max_c: Some(45.0),
        storage_temp_min_c: None,
        storage_temp_max_c: None,
        depth_rating_m: Some(7000.0),
        supply_voltage_min_v: Some(9.0),
        supply_voltage_max_v: Some(28.0),
        power_consumption_w: None,
        battery_type: None,
        connector_type: Some("MCBH-6".to_string()),
        cable_length_m: None,
        mounting: None,
        firmware_version: None,
        calibration_interval_months: Some(12),
        warranty_months: None,
        country_of_origin: Some("US".to_string()),
        hs_code: None,
        unit_price: None,
        currency: None,
        stock_quantity: Some(3),
        minimum_stock: Some(1),
        notes: None,
        has_heating: false,
        active: true,
        discontinued: false,
        replacement_article_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_aggregate(article_id: &str) -> ArticleAggregate {
    let now = Utc::now();
    ArticleAggregate {
        article: sample_article(article_id),
        manufacturer: Some(Manufacturer {
            id: 1,
            name: "Sea-Bird Scientific".to_string(),
            country: Some("US".to_string()),
            website: None,
            contact_email: None,
            notes: None,
            created_at: now,
        }),
        article_variables: vec![ArticleVariable {
            id: 10,
            article_id: article_id.to_string(),
            variable_id: 1,
            range_min: Some(-5.0),
            range_max: Some(35.0),
            unit: Some("°C".to_string()),
            accuracy: Some(0.002),
            resolution: None,
            sample_rate_hz: Some(4.0),
            variable: Some(VariableDict {
                id: 1,
                name: "Temperature".to_string(),
                default_unit: Some("°C".to_string()),
                description: None,
                created_at: now,
            }),
        }],
        article_protocols: vec![ArticleProtocol {
            id: 20,
            article_id: article_id.to_string(),
            protocol_type: "ModbusRTU".to_string(),
            physical_layer: Some("RS-485".to_string()),
            baudrate: Some(9600),
            data_bits: Some(8),
            parity: Some("N".to_string()),
            stop_bits: Some(1),
            ip_address: None,
            port: None,
            notes: None,
        }],
        analog_outputs: vec![],
        digital_io: vec![],
        modbus_registers: vec![],
        sdi12_commands: vec![],
        nmea_sentences: vec![],
        documents: vec![
            Document {
                id: 30,
                article_id: article_id.to_string(),
                title: Some("取扱説明書".to_string()),
                doc_type: Some("manual".to_string()),
                url_or_path: "Documents/manual.pdf".to_string(),
                content_hash: None,
                uploaded_at: now,
            },
            Document {
                id: 31,
                article_id: article_id.to_string(),
                title: Some("外部データシート".to_string()),
                doc_type: Some("datasheet".to_string()),
                url_or_path: "https://example.com/datasheet.pdf".to_string(),
                content_hash: None,
                uploaded_at: now,
            },
            Document {
                id: 32,
                article_id: article_id.to_string(),
                title: Some("校正証明書".to_string()),
                doc_type: Some("certificate".to_string()),
                url_or_path: "Documents/missing_cert.pdf".to_string(),
                content_hash: None,
                uploaded_at: now,
            },
        ],
        images: vec![],
        tags: vec!["oceanografia".to_string(), "ctd".to_string()],
        accessories: vec![],
        provenance: vec![],
        replacement_for: None,
        replaced_by: vec![],
    }
}

#[test]
fn test_json_envelope_roundtrip() {
    let envelope = build_envelope(vec![sample_aggregate("INS-000347")]);
    assert_eq!(envelope.version, EXPORT_VERSION);
    assert!(envelope.sap_integration);
    assert_eq!(envelope.total_articles, 1);

    // エンベロープJSONをインポートペイロードとして解析できる
    let json = serde_json::to_value(&envelope).expect("エンベロープの直列化に失敗");

    // フラット化の確認: 記事カラムはトップレベルに展開される
    let first = &json["articles"][0];
    assert_eq!(first["article_id"], "INS-000347");
    assert_eq!(first["manufacturer"]["name"], "Sea-Bird Scientific");
    assert_eq!(first["article_variables"][0]["variable"]["name"], "Temperature");

    let items = parse_import_payload(json).expect("ペイロード解析に失敗");
    assert_eq!(items.len(), 1);

    // エクスポートされたアグリゲートはインポート入力としてそのまま読める
    let record: ArticleInput =
        serde_json::from_value(items[0].clone()).expect("インポート入力への変換に失敗");
    assert_eq!(record.article_id.as_deref(), Some("INS-000347"));
    assert_eq!(record.sap_description.as_deref(), Some("CTD Profiler SBE 19plus"));
    assert_eq!(record.article_variables.as_ref().unwrap().len(), 1);
    assert_eq!(
        record.article_variables.as_ref().unwrap()[0]
            .variable
            .as_ref()
            .unwrap()
            .name,
        "Temperature"
    );
    assert_eq!(record.article_protocols.as_ref().unwrap()[0].baudrate, Some(9600));
    assert_eq!(record.documents.as_ref().unwrap().len(), 3);
    assert_eq!(record.tags.as_ref().unwrap().len(), 2);
    assert_eq!(record.manufacturer.as_ref().unwrap().name, "Sea-Bird Scientific");
}

#[test]
fn test_envelope_deserializes_back() {
    let envelope = build_envelope(vec![sample_aggregate("INS-000347")]);
    let text = serde_json::to_string_pretty(&envelope).expect("直列化に失敗");

    let parsed: ExportEnvelope = serde_json::from_str(&text).expect("逆直列化に失敗");
    assert_eq!(parsed.total_articles, 1);
    assert_eq!(parsed.articles[0].article.article_id, "INS-000347");
    assert_eq!(parsed.articles[0].tags.len(), 2);
}

#[test]
fn test_sql_dump_structure() {
    let now = Utc::now();
    let manufacturers = vec![Manufacturer {
        id: 1,
        name: "Sea-Bird Scientific".to_string(),
        country: Some("US".to_string()),
        website: None,
        contact_email: None,
        notes: None,
        created_at: now,
    }];
    let variables = vec![VariableDict {
        id: 1,
        name: "Temperature".to_string(),
        default_unit: Some("°C".to_string()),
        description: None,
        created_at: now,
    }];
    let aggregates = vec![sample_aggregate("INS-000347")];

    let dump = render_sql_dump(&manufacturers, &variables, &aggregates);

    // トランザクションとトリガー無効化で包まれている
    assert!(dump.contains("BEGIN;"));
    assert!(dump.contains("SET session_replication_role = replica;"));
    assert!(dump.contains("SET session_replication_role = DEFAULT;"));
    assert!(dump.ends_with("COMMIT;\n"));

    // 自然キーテーブルはDO UPDATE、子テーブルはDO NOTHING
    assert!(dump.contains("ON CONFLICT (name) DO UPDATE SET"));
    assert!(dump.contains("ON CONFLICT (article_id) DO UPDATE SET"));
    assert!(dump.contains("ON CONFLICT DO NOTHING"));

    // シングルクォートは二重化される
    assert!(dump.contains("O''Brien"));

    // 改行を含む値はE文字列で1行に収まる（文単位分割の前提）
    assert!(dump.contains("E'"));
    for statement in split_sql_statements(&dump) {
        assert!(!statement.contains('\n'), "文が複数行になっている: {}", statement);
    }

    // シーケンス再同期
    assert!(dump.contains("pg_get_serial_sequence('article_variables', 'id')"));

    // インポート対象の文が存在する
    let importable = split_sql_statements(&dump)
        .into_iter()
        .filter(|s| is_importable_statement(s))
        .count();
    // メーカー1 + 変数1 + 記事1 + 変数リンク1 + プロトコル1 + ドキュメント3
    // + タグ2 + setval14
    assert_eq!(importable, 24);
}

#[test]
fn test_excel_workbook_readback() {
    let now = Utc::now();
    let manufacturers = vec![Manufacturer {
        id: 1,
        name: "Sea-Bird Scientific".to_string(),
        country: None,
        website: None,
        contact_email: None,
        notes: None,
        created_at: now,
    }];
    let variables: Vec<VariableDict> = vec![];
    let aggregates = vec![sample_aggregate("INS-000347")];

    let bytes = render_excel(&manufacturers, &variables, &aggregates).expect("Excel生成に失敗");
    assert!(!bytes.is_empty());

    // calamineで読み戻して内容を確認
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).expect("Excel読み戻しに失敗");
    let sheet_names = workbook.sheet_names().to_vec();
    for expected in [
        "Articles",
        "Manufacturers",
        "Variables",
        "ArticleVariables",
        "Protocols",
        "ModbusRegisters",
        "Documents",
        "Tags",
        "Metadata",
    ] {
        assert!(
            sheet_names.iter().any(|n| n == expected),
            "シート{}がない: {:?}",
            expected,
            sheet_names
        );
    }

    let range = workbook
        .worksheet_range("Articles")
        .expect("Articlesシートがない")
        .expect("Articlesシートの読み込みに失敗");

    // ヘッダー行 + データ1行
    assert_eq!(range.rows().count(), 2);

    let headers: Vec<String> = range
        .rows()
        .next()
        .unwrap()
        .iter()
        .map(|c| c.to_string())
        .collect();
    let row: Vec<String> = range
        .rows()
        .nth(1)
        .unwrap()
        .iter()
        .map(|c| match c {
            DataType::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    let col = |name: &str| headers.iter().position(|h| h == name).unwrap();

    assert_eq!(row[col("article_id")], "INS-000347");
    // 真偽値は文字列リテラルとして出力される
    assert_eq!(row[col("active")], "TRUE");
    assert_eq!(row[col("has_heating")], "FALSE");
    // NULLは空文字列
    assert_eq!(row[col("battery_type")], "");
}

#[test]
fn test_zip_bundle_contents() {
    let dir = tempfile::tempdir().expect("一時ディレクトリの作成に失敗");
    let storage = FileStorage::new(dir.path());
    storage.ensure_layout().expect("レイアウト作成に失敗");

    // manual.pdfのみ実体を置く（missing_cert.pdfは意図的に欠落させる）
    let saved = storage
        .save("Documents", "manual.pdf", b"pdf-bytes")
        .expect("ファイル保存に失敗");
    assert_eq!(saved, "Documents/manual.pdf");

    let envelope = build_envelope(vec![sample_aggregate("INS-000347")]);
    let bytes = render_zip(&envelope, &storage).expect("ZIP生成に失敗");

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("ZIP読み戻しに失敗");
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();

    // data.json + 実在ファイル + README。外部URLと欠落ファイルは同梱されない
    assert!(names.contains(&"data.json".to_string()));
    assert!(names.contains(&"uploads/Documents/manual.pdf".to_string()));
    assert!(names.contains(&"README.txt".to_string()));
    assert!(!names.iter().any(|n| n.contains("missing_cert")));
    assert_eq!(names.len(), 3);

    // data.jsonはJSONエクスポートのエンベロープと同一形式
    let mut data_json = String::new();
    archive
        .by_name("data.json")
        .unwrap()
        .read_to_string(&mut data_json)
        .unwrap();
    let parsed: ExportEnvelope = serde_json::from_str(&data_json).expect("data.jsonの解析に失敗");
    assert_eq!(parsed.total_articles, 1);

    // READMEには欠落ファイルの一覧が載る
    let mut readme = String::new();
    archive
        .by_name("README.txt")
        .unwrap()
        .read_to_string(&mut readme)
        .unwrap();
    assert!(readme.contains("Documents/missing_cert.pdf"));
}
