//! InstrumentKB
//!
//! 海洋・産業計測機器のカタログ管理サービス。
//! SAPスタイルの記事マスタ（articles）と衛星テーブル群をPostgreSQLで
//! 管理し、REST APIとJSON/SQL/Excel/ZIPのエクスポート・インポートを
//! 提供します。

pub mod app;
pub mod domain;
pub mod infra;
pub mod types;
