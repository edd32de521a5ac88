//! アプリケーション層
//!
//! エクスポート・インポートのワークフローとHTTPサーバーを提供します。
//! ドメイン層のサービスを組み合わせ、外部フォーマット（JSON/SQL/Excel/ZIP）
//! との相互変換を行います。

pub mod export;
pub mod handlers;
pub mod import;
pub mod server;
