use crate::types::ConfigError;
use thiserror::Error;

/// カタログ操作のエラー型
/// HTTP層でステータスコードへ写像される分類のみを定義
#[derive(Error, Debug)]
pub enum CatalogError {
    /// 入力値の検証エラー（必須フィールド欠落など）
    #[error("検証エラー: {message}")]
    Validation { message: String },

    /// 一意制約違反（article_id重複、Modbusレジスタ三つ組重複など）
    #[error("一意制約違反: {message}")]
    Conflict { message: String },

    /// 外部キー違反（存在しないmanufacturer_id/variable_idへの参照）
    #[error("参照整合性違反: {message}")]
    InvalidReference { message: String },

    /// 対象リソースが存在しない
    #[error("{resource}が見つかりません")]
    NotFound { resource: String },

    /// インポートペイロードの解析エラー
    #[error("インポートエラー: {message}")]
    Import { message: String },

    /// エクスポートファイル生成のエラー
    #[error("エクスポートエラー: {message}")]
    Export { message: String },

    /// データベース関連のエラー
    #[error("データベースエラー: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// ファイルストレージエラー
    #[error("ストレージエラー: {path} - {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 設定エラー
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CatalogError {
    /// 検証エラーを作成
    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// 一意制約違反エラーを作成
    pub fn conflict<M: Into<String>>(message: M) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// 参照整合性違反エラーを作成
    pub fn invalid_reference<M: Into<String>>(message: M) -> Self {
        Self::InvalidReference {
            message: message.into(),
        }
    }

    /// NotFoundエラーを作成
    pub fn not_found<R: Into<String>>(resource: R) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// インポートエラーを作成
    pub fn import<M: Into<String>>(message: M) -> Self {
        Self::Import {
            message: message.into(),
        }
    }

    /// エクスポートエラーを作成
    pub fn export<M: Into<String>>(message: M) -> Self {
        Self::Export {
            message: message.into(),
        }
    }

    /// データベースエラーを作成
    pub fn database<O: Into<String>>(operation: O, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// ストレージエラーを作成
    pub fn storage<P: Into<String>>(path: P, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// sqlxエラーをSQLSTATEで分類して変換する
    ///
    /// 23505（一意制約違反）と23503（外部キー違反）はクライアント起因の
    /// エラーとして扱い、それ以外はデータベースエラーとする。
    pub fn from_sqlx<O: Into<String>>(operation: O, source: sqlx::Error) -> Self {
        let operation = operation.into();
        if let sqlx::Error::Database(ref db_err) = source {
            match db_err.code().as_deref() {
                Some("23505") => {
                    return Self::conflict(format!("{}: {}", operation, db_err.message()));
                }
                Some("23503") => {
                    return Self::invalid_reference(format!("{}: {}", operation, db_err.message()));
                }
                _ => {}
            }
        }
        Self::Database { operation, source }
    }

    /// 一意制約違反かどうかを判定
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// カタログエラーのResult型エイリアス
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = CatalogError::validation("sap_descriptionは必須です");
        assert!(err.to_string().contains("検証エラー"));
        assert!(!err.is_conflict());

        let err = CatalogError::conflict("article_idが重複しています");
        assert!(err.is_conflict());

        let err = CatalogError::not_found("article INS-000001");
        assert!(err.to_string().contains("見つかりません"));
    }

    #[test]
    fn test_from_sqlx_non_database_error() {
        // Database以外のsqlxエラーはDatabaseバリアントになる
        let err = CatalogError::from_sqlx("記事取得", sqlx::Error::RowNotFound);
        assert!(matches!(err, CatalogError::Database { .. }));
    }
}
