use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// 設定関連のエラー型
/// 環境変数、設定ファイル、設定値の検証など設定に関するエラーを定義
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 環境変数が見つからない
    #[error("環境変数が見つかりません: {name}")]
    MissingEnvironmentVariable { name: String },

    /// 設定値が不正
    #[error("設定値が不正です: {reason}")]
    InvalidValue { reason: String },
}

impl ConfigError {
    /// 環境変数不足エラーを作成
    pub fn missing_env_var<N: Into<String>>(name: N) -> Self {
        Self::MissingEnvironmentVariable { name: name.into() }
    }

    /// 不正な設定値エラーを作成
    pub fn invalid_value<R: Into<String>>(reason: R) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}

/// 設定エラーのResult型エイリアス
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// アプリケーション設定
/// .envファイルまたは環境変数から読み込む
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL接続文字列
    pub database_url: String,
    /// アップロードファイルの保存ルートディレクトリ
    pub storage_root: PathBuf,
    /// HTTPサーバーの待ち受けアドレス
    pub bind_addr: String,
}

impl AppConfig {
    /// 環境変数から設定を読み込む
    ///
    /// DATABASE_URLは必須。STORAGE_ROOTは省略時 `./uploads`、
    /// BIND_ADDRは省略時 `0.0.0.0:3001`。
    pub fn from_env() -> ConfigResult<Self> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::missing_env_var("DATABASE_URL"))?;

        let storage_root = env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());

        Ok(Self {
            database_url,
            storage_root,
            bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::missing_env_var("DATABASE_URL");
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = ConfigError::invalid_value("BIND_ADDRの形式が不正");
        assert!(err.to_string().contains("不正"));
    }

    #[test]
    fn test_defaults() {
        // 他テストと並行して走るため、DATABASE_URLは削除せずに補うだけにする
        if env::var("DATABASE_URL").is_err() {
            env::set_var("DATABASE_URL", "postgres://localhost/instrumentkb_test");
        }

        let config = AppConfig::from_env().expect("設定の読み込みに失敗");
        if env::var("STORAGE_ROOT").is_err() {
            assert_eq!(config.storage_root, PathBuf::from("./uploads"));
        }
        if env::var("BIND_ADDR").is_err() {
            assert_eq!(config.bind_addr, "0.0.0.0:3001");
        }
    }
}
