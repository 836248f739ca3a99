//! 파일 기반 계좌 목록 공급자.
//!
//! JSON 파일을 조정 주기마다 다시 읽어, 파일의 추가/제거가 watcher
//! 기동/종료로 반영됩니다.
//!
//! 파일 형식:
//!
//! ```json
//! [
//!   { "name": "main", "exchange": "binance", "credential_ref": "vault:main" },
//!   { "name": "hedge", "exchange": "bybit", "credential_ref": "vault:hedge" }
//! ]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use sync_core::{Account, ExchangeId};
use sync_engine::{AccountsProvider, EngineError, EngineResult};

#[derive(Debug, Deserialize)]
struct AccountEntry {
    name: String,
    exchange: String,
    #[serde(default)]
    credential_ref: String,
}

/// JSON 파일에서 희망 계좌 목록을 읽는 공급자.
pub struct FileAccountsProvider {
    path: PathBuf,
}

impl FileAccountsProvider {
    /// 경로를 지정하여 생성합니다.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    /// `ACCOUNTS_FILE` 환경변수에서 경로를 읽어 생성 (기본: accounts.json).
    pub fn from_env() -> Arc<Self> {
        let path = std::env::var("ACCOUNTS_FILE").unwrap_or_else(|_| "accounts.json".to_string());
        Self::new(path)
    }
}

#[async_trait]
impl AccountsProvider for FileAccountsProvider {
    async fn desired_accounts(&self) -> EngineResult<Vec<Account>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::Accounts(format!("{} 읽기 실패: {}", self.path.display(), e))
        })?;

        let entries: Vec<AccountEntry> = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Accounts(format!("계좌 파일 파싱 실패: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|e| Account::new(e.name, ExchangeId::new(e.exchange), e.credential_ref))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_accounts_file() {
        let path = std::env::temp_dir().join(format!(
            "sync-daemon-accounts-{}.json",
            std::process::id()
        ));
        tokio::fs::write(
            &path,
            r#"[
                { "name": "main", "exchange": "Binance", "credential_ref": "vault:main" },
                { "name": "hedge", "exchange": "bybit" }
            ]"#,
        )
        .await
        .unwrap();

        let provider = FileAccountsProvider::new(&path);
        let accounts = provider.desired_accounts().await.unwrap();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].name, "main");
        assert_eq!(accounts[0].exchange.as_str(), "binance");
        assert_eq!(accounts[1].credential_ref, "");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let provider = FileAccountsProvider::new("/nonexistent/accounts.json");
        assert!(provider.desired_accounts().await.is_err());
    }
}
