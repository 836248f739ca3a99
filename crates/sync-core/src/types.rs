//! 거래소 / 계좌 / 데이터 종류 식별 타입.
//!
//! 이 모듈은 동기화 대상을 식별하는 타입을 정의합니다:
//! - `ExchangeId` - 거래소 식별자 (예: "binance", "bybit")
//! - `Account` - 동기화 대상 계좌
//! - `DataKind` - 계좌별 동기화 데이터 종류

use serde::{Deserialize, Serialize};
use std::fmt;

/// 거래소 식별자.
///
/// 소문자 거래소 이름을 감싸는 newtype입니다 (예: "binance").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// 새 거래소 식별자를 생성합니다.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// 내부 문자열 반환.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 동기화 대상 계좌.
///
/// 이름이 계좌의 식별자입니다. 자격증명 참조는 이 서브시스템에서는
/// 불투명한 문자열로 취급하며, 실제 자격증명 해석은 게이트웨이가 담당합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    /// 계좌 이름 (식별자)
    pub name: String,
    /// 소속 거래소
    pub exchange: ExchangeId,
    /// 자격증명 참조 (불투명)
    pub credential_ref: String,
}

impl Account {
    /// 새 계좌를 생성합니다.
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<ExchangeId>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            exchange: exchange.into(),
            credential_ref: credential_ref.into(),
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.exchange)
    }
}

/// 계좌별 동기화 데이터 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// 잔고
    Balance,
    /// 포지션
    Position,
    /// 미체결 주문
    Order,
}

impl DataKind {
    /// 모든 데이터 종류.
    pub const ALL: [DataKind; 3] = [DataKind::Balance, DataKind::Position, DataKind::Order];

    /// 초기 기동 1단계에서 시작하는 종류 (잔고 + 포지션).
    ///
    /// 주문 watcher는 2단계에서 시작하여 초기 연결 부하를 분산합니다.
    pub const FIRST_PHASE: [DataKind; 2] = [DataKind::Balance, DataKind::Position];
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Balance => write!(f, "balance"),
            DataKind::Position => write!(f, "position"),
            DataKind::Order => write!(f, "order"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_id_lowercased() {
        let ex = ExchangeId::new("Binance");
        assert_eq!(ex.as_str(), "binance");
        assert_eq!(ex.to_string(), "binance");
    }

    #[test]
    fn test_account_display() {
        let account = Account::new("main", ExchangeId::new("bybit"), "cred-1");
        assert_eq!(account.to_string(), "main@bybit");
    }

    #[test]
    fn test_data_kind_display() {
        assert_eq!(DataKind::Balance.to_string(), "balance");
        assert_eq!(DataKind::Position.to_string(), "position");
        assert_eq!(DataKind::Order.to_string(), "order");
    }

    #[test]
    fn test_data_kind_phases() {
        assert_eq!(DataKind::ALL.len(), 3);
        assert!(!DataKind::FIRST_PHASE.contains(&DataKind::Order));
    }
}
