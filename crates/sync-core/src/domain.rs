//! 계좌 상태 스냅샷 및 가격 레코드.
//!
//! 게이트웨이 스트림 이벤트와 저장소 배치 쓰기에 사용되는
//! 도메인 구조체를 정의합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 자산의 잔고 정보.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// 자산 이름 (예: "BTC", "USDT")
    pub asset: String,
    /// 사용 가능한 잔고
    pub free: Decimal,
    /// 주문에 묶인 잔고
    pub locked: Decimal,
}

impl AssetBalance {
    /// 총 잔고 반환 (사용 가능 + 묶인 잔고).
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// 보유 포지션 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// 내부 심볼 (예: "BTC/USDT")
    pub symbol: String,
    /// 보유 수량 (롱 양수, 숏 음수)
    pub quantity: Decimal,
    /// 평균 진입가
    pub entry_price: Decimal,
}

impl PositionSnapshot {
    /// 실제 보유 중인지 확인 (수량 0이면 청산된 포지션).
    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }
}

/// 미체결 주문 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// 거래소 주문 ID
    pub order_id: String,
    /// 내부 심볼
    pub symbol: String,
    /// 주문 가격
    pub price: Decimal,
    /// 잔여 수량
    pub remaining: Decimal,
}

/// 배치 저장용 가격 레코드.
///
/// (계좌, 심볼) 별 최신 체결가 한 건을 나타냅니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    /// 계좌 이름
    pub account: String,
    /// 내부 심볼
    pub symbol: String,
    /// 체결가
    pub price: Decimal,
    /// 틱 수신 시각
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_total() {
        let balance = AssetBalance {
            asset: "USDT".to_string(),
            free: dec!(100),
            locked: dec!(25.5),
        };
        assert_eq!(balance.total(), dec!(125.5));
    }

    #[test]
    fn test_position_is_open() {
        let mut position = PositionSnapshot {
            symbol: "BTC/USDT".to_string(),
            quantity: dec!(0.5),
            entry_price: dec!(60000),
        };
        assert!(position.is_open());

        position.quantity = Decimal::ZERO;
        assert!(!position.is_open());
    }
}
