//! 게이트웨이 trait 정의.
//!
//! 엔진이 소비하는 거래소 기능의 전부입니다. 거래소별 구현체는
//! 이 trait들을 구현하고 와이어 에러를 `StreamError`로 매핑합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use sync_core::{
    Account, AssetBalance, DataKind, ExchangeId, OrderSnapshot, PositionSnapshot,
};
use tokio::sync::broadcast;

use crate::error::StreamResult;

/// 계좌 스트림이 지원하는 데이터 종류 플래그.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// 잔고 스트리밍 지원
    pub watch_balance: bool,
    /// 포지션 스트리밍 지원
    pub watch_positions: bool,
    /// 주문 스트리밍 지원
    pub watch_orders: bool,
}

impl StreamCapabilities {
    /// 모든 종류 지원.
    pub fn all() -> Self {
        Self {
            watch_balance: true,
            watch_positions: true,
            watch_orders: true,
        }
    }

    /// 주어진 데이터 종류의 지원 여부.
    pub fn supports(&self, kind: DataKind) -> bool {
        match kind {
            DataKind::Balance => self.watch_balance,
            DataKind::Position => self.watch_positions,
            DataKind::Order => self.watch_orders,
        }
    }
}

/// 계좌 스트림 이벤트.
///
/// 각 variant는 해당 종류의 최신 스냅샷을 담습니다.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// 잔고 업데이트
    Balance(Vec<AssetBalance>),
    /// 포지션 업데이트
    Positions(Vec<PositionSnapshot>),
    /// 주문 업데이트
    Orders(Vec<OrderSnapshot>),
}

impl StreamEvent {
    /// 이벤트가 속한 데이터 종류.
    pub fn kind(&self) -> DataKind {
        match self {
            StreamEvent::Balance(_) => DataKind::Balance,
            StreamEvent::Positions(_) => DataKind::Position,
            StreamEvent::Orders(_) => DataKind::Order,
        }
    }
}

/// 시세 틱 이벤트.
#[derive(Debug, Clone)]
pub struct TickerEvent {
    /// 거래소 심볼 (게이트웨이 표기)
    pub symbol: String,
    /// 최종 체결가
    pub price: Decimal,
    /// 수신 시각
    pub timestamp: DateTime<Utc>,
}

/// 게이트웨이가 발행하는 클라이언트 종료 알림.
///
/// 거래소 측에서 인증 연결이 닫혔을 때 발행됩니다. 연결 관리자의
/// 단일 리스너 태스크가 소비하여 용량 카운터를 보정합니다.
#[derive(Debug, Clone)]
pub struct CloseNotification {
    /// 거래소
    pub exchange: ExchangeId,
    /// 계좌 이름
    pub account: String,
}

/// 계좌별 인증 스트림 클라이언트.
///
/// `watch_*` 메서드는 다음 이벤트까지 suspend하며, 실패 시 분류된
/// `StreamError`를 반환합니다. 호출 측(엔진)이 타임아웃을 감쌉니다.
#[async_trait]
pub trait PrivateStreamClient: Send + Sync {
    /// 이 클라이언트의 스트리밍 지원 플래그.
    fn capabilities(&self) -> StreamCapabilities;

    /// 다음 잔고 이벤트까지 대기.
    async fn watch_balance(&self) -> StreamResult<Vec<AssetBalance>>;

    /// 다음 포지션 이벤트까지 대기.
    async fn watch_positions(&self) -> StreamResult<Vec<PositionSnapshot>>;

    /// 다음 주문 이벤트까지 대기.
    async fn watch_orders(&self) -> StreamResult<Vec<OrderSnapshot>>;

    /// 스트림 연결을 1회 재수립 (keepalive 실패 복구 경로).
    async fn restart(&self) -> StreamResult<()>;

    /// 데이터 종류에 따라 해당 `watch_*`로 디스패치.
    async fn watch(&self, kind: DataKind) -> StreamResult<StreamEvent> {
        match kind {
            DataKind::Balance => self.watch_balance().await.map(StreamEvent::Balance),
            DataKind::Position => self.watch_positions().await.map(StreamEvent::Positions),
            DataKind::Order => self.watch_orders().await.map(StreamEvent::Orders),
        }
    }
}

/// 거래소별 공용 시세 스트림 클라이언트.
#[async_trait]
pub trait SharedStreamClient: Send + Sync {
    /// 심볼 묶음 구독.
    ///
    /// 이미 구독된 심볼이 포함되어도 성공으로 처리해야 합니다.
    /// 거래소의 구독 한도 초과는 `StreamError::SubscribeRejected`로
    /// 반환합니다.
    async fn subscribe(&self, symbols: &[String]) -> StreamResult<()>;

    /// 다음 틱 배치까지 대기.
    async fn watch_tickers(&self) -> StreamResult<Vec<TickerEvent>>;

    /// 한 스트리밍 토픽으로 추적 가능한 계좌 수의 하드 리밋.
    ///
    /// `None`이면 제한 없음.
    fn account_track_limit(&self) -> Option<usize> {
        None
    }
}

/// REST 조회 클라이언트 (폴링 경로 및 저장소 갱신용).
#[async_trait]
pub trait RestClient: Send + Sync {
    /// 계좌 잔고 조회.
    async fn fetch_balances(&self, account: &Account) -> StreamResult<Vec<AssetBalance>>;

    /// 계좌 포지션 조회.
    async fn fetch_positions(&self, account: &Account) -> StreamResult<Vec<PositionSnapshot>>;

    /// 계좌 미체결 주문 조회.
    async fn fetch_orders(&self, account: &Account) -> StreamResult<Vec<OrderSnapshot>>;
}

/// 통합 게이트웨이 인터페이스.
///
/// 클라이언트 수명은 게이트웨이가 소유합니다. 엔진은 핸들(Arc)만 쥐며,
/// 닫기는 반드시 `close_*`를 통합니다.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// 거래소 연결 준비.
    async fn connect(&self, exchange: &ExchangeId) -> StreamResult<()>;

    /// 거래소 공용 스트림 클라이언트 조회/생성.
    async fn shared_stream_client(
        &self,
        exchange: &ExchangeId,
    ) -> StreamResult<Arc<dyn SharedStreamClient>>;

    /// 계좌 인증 스트림 클라이언트 생성.
    ///
    /// 게이트웨이가 클라이언트를 만들 수 없으면 에러를 반환합니다.
    /// 용량 검사는 게이트웨이가 아니라 연결 관리자의 책임입니다.
    async fn private_stream_client(
        &self,
        account: &Account,
    ) -> StreamResult<Arc<dyn PrivateStreamClient>>;

    /// 계좌 인증 스트림 클라이언트 종료.
    async fn close_private_stream_client(&self, account: &Account);

    /// 거래소 공용 스트림 클라이언트 종료.
    async fn close_shared_stream_client(&self, exchange: &ExchangeId);

    /// 종료 알림 채널 구독.
    fn subscribe_close_notifications(&self) -> broadcast::Receiver<CloseNotification>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_supports() {
        let caps = StreamCapabilities {
            watch_balance: true,
            watch_positions: false,
            watch_orders: true,
        };
        assert!(caps.supports(DataKind::Balance));
        assert!(!caps.supports(DataKind::Position));
        assert!(caps.supports(DataKind::Order));
        assert!(StreamCapabilities::all().supports(DataKind::Position));
    }

    #[test]
    fn test_stream_event_kind() {
        assert_eq!(StreamEvent::Balance(vec![]).kind(), DataKind::Balance);
        assert_eq!(StreamEvent::Positions(vec![]).kind(), DataKind::Position);
        assert_eq!(StreamEvent::Orders(vec![]).kind(), DataKind::Order);
    }
}
