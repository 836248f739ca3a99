//! 저장소 trait 정의.

use async_trait::async_trait;
use sync_core::{Account, DataKind, PriceRow};

use crate::error::DataResult;

/// 동기화 엔진이 소비하는 영속화 인터페이스.
///
/// `update_*`는 해당 계좌의 현재 상태를 가져와 저장하는 write-through
/// 연산입니다. 스트림 watcher는 이벤트 수신을 트리거로, REST 폴러는
/// 주기 도래를 트리거로 같은 연산을 호출합니다.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// 계좌 잔고 상태를 갱신합니다.
    async fn update_balances(&self, account: &Account) -> DataResult<()>;

    /// 계좌 포지션 상태를 갱신합니다.
    async fn update_positions(&self, account: &Account) -> DataResult<()>;

    /// 계좌 미체결 주문 상태를 갱신합니다.
    async fn update_orders(&self, account: &Account) -> DataResult<()>;

    /// 가격 레코드를 배치로 저장하고 저장된 행 수를 반환합니다.
    async fn write_prices_batch(&self, rows: &[PriceRow]) -> DataResult<usize>;

    /// 계좌의 현재 보유 포지션 심볼을 조회합니다.
    ///
    /// 거래소별 가격 구독 심볼 집합을 재구성할 때 사용됩니다.
    async fn open_position_symbols(&self, account: &Account) -> DataResult<Vec<String>>;

    /// 데이터 종류에 따라 해당 `update_*`로 디스패치.
    async fn update(&self, account: &Account, kind: DataKind) -> DataResult<()> {
        match kind {
            DataKind::Balance => self.update_balances(account).await,
            DataKind::Position => self.update_positions(account).await,
            DataKind::Order => self.update_orders(account).await,
        }
    }
}
