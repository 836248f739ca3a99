//! 인메모리 저장소 구현.
//!
//! 엔진 테스트와 개발/페이퍼 모드에서 사용합니다. 호출 기록과 인위적
//! 지연을 설정할 수 있습니다.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use sync_core::{Account, DataKind, PriceRow};
use sync_exchange::StreamError;

use crate::error::{DataError, DataResult};
use crate::store::SyncStore;

#[derive(Default)]
struct MemoryState {
    update_counts: HashMap<(String, DataKind), usize>,
    price_rows: Vec<PriceRow>,
    flush_batches: Vec<usize>,
    open_symbols: HashMap<String, Vec<String>>,
    fail_updates: bool,
    fail_price_writes: bool,
}

/// 인메모리 동기화 저장소.
pub struct MemorySyncStore {
    state: Mutex<MemoryState>,
    delay: Mutex<Duration>,
}

impl MemorySyncStore {
    /// 새 저장소를 생성합니다.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// 각 갱신 호출에 인위적 지연 설정 (과부하 신호 테스트용).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// 계좌의 보유 포지션 심볼 설정.
    pub fn set_open_symbols(&self, account_name: &str, symbols: &[&str]) {
        self.state.lock().unwrap().open_symbols.insert(
            account_name.to_string(),
            symbols.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// 이후 모든 `update_*` 호출을 실패시킴.
    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_updates = fail;
    }

    /// 이후 가격 배치 쓰기를 실패시킴.
    pub fn fail_price_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_price_writes = fail;
    }

    /// (계좌, 종류)별 갱신 호출 횟수.
    pub fn update_count(&self, account_name: &str, kind: DataKind) -> usize {
        *self
            .state
            .lock()
            .unwrap()
            .update_counts
            .get(&(account_name.to_string(), kind))
            .unwrap_or(&0)
    }

    /// 전체 갱신 호출 횟수.
    pub fn total_updates(&self) -> usize {
        self.state.lock().unwrap().update_counts.values().sum()
    }

    /// 지금까지 저장된 모든 가격 레코드.
    pub fn price_rows(&self) -> Vec<PriceRow> {
        self.state.lock().unwrap().price_rows.clone()
    }

    /// 배치별 저장 행 수 (플러시 순서대로).
    pub fn flush_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().flush_batches.clone()
    }

    async fn record_update(&self, account: &Account, kind: DataKind) -> DataResult<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_updates {
            // 주입된 실패는 게이트웨이 조회 실패로 취급 (백오프 경로 테스트용)
            return Err(DataError::Gateway(StreamError::Network(
                "update failure injected".to_string(),
            )));
        }
        *state
            .update_counts
            .entry((account.name.clone(), kind))
            .or_insert(0) += 1;
        Ok(())
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn update_balances(&self, account: &Account) -> DataResult<()> {
        self.record_update(account, DataKind::Balance).await
    }

    async fn update_positions(&self, account: &Account) -> DataResult<()> {
        self.record_update(account, DataKind::Position).await
    }

    async fn update_orders(&self, account: &Account) -> DataResult<()> {
        self.record_update(account, DataKind::Order).await
    }

    async fn write_prices_batch(&self, rows: &[PriceRow]) -> DataResult<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_price_writes {
            return Err(DataError::Other("price write failure injected".to_string()));
        }
        state.flush_batches.push(rows.len());
        state.price_rows.extend_from_slice(rows);
        Ok(rows.len())
    }

    async fn open_position_symbols(&self, account: &Account) -> DataResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .open_symbols
            .get(&account.name)
            .cloned()
            .unwrap_or_default())
    }
}
