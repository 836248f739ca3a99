//! 가격 버퍼 및 배치 작성기.
//!
//! (계좌, 심볼)별 최신 틱 한 건만 유지하는 latest-wins 버퍼와, 주기적으로
//! 버퍼를 빈 맵으로 교체해 스냅샷을 배치 저장하는 타이머 태스크입니다.
//! 저장 I/O는 비동기로 수행되어 watcher 진행을 막지 않습니다.
//!
//! 종료 시에는 버퍼링을 먼저 중단한 뒤 타임아웃이 걸린 최종 플러시를
//! 한 번만 시도합니다. 최종 플러시 실패는 로그만 남기고 재시도하지
//! 않습니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_core::PriceRow;
use sync_data::SyncStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BufferConfig;

struct BufferInner {
    map: HashMap<(String, String), (DateTime<Utc>, Decimal)>,
    enabled: bool,
}

/// latest-wins 가격 버퍼.
pub struct PriceBuffer {
    inner: Mutex<BufferInner>,
}

impl PriceBuffer {
    /// 새 버퍼를 생성합니다.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BufferInner {
                map: HashMap::new(),
                enabled: true,
            }),
        })
    }

    /// 틱 기록 (같은 (계좌, 심볼)의 기존 항목은 덮어씀).
    pub fn record(&self, account: &str, symbol: &str, price: Decimal, timestamp: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return;
        }
        inner
            .map
            .insert((account.to_string(), symbol.to_string()), (timestamp, price));
    }

    /// 버퍼를 빈 맵으로 교체하고 스냅샷을 행 목록으로 반환.
    pub fn swap(&self) -> Vec<PriceRow> {
        let map = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.map)
        };

        let mut rows: Vec<PriceRow> = map
            .into_iter()
            .map(|((account, symbol), (timestamp, price))| PriceRow {
                account,
                symbol,
                price,
                timestamp,
            })
            .collect();
        rows.sort_by(|a, b| (&a.account, &a.symbol).cmp(&(&b.account, &b.symbol)));
        rows
    }

    /// 버퍼링 중단 (종료 경로, 이후 `record`는 무시됨).
    pub fn disable(&self) {
        self.inner.lock().unwrap().enabled = false;
    }

    /// 현재 버퍼 항목 수.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// 버퍼가 비어 있는지 확인.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 가격 배치 플러시 태스크.
pub struct PriceFlusher {
    buffer: Arc<PriceBuffer>,
    store: Arc<dyn SyncStore>,
    config: BufferConfig,
}

impl PriceFlusher {
    /// 새 플러시 태스크를 생성합니다.
    pub fn new(buffer: Arc<PriceBuffer>, store: Arc<dyn SyncStore>, config: BufferConfig) -> Self {
        Self {
            buffer,
            store,
            config,
        }
    }

    /// 플러시 루프 실행.
    ///
    /// 취소되면 버퍼링을 중단하고 최종 플러시를 한 번만 시도합니다.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        // 배치는 best-effort: 실패한 스냅샷은 버려짐
                        error!(error = %e, "가격 배치 저장 실패");
                    }
                }
            }
        }

        // 종료: 버퍼링 중단 후 타임아웃이 걸린 최종 플러시 1회
        self.buffer.disable();
        match tokio::time::timeout(self.config.final_flush_timeout(), self.flush_once()).await {
            Ok(Ok(rows)) => info!(rows, "최종 가격 플러시 완료"),
            Ok(Err(e)) => warn!(error = %e, "최종 가격 플러시 실패"),
            Err(_) => warn!(
                timeout_ms = self.config.final_flush_timeout_ms,
                "최종 가격 플러시 타임아웃"
            ),
        }
    }

    async fn flush_once(&self) -> sync_data::DataResult<usize> {
        let rows = self.buffer.swap();
        if rows.is_empty() {
            return Ok(0);
        }

        let written = self.store.write_prices_batch(&rows).await?;
        debug!(rows = written, "가격 배치 저장 완료");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sync_data::MemorySyncStore;

    #[test]
    fn test_latest_wins() {
        let buffer = PriceBuffer::new();
        buffer.record("alpha", "BTC/USDT", dec!(100), Utc::now());
        buffer.record("alpha", "BTC/USDT", dec!(101), Utc::now());
        buffer.record("alpha", "ETH/USDT", dec!(50), Utc::now());

        let rows = buffer.swap();
        assert_eq!(rows.len(), 2);
        let btc = rows.iter().find(|r| r.symbol == "BTC/USDT").unwrap();
        assert_eq!(btc.price, dec!(101));
    }

    #[test]
    fn test_swap_clears_buffer() {
        let buffer = PriceBuffer::new();
        buffer.record("alpha", "BTC/USDT", dec!(100), Utc::now());

        assert_eq!(buffer.swap().len(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.swap().is_empty());
    }

    #[test]
    fn test_disabled_buffer_ignores_records() {
        let buffer = PriceBuffer::new();
        buffer.disable();
        buffer.record("alpha", "BTC/USDT", dec!(100), Utc::now());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flusher_writes_batches() {
        let buffer = PriceBuffer::new();
        let store = Arc::new(MemorySyncStore::new());
        let config = BufferConfig {
            flush_interval_ms: 20,
            final_flush_timeout_ms: 1_000,
        };

        let shutdown = CancellationToken::new();
        let flusher = PriceFlusher::new(buffer.clone(), store.clone(), config);
        let handle = tokio::spawn(flusher.run(shutdown.clone()));

        buffer.record("alpha", "BTC/USDT", dec!(100), Utc::now());
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        assert_eq!(store.price_rows().len(), 1);

        // 종료 시 최종 플러시에 잔여 항목 포함
        buffer.record("alpha", "ETH/USDT", dec!(50), Utc::now());
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(store.price_rows().len(), 2);
    }

    #[tokio::test]
    async fn test_final_flush_failure_logged_not_retried() {
        let buffer = PriceBuffer::new();
        let store = Arc::new(MemorySyncStore::new());
        let config = BufferConfig {
            flush_interval_ms: 10_000,
            final_flush_timeout_ms: 200,
        };

        let shutdown = CancellationToken::new();
        let flusher = PriceFlusher::new(buffer.clone(), store.clone(), config);
        let handle = tokio::spawn(flusher.run(shutdown.clone()));

        buffer.record("alpha", "BTC/USDT", dec!(100), Utc::now());
        store.fail_price_writes(true);

        shutdown.cancel();
        handle.await.unwrap();

        // 실패는 재시도되지 않음
        assert!(store.price_rows().is_empty());
    }
}
