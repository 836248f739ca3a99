//! 공유 REST 폴러.
//!
//! 거래소당 하나의 태스크로, 활성 스트림이 없는 (계좌, 종류) 쌍을
//! 주기적으로 REST 경로로 갱신합니다. 거래소가 백오프 중이면 사이클
//! 전체를 건너뜁니다 (백오프 중에는 어떤 REST 요청도 내보내지 않음).
//! 임계치보다 오래 걸린 갱신은 과부하 신호로 조정자에 보고됩니다.

use std::sync::Arc;
use std::time::Instant;
use sync_core::{Account, DataKind, ExchangeId};
use sync_data::SyncStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffCoordinator;
use crate::config::PollerConfig;
use crate::stats::PollStats;
use crate::status::{DeliveryMode, StatusRegistry};

/// 거래소별 REST 폴러.
pub struct RestPoller {
    exchange: ExchangeId,
    accounts: Vec<Account>,
    store: Arc<dyn SyncStore>,
    backoff: Arc<BackoffCoordinator>,
    status: Arc<StatusRegistry>,
    config: PollerConfig,
}

impl RestPoller {
    /// 새 폴러를 생성합니다.
    pub fn new(
        exchange: ExchangeId,
        accounts: Vec<Account>,
        store: Arc<dyn SyncStore>,
        backoff: Arc<BackoffCoordinator>,
        status: Arc<StatusRegistry>,
        config: PollerConfig,
    ) -> Self {
        Self {
            exchange,
            accounts,
            store,
            backoff,
            status,
            config,
        }
    }

    /// 폴링 루프 실행.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(exchange = %self.exchange, accounts = self.accounts.len(), "Rest poller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.cycle_pause()) => {}
            }

            if self.backoff.is_backed_off(&self.exchange) {
                debug!(exchange = %self.exchange, "Exchange in backoff, skipping poll cycle");
                continue;
            }

            let stats = self.poll_cycle(&shutdown).await;
            stats.log_summary(self.exchange.as_str());
        }

        debug!(exchange = %self.exchange, "Rest poller stopped");
    }

    /// 한 사이클: 스트림이 담당하지 않는 모든 (계좌, 종류) 갱신.
    async fn poll_cycle(&self, shutdown: &CancellationToken) -> PollStats {
        let cycle_start = Instant::now();
        let mut stats = PollStats::new();

        'outer: for account in &self.accounts {
            for kind in DataKind::ALL {
                if shutdown.is_cancelled() {
                    break 'outer;
                }

                // 사이클 도중 백오프에 들어가면 즉시 중단
                if self.backoff.is_backed_off(&self.exchange) {
                    debug!(exchange = %self.exchange, "Backoff entered mid-cycle, aborting");
                    break 'outer;
                }

                // 스트림이 담당 중인 항목은 건너뜀
                if self.status.mode(&account.name, kind) == Some(DeliveryMode::Push) {
                    stats.skipped += 1;
                    continue;
                }

                let start = Instant::now();
                match self.store.update(account, kind).await {
                    Ok(()) => {
                        stats.polled += 1;
                        self.status.record_update(&account.name, kind);
                    }
                    Err(e) => {
                        stats.errors += 1;
                        warn!(
                            account = %account,
                            kind = %kind,
                            error = %e,
                            "Rest refresh failed"
                        );
                        if e.is_gateway() {
                            self.backoff.record_error(&self.exchange);
                        }
                    }
                }
                // 장시간 REST 호출은 과부하 신호
                self.backoff.record_rest_elapsed(&self.exchange, start.elapsed());

                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = tokio::time::sleep(self.config.request_delay()) => {}
                }
            }
        }

        stats.elapsed = cycle_start.elapsed();
        stats
    }
}
