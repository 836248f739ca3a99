//! 거래소별 가격 watcher.
//!
//! 거래소당 하나의 태스크로, 해당 거래소 계좌들의 보유 심볼 합집합을
//! 공용 스트림으로 구독하고 틱을 가격 버퍼에 기록합니다.
//!
//! - 구독은 제한된 크기의 묶음으로 나눠 전송하며, 확정된 심볼은 다시
//!   제출하지 않습니다 (게이트웨이는 중복 구독을 성공으로 처리).
//! - 틱 기록은 (계좌, 심볼)별 고정 간격으로 스로틀합니다.
//! - 에러 처리: 일시 타임아웃은 제한된 지수 백오프 후 재구독, 정상
//!   종료는 즉시 재연결, 구독 하드 리밋 거부는 공용 클라이언트 종료 +
//!   거래소 백오프 + 지터 쿨다운, 그 외는 지수 백오프와 연속 실패 N회
//!   후 강제 클라이언트 재생성.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::ExchangeId;
use sync_exchange::{Gateway, SharedStreamClient, StreamError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{jittered_delay, BackoffCoordinator};
use crate::config::PriceConfig;
use crate::price_buffer::PriceBuffer;
use crate::symbol_map::SymbolMapRegistry;

/// 거래소별 가격 watcher.
pub struct PriceWatcher {
    exchange: ExchangeId,
    gateway: Arc<dyn Gateway>,
    registry: Arc<SymbolMapRegistry>,
    backoff: Arc<BackoffCoordinator>,
    buffer: Arc<PriceBuffer>,
    config: PriceConfig,
}

struct WatchState {
    client: Option<Arc<dyn SharedStreamClient>>,
    confirmed: HashSet<String>,
    throttle: HashMap<(String, String), Instant>,
    consecutive_failures: u32,
}

impl PriceWatcher {
    /// 새 가격 watcher를 생성합니다.
    pub fn new(
        exchange: ExchangeId,
        gateway: Arc<dyn Gateway>,
        registry: Arc<SymbolMapRegistry>,
        backoff: Arc<BackoffCoordinator>,
        buffer: Arc<PriceBuffer>,
        config: PriceConfig,
    ) -> Self {
        Self {
            exchange,
            gateway,
            registry,
            backoff,
            buffer,
            config,
        }
    }

    /// watcher 실행.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut state = WatchState {
            client: None,
            confirmed: HashSet::new(),
            throttle: HashMap::new(),
            consecutive_failures: 0,
        };

        info!(exchange = %self.exchange, "Price watcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.step(&mut state) => {}
            }
        }

        debug!(exchange = %self.exchange, "Price watcher stopped");
    }

    /// 한 사이클: 클라이언트 확보 → 구독 동기화 → 틱 배치 1회 수신.
    async fn step(&self, state: &mut WatchState) {
        // 공용 클라이언트 확보
        if state.client.is_none() {
            match self.gateway.shared_stream_client(&self.exchange).await {
                Ok(client) => {
                    self.registry
                        .set_track_limit(&self.exchange, client.account_track_limit())
                        .await;
                    state.client = Some(client);
                    state.confirmed.clear();
                    state.consecutive_failures = 0;
                }
                Err(e) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    warn!(
                        exchange = %self.exchange,
                        error = %e,
                        "Shared client unavailable"
                    );
                    self.retry_sleep(state.consecutive_failures).await;
                    return;
                }
            }
        }

        // 구독 심볼 동기화 (스로틀된 재구성)
        let entries = self.registry.rebuild_if_stale(&self.exchange).await;
        if !self.sync_subscriptions(state, entries.keys()).await {
            return;
        }

        // 틱 배치 수신
        let Some(client) = state.client.clone() else {
            return;
        };
        let result = tokio::time::timeout(self.config.event_timeout(), client.watch_tickers()).await;

        match result {
            Ok(Ok(ticks)) => {
                state.consecutive_failures = 0;
                self.buffer_ticks(state, &entries, ticks);
            }

            // 이벤트 타임아웃: 일시 에러와 동일하게 백오프 후 재구독
            Err(_) => self.handle_transient(state, "tick stream timeout").await,
            Ok(Err(StreamError::KeepaliveTimeout)) => {
                self.handle_transient(state, "keepalive timeout").await
            }

            Ok(Err(StreamError::BenignClose)) => {
                debug!(exchange = %self.exchange, "Benign close, reconnecting immediately");
                state.client = None;
                state.confirmed.clear();
            }

            Ok(Err(e @ (StreamError::SubscribeRejected(_) | StreamError::RateLimited))) => {
                self.handle_hard_limit(state, &e).await;
            }

            Ok(Err(e)) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                warn!(
                    exchange = %self.exchange,
                    error = %e,
                    failures = state.consecutive_failures,
                    "Tick stream error"
                );
                if state.consecutive_failures >= self.config.max_consecutive_failures {
                    info!(
                        exchange = %self.exchange,
                        "Too many consecutive failures, recreating shared client"
                    );
                    self.gateway.close_shared_stream_client(&self.exchange).await;
                    state.client = None;
                    state.confirmed.clear();
                    state.consecutive_failures = 0;
                }
                self.retry_sleep(state.consecutive_failures.max(1)).await;
            }
        }
    }

    /// 미확정 심볼을 묶음 단위로 구독. 하드 리밋 거부 시 `false`.
    async fn sync_subscriptions<'a>(
        &self,
        state: &mut WatchState,
        desired: impl Iterator<Item = &'a String>,
    ) -> bool {
        let mut pending: Vec<String> = desired
            .filter(|s| !state.confirmed.contains(*s))
            .cloned()
            .collect();
        if pending.is_empty() {
            return true;
        }
        pending.sort();

        let Some(client) = state.client.clone() else {
            return false;
        };
        for chunk in pending.chunks(self.config.subscribe_chunk_size) {
            match client.subscribe(chunk).await {
                Ok(()) => {
                    state.confirmed.extend(chunk.iter().cloned());
                    debug!(
                        exchange = %self.exchange,
                        symbols = chunk.len(),
                        "Subscribed symbol chunk"
                    );
                }
                Err(e @ (StreamError::SubscribeRejected(_) | StreamError::RateLimited)) => {
                    self.handle_hard_limit(state, &e).await;
                    return false;
                }
                Err(e) => {
                    warn!(
                        exchange = %self.exchange,
                        error = %e,
                        "Subscribe chunk failed"
                    );
                    self.handle_transient(state, "subscribe failure").await;
                    return false;
                }
            }
        }
        true
    }

    /// 틱 배치를 매핑에 따라 버퍼에 기록 ((계좌, 심볼)별 스로틀).
    fn buffer_ticks(
        &self,
        state: &mut WatchState,
        entries: &HashMap<String, Vec<(String, String)>>,
        ticks: Vec<sync_exchange::TickerEvent>,
    ) {
        for tick in ticks {
            let Some(targets) = entries.get(&tick.symbol) else {
                continue;
            };
            for (account, internal) in targets {
                let key = (account.clone(), internal.clone());
                let due = state
                    .throttle
                    .get(&key)
                    .map_or(true, |at| at.elapsed() >= self.config.tick_throttle());
                if due {
                    self.buffer
                        .record(account, internal, tick.price, tick.timestamp);
                    state.throttle.insert(key, Instant::now());
                }
            }
        }
    }

    /// 일시 에러: 제한된 지수 백오프 후 재구독.
    async fn handle_transient(&self, state: &mut WatchState, reason: &str) {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        debug!(
            exchange = %self.exchange,
            reason,
            failures = state.consecutive_failures,
            "Transient price stream failure"
        );
        // 재연결 후 구독 상태를 신뢰할 수 없으므로 재구독
        state.confirmed.clear();
        self.retry_sleep(state.consecutive_failures).await;
    }

    /// 구독 하드 리밋: 공용 클라이언트 종료, 거래소 백오프, 지터 쿨다운.
    async fn handle_hard_limit(&self, state: &mut WatchState, error: &StreamError) {
        warn!(
            exchange = %self.exchange,
            error = %error,
            "Subscribe hard limit, resetting shared client and backing off"
        );
        self.gateway.close_shared_stream_client(&self.exchange).await;
        state.client = None;
        state.confirmed.clear();
        state.consecutive_failures = 0;
        self.backoff
            .trigger_backoff(&self.exchange, "subscribe rejected");

        let cooldown = jittered_delay(self.config.cooldown(), self.config.cooldown() * 2, 1);
        tokio::time::sleep(cooldown).await;
    }

    async fn retry_sleep(&self, attempt: u32) {
        let delay = jittered_delay(
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_millis(self.config.retry_max_ms),
            attempt,
        );
        tokio::time::sleep(delay).await;
    }
}
