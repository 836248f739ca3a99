//! 계좌별 스트림 watcher.
//!
//! (계좌, 데이터 종류)당 하나의 태스크로 실행되는 상태 기계입니다:
//!
//! ```text
//! Init ──[기능 플래그 미지원]──> Unsupported (종료, REST 폴러가 담당)
//!   │
//!   └──[클라이언트 획득]──> Streaming ──[강등/하드 리밋/취소]──> Stopped
//! ```
//!
//! Streaming 루프의 에러 처리 (종류별로 정확히 하나의 조치):
//! - `BenignClose` → 즉시 재수신, 백오프 없음
//! - `KeepaliveTimeout` (이벤트 타임아웃 포함) → 플래그로 제한된 1회
//!   클라이언트 재시작, 이후 연속 성공 N회에 플래그 재장전
//! - `Network` → 강등 프로토콜 (윈도우당 1계좌만 강등, 나머지는
//!   클라이언트 재획득 후 유지)
//! - `SubscribeRejected`/`RateLimited` → 거래소 백오프 후 REST 폴백
//! - `CapabilityUnsupported` → 영구 REST 위임
//! - `Unknown` → 지터 지수 백오프 후 재시도
//!
//! 모든 에러는 태스크 안에서 처리되며 조정 루프로 전파되지 않습니다.
//! 어떤 종료 경로든 예약된 연결 슬롯은 반드시 해제합니다.

use std::sync::Arc;
use std::time::Instant;
use sync_core::{Account, DataKind};
use sync_data::SyncStore;
use sync_exchange::{PrivateStreamClient, StreamError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{jittered_delay, BackoffCoordinator, DemotionDecision};
use crate::config::WatcherConfig;
use crate::connection::ConnectionManager;
use crate::status::{DeliveryMode, StatusRegistry};

/// watcher 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// 기동 중
    Init,
    /// 스트리밍 미지원 (영구적, 재기동 금지)
    Unsupported,
    /// 스트리밍 중
    Streaming,
    /// 종료됨 (REST 폴백, 다음 조정 주기에 재기동 가능)
    Stopped,
}

/// 계좌별 스트림 watcher.
pub struct AccountWatcher {
    account: Account,
    kind: DataKind,
    connections: Arc<ConnectionManager>,
    backoff: Arc<BackoffCoordinator>,
    store: Arc<dyn SyncStore>,
    status: Arc<StatusRegistry>,
    config: WatcherConfig,
}

impl AccountWatcher {
    /// 새 watcher를 생성합니다.
    pub fn new(
        account: Account,
        kind: DataKind,
        connections: Arc<ConnectionManager>,
        backoff: Arc<BackoffCoordinator>,
        store: Arc<dyn SyncStore>,
        status: Arc<StatusRegistry>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            account,
            kind,
            connections,
            backoff,
            store,
            status,
            config,
        }
    }

    /// watcher 실행. 최종 상태를 반환합니다.
    pub async fn run(self, shutdown: CancellationToken) -> WatcherState {
        let final_state = self.run_inner(&shutdown).await;

        // 어떤 종료 경로든 슬롯 해제 후 REST 전달로 표시
        self.connections.release(&self.account).await;
        self.status
            .set_mode(&self.account.name, self.kind, DeliveryMode::Pull);

        debug!(
            account = %self.account,
            kind = %self.kind,
            state = ?final_state,
            "Watcher finished"
        );
        final_state
    }

    async fn run_inner(&self, shutdown: &CancellationToken) -> WatcherState {
        let Some(client) = self.connections.request_client(&self.account).await else {
            debug!(
                account = %self.account,
                kind = %self.kind,
                "No stream capacity, falling back to rest polling"
            );
            return WatcherState::Stopped;
        };

        // 기능 플래그 확인
        if !client.capabilities().supports(self.kind) {
            info!(
                account = %self.account,
                kind = %self.kind,
                "Streaming unsupported, delegating to rest poller permanently"
            );
            return WatcherState::Unsupported;
        }

        self.status
            .set_mode(&self.account.name, self.kind, DeliveryMode::Push);
        self.stream_loop(client, shutdown).await
    }

    async fn stream_loop(
        &self,
        mut client: Arc<dyn PrivateStreamClient>,
        shutdown: &CancellationToken,
    ) -> WatcherState {
        let mut successes: u32 = 0;
        let mut restart_used = false;
        let mut unknown_failures: u32 = 0;
        let mut last_persist: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return WatcherState::Stopped,
                res = tokio::time::timeout(self.config.event_timeout(), client.watch(self.kind)) => {
                    // 타임아웃은 keepalive 실패와 동일하게 취급
                    res.unwrap_or(Err(StreamError::KeepaliveTimeout))
                }
            };

            match event {
                Ok(_event) => {
                    unknown_failures = 0;
                    successes = successes.saturating_add(1);

                    if restart_used && successes >= self.config.restart_success_threshold {
                        restart_used = false;
                        debug!(
                            account = %self.account,
                            kind = %self.kind,
                            successes,
                            "Restart flag re-armed after consecutive successes"
                        );
                    }

                    // 이벤트가 더 자주 와도 최소 간격으로만 저장
                    let due = last_persist
                        .map_or(true, |at| at.elapsed() >= self.config.min_refresh());
                    if due {
                        match self.store.update(&self.account, self.kind).await {
                            Ok(()) => {
                                last_persist = Some(Instant::now());
                                self.status.record_update(&self.account.name, self.kind);
                            }
                            Err(e) => {
                                warn!(
                                    account = %self.account,
                                    kind = %self.kind,
                                    error = %e,
                                    "State persist failed"
                                );
                            }
                        }
                    }
                }

                Err(StreamError::CapabilityUnsupported(msg)) => {
                    info!(
                        account = %self.account,
                        kind = %self.kind,
                        reason = %msg,
                        "Capability rejected mid-stream, delegating to rest poller"
                    );
                    return WatcherState::Unsupported;
                }

                Err(StreamError::BenignClose) => {
                    successes = 0;
                    debug!(
                        account = %self.account,
                        kind = %self.kind,
                        "Benign close, reconnecting immediately"
                    );
                }

                Err(StreamError::KeepaliveTimeout) => {
                    successes = 0;
                    if !restart_used {
                        restart_used = true;
                        info!(
                            account = %self.account,
                            kind = %self.kind,
                            "Keepalive failure, attempting one client restart"
                        );
                        match client.restart().await {
                            Ok(()) => continue,
                            Err(e) => {
                                warn!(
                                    account = %self.account,
                                    error = %e,
                                    "Client restart failed"
                                );
                                if !self.recover_network(&mut client, shutdown).await {
                                    return WatcherState::Stopped;
                                }
                            }
                        }
                    } else {
                        // 재시작 기회 소진: 네트워크 장애로 취급
                        if !self.recover_network(&mut client, shutdown).await {
                            return WatcherState::Stopped;
                        }
                    }
                }

                Err(StreamError::Network(msg)) => {
                    successes = 0;
                    warn!(
                        account = %self.account,
                        kind = %self.kind,
                        error = %msg,
                        "Network error on stream"
                    );
                    if !self.recover_network(&mut client, shutdown).await {
                        return WatcherState::Stopped;
                    }
                }

                Err(e @ (StreamError::SubscribeRejected(_) | StreamError::RateLimited)) => {
                    warn!(
                        account = %self.account,
                        kind = %self.kind,
                        error = %e,
                        "Exchange hard limit, terminating stream"
                    );
                    self.backoff
                        .trigger_backoff(&self.account.exchange, "stream hard limit");
                    return WatcherState::Stopped;
                }

                Err(StreamError::Unknown(msg)) => {
                    successes = 0;
                    unknown_failures = unknown_failures.saturating_add(1);
                    let delay = jittered_delay(
                        std::time::Duration::from_millis(self.config.retry_base_ms),
                        std::time::Duration::from_millis(self.config.retry_max_ms),
                        unknown_failures,
                    );
                    warn!(
                        account = %self.account,
                        kind = %self.kind,
                        error = %msg,
                        attempt = unknown_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Unknown stream error, retrying with backoff"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return WatcherState::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 네트워크 장애 복구 경로 (강등 프로토콜).
    ///
    /// `true`면 새 클라이언트로 스트리밍을 계속하고, `false`면 watcher를
    /// 종료합니다 (강등 또는 재획득 실패).
    async fn recover_network(
        &self,
        client: &mut Arc<dyn PrivateStreamClient>,
        shutdown: &CancellationToken,
    ) -> bool {
        self.backoff.record_error(&self.account.exchange);

        match self
            .backoff
            .try_demote(&self.account.exchange, &self.account.name)
        {
            DemotionDecision::Demote => false,
            DemotionDecision::Retry => {
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(self.config.reconnect_pause()) => {}
                }

                // 기존 클라이언트 반납 후 재획득
                self.connections.release(&self.account).await;
                match self.connections.request_client(&self.account).await {
                    Some(new_client) => {
                        info!(
                            account = %self.account,
                            kind = %self.kind,
                            "Private client re-acquired, staying on stream"
                        );
                        *client = new_client;
                        true
                    }
                    None => {
                        debug!(
                            account = %self.account,
                            kind = %self.kind,
                            "Re-acquire failed, falling back to rest polling"
                        );
                        false
                    }
                }
            }
        }
    }
}
