//! 조정 루프 및 엔진 조립.
//!
//! 희망 계좌 집합과 실행 중인 watcher를 주기적으로 비교합니다:
//! - 제거된 계좌의 watcher 취소 및 클라이언트 반납
//! - 신규 계좌의 watcher를 고정 간격으로 스태거 기동, 2단계
//!   (잔고+포지션 먼저, 주문은 그 다음)로 초기 연결 부하 분산
//! - 거래소별 심볼 매핑의 스로틀된 재구성과, 심볼이 있는 거래소당
//!   정확히 하나의 가격 watcher 유지
//! - 거래소별 REST 폴러 유지 (계좌 구성 변경 시 재기동)
//!
//! watcher 에러는 어떤 경우에도 이 루프로 전파되지 않습니다. 스스로
//! 종료한 watcher는 다음 주기에 회수되어, 미지원으로 판명된 경우를
//! 제외하고 재기동 대상이 됩니다.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{Account, DataKind, ExchangeId};
use sync_data::SyncStore;
use sync_exchange::Gateway;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffCoordinator;
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::EngineResult;
use crate::poller::RestPoller;
use crate::price_buffer::{PriceBuffer, PriceFlusher};
use crate::price_watcher::PriceWatcher;
use crate::status::{DeliveryMode, StatusRegistry, StatusWriter};
use crate::symbol_map::SymbolMapRegistry;
use crate::watcher::{AccountWatcher, WatcherState};

/// 희망 계좌 집합 공급자.
///
/// 외부 설정 소스(파일, DB, 관리 UI)가 구현하며, 추가/제거가 조정
/// 루프를 통해 watcher 기동/종료로 반영됩니다.
#[async_trait]
pub trait AccountsProvider: Send + Sync {
    /// 현재 동기화를 희망하는 계좌 목록.
    async fn desired_accounts(&self) -> EngineResult<Vec<Account>>;
}

/// 고정 계좌 목록 공급자 (개발/테스트용, 런타임 변경 가능).
pub struct StaticAccountsProvider {
    accounts: Mutex<Vec<Account>>,
}

impl StaticAccountsProvider {
    /// 새 공급자를 생성합니다.
    pub fn new(accounts: Vec<Account>) -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(accounts),
        })
    }

    /// 계좌 목록 교체.
    pub fn set_accounts(&self, accounts: Vec<Account>) {
        *self.accounts.lock().unwrap() = accounts;
    }
}

#[async_trait]
impl AccountsProvider for StaticAccountsProvider {
    async fn desired_accounts(&self) -> EngineResult<Vec<Account>> {
        Ok(self.accounts.lock().unwrap().clone())
    }
}

struct WatcherHandle {
    token: CancellationToken,
    handle: JoinHandle<WatcherState>,
}

struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PollerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
    accounts: Vec<Account>,
}

#[derive(Default)]
struct ReconcileState {
    watchers: HashMap<(String, DataKind), WatcherHandle>,
    unsupported: HashSet<(String, DataKind)>,
    price_watchers: HashMap<ExchangeId, TaskHandle>,
    pollers: HashMap<ExchangeId, PollerHandle>,
    known_accounts: HashSet<String>,
    connected_exchanges: HashSet<ExchangeId>,
}

/// 동기화 엔진.
///
/// 모든 공유 구성요소를 소유하고 watcher에 주입합니다.
pub struct SyncEngine {
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn SyncStore>,
    accounts_provider: Arc<dyn AccountsProvider>,
    config: EngineConfig,
    connections: Arc<ConnectionManager>,
    backoff: Arc<BackoffCoordinator>,
    buffer: Arc<PriceBuffer>,
    registry: Arc<SymbolMapRegistry>,
    status: Arc<StatusRegistry>,
}

impl SyncEngine {
    /// 새 엔진을 조립합니다.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn SyncStore>,
        accounts_provider: Arc<dyn AccountsProvider>,
        config: EngineConfig,
    ) -> Self {
        let connections = ConnectionManager::new(gateway.clone(), config.connection.clone());
        let backoff = Arc::new(BackoffCoordinator::new(config.backoff.clone()));
        let buffer = PriceBuffer::new();
        let registry = SymbolMapRegistry::new(store.clone(), config.price.rebuild_interval());
        let status = Arc::new(StatusRegistry::new());

        Self {
            gateway,
            store,
            accounts_provider,
            config,
            connections,
            backoff,
            buffer,
            registry,
            status,
        }
    }

    /// 전달 상태 레지스트리.
    pub fn status(&self) -> Arc<StatusRegistry> {
        self.status.clone()
    }

    /// 백오프 조정자.
    pub fn backoff(&self) -> Arc<BackoffCoordinator> {
        self.backoff.clone()
    }

    /// 가격 버퍼.
    pub fn buffer(&self) -> Arc<PriceBuffer> {
        self.buffer.clone()
    }

    /// 연결 관리자.
    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    /// 엔진 실행. 종료 신호를 받으면 순서대로 정리하고 반환합니다:
    /// 버퍼링 중단 → 최종 플러시 → 태스크 취소 → 클라이언트 종료.
    pub async fn run(self, shutdown: CancellationToken) {
        let tasks = CancellationToken::new();
        let flush_token = CancellationToken::new();

        let close_listener = self.connections.spawn_close_listener(tasks.child_token());
        let flusher = PriceFlusher::new(
            self.buffer.clone(),
            self.store.clone(),
            self.config.buffer.clone(),
        );
        let flusher_handle = tokio::spawn(flusher.run(flush_token.clone()));
        let status_writer = StatusWriter::new(
            self.status.clone(),
            self.backoff.clone(),
            &self.config.status,
        );
        let status_handle = tokio::spawn(status_writer.run(tasks.child_token()));

        let mut state = ReconcileState::default();
        let mut ticker = tokio::time::interval(self.config.reconcile.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Sync engine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile_once(&mut state, &tasks).await;
                }
            }
        }

        info!("Sync engine shutting down");

        // 1. 버퍼링 중단 + 타임아웃 걸린 최종 플러시 (플러셔가 수행)
        flush_token.cancel();
        let _ = flusher_handle.await;

        // 2. 모든 태스크 취소 및 합류 (watcher는 취소 경로에서도 슬롯 해제)
        tasks.cancel();
        let shared_exchanges: Vec<ExchangeId> = state.price_watchers.keys().cloned().collect();
        let watcher_joins =
            futures::future::join_all(state.watchers.drain().map(|(_, h)| h.handle));
        let _ = tokio::time::timeout(Duration::from_secs(10), watcher_joins).await;
        let task_joins = futures::future::join_all(
            state
                .price_watchers
                .drain()
                .map(|(_, h)| h.handle)
                .chain(state.pollers.drain().map(|(_, h)| h.handle)),
        );
        let _ = tokio::time::timeout(Duration::from_secs(5), task_joins).await;
        let _ = status_handle.await;
        let _ = close_listener.await;

        // 3. 게이트웨이 클라이언트 종료
        self.connections.shutdown_all().await;
        for exchange in shared_exchanges {
            self.gateway.close_shared_stream_client(&exchange).await;
        }

        info!("Sync engine stopped");
    }

    /// 조정 1회 수행.
    async fn reconcile_once(&self, state: &mut ReconcileState, tasks: &CancellationToken) {
        let desired = match self.accounts_provider.desired_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "Desired account reload failed, skipping cycle");
                return;
            }
        };

        let desired_map: HashMap<String, Account> = desired
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();

        self.remove_stale(state, &desired_map).await;
        self.reap_finished(state).await;
        self.start_missing(state, &desired_map, tasks).await;
        self.reconcile_exchanges(state, &desired_map, tasks).await;

        state.known_accounts = desired_map.keys().cloned().collect();
    }

    /// 더 이상 희망하지 않는 계좌의 watcher 취소 및 상태 정리.
    async fn remove_stale(&self, state: &mut ReconcileState, desired: &HashMap<String, Account>) {
        let stale: Vec<(String, DataKind)> = state
            .watchers
            .keys()
            .filter(|(name, _)| !desired.contains_key(name))
            .cloned()
            .collect();

        for key in stale {
            if let Some(handle) = state.watchers.remove(&key) {
                info!(account = %key.0, kind = %key.1, "Account no longer desired, stopping watcher");
                handle.token.cancel();
                // watcher가 취소를 관찰하며 자체적으로 슬롯을 해제
                let _ = tokio::time::timeout(Duration::from_secs(5), handle.handle).await;
            }
        }

        state
            .unsupported
            .retain(|(name, _)| desired.contains_key(name));

        for name in state
            .known_accounts
            .iter()
            .filter(|n| !desired.contains_key(*n))
        {
            self.status.remove_account(name);
        }
    }

    /// 스스로 종료한 watcher 회수.
    ///
    /// 미지원으로 끝난 (계좌, 종류)는 기록되어 재기동되지 않습니다.
    /// 그 외(강등 등)는 다음 기동 단계에서 재기동 대상이 됩니다.
    async fn reap_finished(&self, state: &mut ReconcileState) {
        let finished: Vec<(String, DataKind)> = state
            .watchers
            .iter()
            .filter(|(_, h)| h.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();

        for key in finished {
            if let Some(handle) = state.watchers.remove(&key) {
                if let Ok(WatcherState::Unsupported) = handle.handle.await {
                    debug!(
                        account = %key.0,
                        kind = %key.1,
                        "Watcher proved capability unsupported, not restarting"
                    );
                    state.unsupported.insert(key);
                }
            }
        }
    }

    /// 누락된 watcher를 2단계 스태거로 기동.
    async fn start_missing(
        &self,
        state: &mut ReconcileState,
        desired: &HashMap<String, Account>,
        tasks: &CancellationToken,
    ) {
        let mut names: Vec<&String> = desired.keys().collect();
        names.sort();

        let phases: [&[DataKind]; 2] = [&DataKind::FIRST_PHASE, &[DataKind::Order]];
        for phase in phases {
            for name in &names {
                let account = &desired[*name];
                for kind in phase.iter().copied() {
                    let key = (account.name.clone(), kind);
                    if state.watchers.contains_key(&key) || state.unsupported.contains(&key) {
                        continue;
                    }

                    self.status
                        .set_mode(&account.name, kind, DeliveryMode::Pull);
                    let token = tasks.child_token();
                    let watcher = AccountWatcher::new(
                        account.clone(),
                        kind,
                        self.connections.clone(),
                        self.backoff.clone(),
                        self.store.clone(),
                        self.status.clone(),
                        self.config.watcher.clone(),
                    );
                    let handle = tokio::spawn(watcher.run(token.clone()));
                    state.watchers.insert(key, WatcherHandle { token, handle });

                    // 동시 핸드셰이크 부하를 제한하는 기동 간격
                    tokio::select! {
                        _ = tasks.cancelled() => return,
                        _ = tokio::time::sleep(self.config.reconcile.stagger()) => {}
                    }
                }
            }
        }
    }

    /// 거래소별 심볼 매핑, 가격 watcher, 폴러 조정.
    async fn reconcile_exchanges(
        &self,
        state: &mut ReconcileState,
        desired: &HashMap<String, Account>,
        tasks: &CancellationToken,
    ) {
        let mut by_exchange: HashMap<ExchangeId, Vec<Account>> = HashMap::new();
        for account in desired.values() {
            by_exchange
                .entry(account.exchange.clone())
                .or_default()
                .push(account.clone());
        }

        // 더 이상 계좌가 없는 거래소 정리
        let gone: Vec<ExchangeId> = state
            .price_watchers
            .keys()
            .chain(state.pollers.keys())
            .filter(|ex| !by_exchange.contains_key(ex))
            .cloned()
            .collect();
        for exchange in gone {
            if let Some(handle) = state.price_watchers.remove(&exchange) {
                handle.token.cancel();
                self.gateway.close_shared_stream_client(&exchange).await;
            }
            if let Some(handle) = state.pollers.remove(&exchange) {
                handle.token.cancel();
            }
            self.registry.remove_exchange(&exchange).await;
        }

        for (exchange, mut accounts) in by_exchange {
            accounts.sort_by(|a, b| a.name.cmp(&b.name));

            // 처음 보는 거래소는 게이트웨이 연결 준비
            if !state.connected_exchanges.contains(&exchange) {
                match self.gateway.connect(&exchange).await {
                    Ok(()) => {
                        state.connected_exchanges.insert(exchange.clone());
                    }
                    Err(e) => {
                        warn!(exchange = %exchange, error = %e, "Gateway connect failed");
                        self.backoff.record_error(&exchange);
                        continue;
                    }
                }
            }

            self.registry.set_accounts(&exchange, accounts.clone()).await;
            let entries = self.registry.rebuild_if_stale(&exchange).await;
            let needs_price = !entries.is_empty();
            let price_running = state
                .price_watchers
                .get(&exchange)
                .map(|h| !h.handle.is_finished())
                .unwrap_or(false);

            if needs_price && !price_running {
                let token = tasks.child_token();
                let watcher = PriceWatcher::new(
                    exchange.clone(),
                    self.gateway.clone(),
                    self.registry.clone(),
                    self.backoff.clone(),
                    self.buffer.clone(),
                    self.config.price.clone(),
                );
                let handle = tokio::spawn(watcher.run(token.clone()));
                state
                    .price_watchers
                    .insert(exchange.clone(), TaskHandle { token, handle });
            } else if !needs_price && price_running {
                if let Some(handle) = state.price_watchers.remove(&exchange) {
                    info!(exchange = %exchange, "No symbols left, stopping price watcher");
                    handle.token.cancel();
                    self.gateway.close_shared_stream_client(&exchange).await;
                }
            }

            // 폴러: 계좌 구성 변경 또는 종료 시 재기동
            let poller_stale = state
                .pollers
                .get(&exchange)
                .map(|p| p.accounts != accounts || p.handle.is_finished())
                .unwrap_or(true);
            if poller_stale {
                if let Some(handle) = state.pollers.remove(&exchange) {
                    handle.token.cancel();
                }
                let token = tasks.child_token();
                let poller = RestPoller::new(
                    exchange.clone(),
                    accounts.clone(),
                    self.store.clone(),
                    self.backoff.clone(),
                    self.status.clone(),
                    self.config.poller.clone(),
                );
                let handle = tokio::spawn(poller.run(token.clone()));
                state.pollers.insert(
                    exchange,
                    PollerHandle {
                        token,
                        handle,
                        accounts,
                    },
                );
            }
        }
    }
}
