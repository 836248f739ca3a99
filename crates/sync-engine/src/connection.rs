//! 인증 스트림 연결 관리자.
//!
//! 클라이언트 생성 요청을 단일 잠금 구간으로 직렬화하여 용량
//! 검사-예약이 원자적으로 수행되도록 합니다. 생성 중인 요청은 예약
//! 집합으로 따로 세며, 확정된 연결과 합산해 전역/거래소별 상한과
//! 비교합니다. 상한 도달 시 `None`을 반환하며 (블로킹하지 않음),
//! 호출자는 이를 REST 폴백 신호로 취급해야 합니다.
//!
//! 인증 클라이언트는 계좌당 하나이며 해당 계좌의 잔고/포지션/주문
//! watcher가 공유합니다. 풀은 참조 수를 관리해 마지막 watcher가
//! 반납할 때 클라이언트를 닫습니다. 용량 계산은 계좌 단위입니다.
//!
//! 상한 도달 경고는 에피소드당 한 번만 남기고, 사용량이 상한 아래로
//! 내려가면 (반납 또는 게이트웨이 종료 알림으로) 플래그를 해제합니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use sync_core::{Account, ExchangeId};
use sync_exchange::{Gateway, PrivateStreamClient};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

struct OpenEntry {
    account: Account,
    client: Arc<dyn PrivateStreamClient>,
    refs: usize,
}

#[derive(Default)]
struct PoolState {
    /// 확정된 계좌 클라이언트: (거래소, 계좌) → 핸들 + 참조 수
    open: HashMap<(ExchangeId, String), OpenEntry>,
    /// 생성 진행 중 예약
    reserved: HashSet<(ExchangeId, String)>,
    /// 상한 경고 플래그 (에피소드당 1회)
    warned_exchanges: HashSet<ExchangeId>,
    warned_global: bool,
}

impl PoolState {
    fn exchange_usage(&self, exchange: &ExchangeId) -> usize {
        let open = self.open.keys().filter(|(ex, _)| ex == exchange).count();
        let reserved = self.reserved.iter().filter(|(ex, _)| ex == exchange).count();
        open + reserved
    }

    fn global_usage(&self) -> usize {
        self.open.len() + self.reserved.len()
    }

    fn clear_warnings_if_below(&mut self, exchange: &ExchangeId, config: &ConnectionConfig) {
        if self.exchange_usage(exchange) < config.per_exchange_cap {
            self.warned_exchanges.remove(exchange);
        }
        if self.global_usage() < config.global_cap {
            self.warned_global = false;
        }
    }
}

/// 인증 스트림 연결 관리자.
///
/// 프로세스 전역 싱글턴이 아니라 엔진이 소유하고 watcher에 주입하는
/// 단일 인스턴스입니다.
pub struct ConnectionManager {
    gateway: Arc<dyn Gateway>,
    config: ConnectionConfig,
    state: Mutex<PoolState>,
}

impl ConnectionManager {
    /// 새 연결 관리자를 생성합니다.
    pub fn new(gateway: Arc<dyn Gateway>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            config,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// 계좌 인증 클라이언트 요청.
    ///
    /// 계좌의 클라이언트가 이미 열려 있으면 같은 핸들을 공유합니다
    /// (용량 추가 소비 없음). 용량이 없으면 `None`을 반환합니다.
    /// `None`은 에러가 아니라 "REST 폴백 사용" 신호입니다.
    pub async fn request_client(
        &self,
        account: &Account,
    ) -> Option<Arc<dyn PrivateStreamClient>> {
        let key = (account.exchange.clone(), account.name.clone());

        {
            let mut state = self.state.lock().await;

            // 이미 열린 계좌 클라이언트는 공유
            if let Some(entry) = state.open.get_mut(&key) {
                entry.refs += 1;
                return Some(entry.client.clone());
            }

            // 같은 계좌의 생성이 진행 중이면 이번 요청은 폴백
            if state.reserved.contains(&key) {
                debug!(account = %account, "Client creation already in flight");
                return None;
            }

            if state.exchange_usage(&account.exchange) >= self.config.per_exchange_cap {
                if !state.warned_exchanges.contains(&account.exchange) {
                    state.warned_exchanges.insert(account.exchange.clone());
                    warn!(
                        exchange = %account.exchange,
                        cap = self.config.per_exchange_cap,
                        "Per-exchange client cap reached, rejecting stream requests"
                    );
                }
                return None;
            }

            if state.global_usage() >= self.config.global_cap {
                if !state.warned_global {
                    state.warned_global = true;
                    warn!(
                        cap = self.config.global_cap,
                        "Global client cap reached, rejecting stream requests"
                    );
                }
                return None;
            }

            // 생성 동안 슬롯 예약 (상한 계산에 포함)
            state.reserved.insert(key.clone());
        }

        let result = self.gateway.private_stream_client(account).await;

        let mut state = self.state.lock().await;
        state.reserved.remove(&key);

        match result {
            Ok(client) => {
                state.open.insert(
                    key,
                    OpenEntry {
                        account: account.clone(),
                        client: client.clone(),
                        refs: 1,
                    },
                );
                debug!(account = %account, "Private stream client opened");
                Some(client)
            }
            Err(e) => {
                state.clear_warnings_if_below(&account.exchange, &self.config);
                warn!(account = %account, error = %e, "Private stream client creation failed");
                None
            }
        }
    }

    /// 계좌 클라이언트 참조 반납. 마지막 반납이 클라이언트를 닫습니다.
    ///
    /// watcher는 종료 경로(취소 포함)에서 반드시 호출해야 합니다.
    pub async fn release(&self, account: &Account) {
        let key = (account.exchange.clone(), account.name.clone());
        let close = {
            let mut state = self.state.lock().await;
            match state.open.get_mut(&key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        state.open.remove(&key);
                        state.clear_warnings_if_below(&account.exchange, &self.config);
                        true
                    } else {
                        false
                    }
                }
                // 게이트웨이 알림 등으로 이미 제거됨
                None => false,
            }
        };

        if close {
            self.gateway.close_private_stream_client(account).await;
            debug!(account = %account, "Private stream client released");
        }
    }

    /// 게이트웨이 종료 알림 반영 (클라이언트는 이미 닫힘).
    ///
    /// 핸들을 쥔 watcher는 다음 이벤트 대기에서 에러를 보고 재획득
    /// 경로를 타게 됩니다.
    async fn mark_closed(&self, exchange: &ExchangeId, account_name: &str) {
        let mut state = self.state.lock().await;
        let key = (exchange.clone(), account_name.to_string());
        if state.open.remove(&key).is_some() {
            state.clear_warnings_if_below(exchange, &self.config);
            debug!(
                exchange = %exchange,
                account = account_name,
                "Close notification applied to connection pool"
            );
        }
    }

    /// 종료 알림 리스너 태스크 기동.
    ///
    /// 게이트웨이의 종료 알림 채널을 단일 태스크로 소비합니다.
    pub fn spawn_close_listener(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let mut rx = manager.gateway.subscribe_close_notifications();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    note = rx.recv() => match note {
                        Ok(note) => manager.mark_closed(&note.exchange, &note.account).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Close notification listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// 거래소별 현재 사용량 (확정 + 예약, 계좌 단위).
    pub async fn exchange_usage(&self, exchange: &ExchangeId) -> usize {
        self.state.lock().await.exchange_usage(exchange)
    }

    /// 전체 현재 사용량 (확정 + 예약, 계좌 단위).
    pub async fn global_usage(&self) -> usize {
        self.state.lock().await.global_usage()
    }

    /// 남아 있는 모든 인증 클라이언트 종료 (엔진 종료 경로).
    pub async fn shutdown_all(&self) {
        let accounts: Vec<Account> = {
            let mut state = self.state.lock().await;
            state.reserved.clear();
            state.open.drain().map(|(_, entry)| entry.account).collect()
        };

        for account in accounts {
            self.gateway.close_private_stream_client(&account).await;
        }
        info!("All private stream clients closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_exchange::sim::SimGateway;

    fn account(name: &str, exchange: &str) -> Account {
        Account::new(name, ExchangeId::new(exchange), "cred")
    }

    fn manager(
        gateway: Arc<SimGateway>,
        global: usize,
        per_exchange: usize,
    ) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            gateway,
            ConnectionConfig {
                global_cap: global,
                per_exchange_cap: per_exchange,
            },
        )
    }

    #[tokio::test]
    async fn test_per_exchange_cap() {
        let gateway = SimGateway::new();
        let manager = manager(gateway, 10, 2);

        assert!(manager.request_client(&account("a", "binance")).await.is_some());
        assert!(manager.request_client(&account("b", "binance")).await.is_some());
        assert!(manager.request_client(&account("c", "binance")).await.is_none());
        // 다른 거래소는 영향 없음
        assert!(manager.request_client(&account("d", "bybit")).await.is_some());
    }

    #[tokio::test]
    async fn test_global_cap() {
        let gateway = SimGateway::new();
        let manager = manager(gateway, 2, 10);

        assert!(manager.request_client(&account("a", "binance")).await.is_some());
        assert!(manager.request_client(&account("b", "bybit")).await.is_some());
        assert!(manager.request_client(&account("c", "okx")).await.is_none());
    }

    #[tokio::test]
    async fn test_same_account_shares_client_and_slot() {
        let gateway = SimGateway::new();
        let manager = manager(gateway.clone(), 10, 1);
        let alpha = account("a", "binance");

        let first = manager.request_client(&alpha).await.unwrap();
        let second = manager.request_client(&alpha).await.unwrap();

        // 같은 계좌는 같은 핸들, 슬롯 하나만 점유
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.exchange_usage(&alpha.exchange).await, 1);

        // 첫 반납은 닫지 않고, 마지막 반납이 닫음
        manager.release(&alpha).await;
        assert!(gateway.closed_privates().is_empty());
        manager.release(&alpha).await;
        assert_eq!(gateway.closed_privates(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_release_frees_capacity() {
        let gateway = SimGateway::new();
        let manager = manager(gateway.clone(), 10, 1);
        let alpha = account("a", "binance");

        assert!(manager.request_client(&alpha).await.is_some());
        assert!(manager.request_client(&account("b", "binance")).await.is_none());

        manager.release(&alpha).await;
        assert_eq!(gateway.closed_privates(), vec!["a".to_string()]);
        assert!(manager.request_client(&account("b", "binance")).await.is_some());
    }

    #[tokio::test]
    async fn test_creation_failure_frees_reservation() {
        let gateway = SimGateway::new();
        gateway.fail_private_for("a");
        let manager = manager(gateway, 10, 1);

        assert!(manager.request_client(&account("a", "binance")).await.is_none());
        // 실패한 예약이 용량을 점유하지 않아야 함
        assert!(manager.request_client(&account("b", "binance")).await.is_some());
    }

    #[tokio::test]
    async fn test_close_notification_frees_capacity() {
        let gateway = SimGateway::new();
        let manager = manager(gateway.clone(), 10, 1);
        let shutdown = CancellationToken::new();
        let listener = manager.spawn_close_listener(shutdown.clone());

        assert!(manager.request_client(&account("a", "binance")).await.is_some());
        assert!(manager.request_client(&account("b", "binance")).await.is_none());

        gateway.notify_close(&ExchangeId::new("binance"), "a");
        // 리스너가 알림을 처리할 시간
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(manager.exchange_usage(&ExchangeId::new("binance")).await, 0);
        assert!(manager.request_client(&account("b", "binance")).await.is_some());

        shutdown.cancel();
        let _ = listener.await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_requests_respect_cap() {
        let gateway = SimGateway::new();
        let manager = manager(gateway, 100, 5);

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .request_client(&account(&format!("acct-{}", i), "binance"))
                    .await
                    .is_some()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_clients() {
        let gateway = SimGateway::new();
        let manager = manager(gateway.clone(), 10, 10);

        manager.request_client(&account("a", "binance")).await;
        manager.request_client(&account("b", "bybit")).await;

        manager.shutdown_all().await;
        assert_eq!(manager.global_usage().await, 0);
        assert_eq!(gateway.closed_privates().len(), 2);
    }
}
