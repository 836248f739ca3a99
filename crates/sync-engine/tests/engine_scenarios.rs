//! 엔진 통합 시나리오 테스트.
//!
//! 시뮬레이션 게이트웨이와 인메모리 저장소로 엔진 전체를 구동합니다.

use std::sync::Arc;
use std::time::Duration;
use sync_core::{Account, DataKind, ExchangeId};
use sync_data::MemorySyncStore;
use sync_engine::config::{ConnectionConfig, EngineConfig};
use sync_engine::{
    AccountWatcher, BackoffCoordinator, ConnectionManager, DeliveryMode, StaticAccountsProvider,
    StatusRegistry, SyncEngine,
};
use sync_exchange::sim::{SimGateway, SimPrivateClient};
use sync_exchange::StreamError;
use tokio_util::sync::CancellationToken;

fn account(name: &str, exchange: &str) -> Account {
    Account::new(name, ExchangeId::new(exchange), "cred")
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.reconcile.interval_ms = 50;
    config.reconcile.stagger_ms = 1;
    config.buffer.flush_interval_ms = 50;
    config.status.interval_ms = 50;
    config.watcher.min_refresh_ms = 0;
    config.watcher.event_timeout_ms = 5_000;
    config.watcher.reconnect_pause_ms = 20;
    config.price.tick_throttle_ms = 0;
    config.poller.cycle_pause_ms = 30;
    config.poller.request_delay_ms = 0;
    config
}

/// 같은 거래소의 두 계좌가 거의 동시에 네트워크 에러를 내도
/// 강등 윈도우당 한 계좌만 강등된다.
#[tokio::test(flavor = "multi_thread")]
async fn network_blip_demotes_only_one_account() {
    let gateway = SimGateway::new();
    let ying = account("ying", "binance");
    let zeta = account("zeta", "binance");

    let client_y = SimPrivateClient::new();
    client_y.push_success(DataKind::Balance);
    client_y.push_error(StreamError::Network("connection reset".to_string()));
    gateway.register_private(&ying, client_y);

    let client_z = SimPrivateClient::new();
    client_z.push_success(DataKind::Balance);
    client_z.push_error(StreamError::Network("connection reset".to_string()));
    gateway.register_private(&zeta, client_z);

    let config = fast_config();
    let connections = ConnectionManager::new(
        gateway.clone(),
        ConnectionConfig {
            global_cap: 10,
            per_exchange_cap: 10,
        },
    );
    let backoff = Arc::new(BackoffCoordinator::new(config.backoff.clone()));
    let store = Arc::new(MemorySyncStore::new());
    let status = Arc::new(StatusRegistry::new());

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for acct in [&ying, &zeta] {
        let watcher = AccountWatcher::new(
            acct.clone(),
            DataKind::Balance,
            connections.clone(),
            backoff.clone(),
            store.clone(),
            status.clone(),
            config.watcher.clone(),
        );
        handles.push(tokio::spawn(watcher.run(shutdown.clone())));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    // 정확히 한 watcher만 종료 (강등), 다른 하나는 재획득 후 스트리밍 유지
    let finished = handles.iter().filter(|h| h.is_finished()).count();
    assert_eq!(finished, 1);

    let modes = [
        status.mode("ying", DataKind::Balance),
        status.mode("zeta", DataKind::Balance),
    ];
    assert_eq!(
        modes
            .iter()
            .filter(|m| **m == Some(DeliveryMode::Pull))
            .count(),
        1
    );
    assert_eq!(
        modes
            .iter()
            .filter(|m| **m == Some(DeliveryMode::Push))
            .count(),
        1
    );

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

/// 자동 이벤트 게이트웨이로 엔진 전체 사이클: watcher 기동, push 전환,
/// 상태 저장, 가격 배치 플러시, 상태 요약 파일 작성, 정상 종료.
#[tokio::test(flavor = "multi_thread")]
async fn engine_full_cycle_with_sim_gateway() {
    let gateway = SimGateway::with_auto_events(Duration::from_millis(20));
    let store = Arc::new(MemorySyncStore::new());
    store.set_open_symbols("alpha", &["BTC/USDT"]);

    let provider =
        StaticAccountsProvider::new(vec![account("alpha", "binance"), account("beta", "bybit")]);

    let mut config = fast_config();
    let status_path = std::env::temp_dir().join(format!(
        "sync-engine-status-{}.json",
        std::process::id()
    ));
    config.status.path = status_path.clone();

    let engine = SyncEngine::new(gateway, store.clone(), provider, config);
    let status = engine.status();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(700)).await;

    // watcher가 스트리밍으로 전환되어 저장 수행
    assert_eq!(
        status.mode("alpha", DataKind::Balance),
        Some(DeliveryMode::Push)
    );
    assert!(store.update_count("alpha", DataKind::Balance) >= 1);
    assert!(store.update_count("beta", DataKind::Order) >= 1);

    // 가격 틱이 버퍼를 거쳐 배치로 저장됨
    assert!(!store.price_rows().is_empty());

    // 상태 요약 파일이 작성됨
    let raw = std::fs::read_to_string(&status_path).expect("status file written");
    let summary: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(!summary["entries"].as_array().unwrap().is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("engine shut down in time")
        .unwrap();

    let _ = std::fs::remove_file(&status_path);
}

/// 희망 목록에서 제거된 계좌의 watcher가 중지되고 상태가 정리된다.
#[tokio::test(flavor = "multi_thread")]
async fn engine_removes_undesired_accounts() {
    let gateway = SimGateway::with_auto_events(Duration::from_millis(20));
    let store = Arc::new(MemorySyncStore::new());
    let provider = StaticAccountsProvider::new(vec![account("alpha", "binance")]);

    let mut config = fast_config();
    config.status.path = std::env::temp_dir().join(format!(
        "sync-engine-remove-{}.json",
        std::process::id()
    ));

    let engine = SyncEngine::new(gateway, store.clone(), provider.clone(), config);
    let status = engine.status();
    let connections = engine.connections();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(status.mode("alpha", DataKind::Balance).is_some());

    // 계좌 제거 → 다음 조정 주기에 watcher 중지 및 상태 정리
    provider.set_accounts(vec![]);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(status.mode("alpha", DataKind::Balance).is_none());
    assert_eq!(connections.global_usage().await, 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("engine shut down in time")
        .unwrap();
}

/// 미지원 capability 계좌는 REST 폴링으로 커버되고 재기동되지 않는다.
#[tokio::test(flavor = "multi_thread")]
async fn unsupported_kind_served_by_poller() {
    let gateway = SimGateway::new();
    let alpha = account("alpha", "binance");

    // 잔고 스트리밍만 미지원
    let client = SimPrivateClient::with_capabilities(sync_exchange::StreamCapabilities {
        watch_balance: false,
        watch_positions: true,
        watch_orders: true,
    });
    gateway.register_private(&alpha, client);

    let store = Arc::new(MemorySyncStore::new());
    let provider = StaticAccountsProvider::new(vec![alpha.clone()]);

    let mut config = fast_config();
    config.status.path = std::env::temp_dir().join(format!(
        "sync-engine-unsupported-{}.json",
        std::process::id()
    ));

    let engine = SyncEngine::new(gateway, store.clone(), provider, config);
    let status = engine.status();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(400)).await;

    // 잔고는 pull로 폴러가 갱신, 포지션은 push 유지
    assert_eq!(
        status.mode("alpha", DataKind::Balance),
        Some(DeliveryMode::Pull)
    );
    assert!(store.update_count("alpha", DataKind::Balance) >= 1);
    assert_eq!(
        status.mode("alpha", DataKind::Position),
        Some(DeliveryMode::Push)
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("engine shut down in time")
        .unwrap();
}
