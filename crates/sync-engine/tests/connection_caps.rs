//! 연결 용량 속성 테스트.
//!
//! 동시 `request_client` 호출이 얼마나 많아도 전역/거래소별 상한을
//! 초과해 허용되는 일이 없어야 합니다.

use proptest::prelude::*;
use std::sync::Arc;
use sync_core::{Account, ExchangeId};
use sync_engine::config::ConnectionConfig;
use sync_engine::ConnectionManager;
use sync_exchange::sim::SimGateway;

fn account(name: &str, exchange: &str) -> Account {
    Account::new(name, ExchangeId::new(exchange), "cred")
}

async fn grant_count(manager: Arc<ConnectionManager>, n: usize, exchange: &str) -> usize {
    let mut handles = Vec::new();
    for i in 0..n {
        let manager = manager.clone();
        let acct = account(&format!("acct-{}", i), exchange);
        handles.push(tokio::spawn(async move {
            manager.request_client(&acct).await.is_some()
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    granted
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// N개의 동시 요청, 상한 K → 정확히 min(N, K)개만 허용.
    #[test]
    fn concurrent_requests_respect_per_exchange_cap(n in 1usize..40, cap in 1usize..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let granted = rt.block_on(async {
            let gateway = SimGateway::new();
            let manager = ConnectionManager::new(
                gateway,
                ConnectionConfig {
                    global_cap: 100,
                    per_exchange_cap: cap,
                },
            );
            grant_count(manager, n, "binance").await
        });

        prop_assert_eq!(granted, n.min(cap));
    }

    /// 여러 거래소에 걸친 동시 요청도 전역 상한을 넘지 않는다.
    #[test]
    fn concurrent_requests_respect_global_cap(
        n_a in 1usize..20,
        n_b in 1usize..20,
        global in 1usize..12,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (granted, usage) = rt.block_on(async {
            let gateway = SimGateway::new();
            let manager = ConnectionManager::new(
                gateway,
                ConnectionConfig {
                    global_cap: global,
                    per_exchange_cap: 100,
                },
            );

            let a = {
                let manager = manager.clone();
                tokio::spawn(async move { grant_count(manager, n_a, "binance").await })
            };
            let b = {
                let manager = manager.clone();
                tokio::spawn(async move { grant_count(manager, n_b, "bybit").await })
            };
            let granted = a.await.unwrap() + b.await.unwrap();
            (granted, manager.global_usage().await)
        });

        prop_assert!(granted <= global);
        prop_assert_eq!(granted, (n_a + n_b).min(global));
        prop_assert!(usage <= global);
    }
}
