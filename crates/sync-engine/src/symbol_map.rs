//! 거래소별 가격 구독 심볼 집합.
//!
//! 거래소에 속한 모든 계좌의 보유 포지션 심볼 합집합을 유지합니다.
//! 재구성은 계좌별 포지션 조회가 필요하므로 틱마다가 아니라 거래소별
//! 최소 간격으로만 수행합니다.
//!
//! 거래소가 한 스트리밍 토픽으로 추적 가능한 계좌 수에 하드 리밋을
//! 두는 경우, 계좌 목록을 이름순 안정 prefix로 잘라내고 허용/차단
//! 집합이 실제로 바뀔 때만 로그를 남깁니다. 제외된 계좌는 가격 push를
//! 받지 못하며, 자신의 잔고/포지션 흐름과 REST 폴러로만 커버됩니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{Account, ExchangeId};
use sync_data::SyncStore;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 거래소 심볼 → [(계좌, 내부 심볼)] 매핑 스냅샷.
pub type SymbolEntries = Arc<HashMap<String, Vec<(String, String)>>>;

/// 내부 심볼을 거래소 스트림 심볼로 변환.
///
/// 예: "BTC/USDT" → "BTCUSDT"
pub fn to_exchange_symbol(internal: &str) -> String {
    internal.replace('/', "").to_uppercase()
}

struct ExchangeEntry {
    accounts: Vec<Account>,
    track_limit: Option<usize>,
    entries: SymbolEntries,
    rebuilt_at: Option<Instant>,
    prev_allowed: Vec<String>,
    prev_blocked: Vec<String>,
}

impl ExchangeEntry {
    fn new() -> Self {
        Self {
            accounts: Vec::new(),
            track_limit: None,
            entries: Arc::new(HashMap::new()),
            rebuilt_at: None,
            prev_allowed: Vec::new(),
            prev_blocked: Vec::new(),
        }
    }
}

/// 거래소별 심볼 매핑 레지스트리.
///
/// 조정 루프가 계좌 목록을 갱신하고, 가격 watcher와 조정 루프 양쪽이
/// 스로틀된 재구성을 요청합니다.
pub struct SymbolMapRegistry {
    store: Arc<dyn SyncStore>,
    rebuild_interval: Duration,
    inner: Mutex<HashMap<ExchangeId, ExchangeEntry>>,
}

impl SymbolMapRegistry {
    /// 새 레지스트리를 생성합니다.
    pub fn new(store: Arc<dyn SyncStore>, rebuild_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            rebuild_interval,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// 거래소의 희망 계좌 목록 갱신 (이름순 정렬 저장).
    pub async fn set_accounts(&self, exchange: &ExchangeId, mut accounts: Vec<Account>) {
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entry(exchange.clone())
            .or_insert_with(ExchangeEntry::new);
        if entry.accounts != accounts {
            entry.accounts = accounts;
            // 계좌 구성이 바뀌면 다음 요청에서 즉시 재구성
            entry.rebuilt_at = None;
        }
    }

    /// 거래소의 계좌 추적 하드 리밋 설정 (가격 watcher가 클라이언트에서 조회).
    pub async fn set_track_limit(&self, exchange: &ExchangeId, limit: Option<usize>) {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entry(exchange.clone())
            .or_insert_with(ExchangeEntry::new);
        if entry.track_limit != limit {
            entry.track_limit = limit;
            entry.rebuilt_at = None;
        }
    }

    /// 심볼 매핑 조회, 최소 간격이 지났으면 재구성.
    pub async fn rebuild_if_stale(&self, exchange: &ExchangeId) -> SymbolEntries {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entry(exchange.clone())
            .or_insert_with(ExchangeEntry::new);

        let fresh = entry
            .rebuilt_at
            .is_some_and(|at| at.elapsed() < self.rebuild_interval);
        if fresh {
            return entry.entries.clone();
        }

        // 추적 한도 적용: 이름순 안정 prefix
        let cutoff = entry.track_limit.unwrap_or(entry.accounts.len());
        let (allowed, blocked) = entry
            .accounts
            .split_at(cutoff.min(entry.accounts.len()));
        let allowed_names: Vec<String> = allowed.iter().map(|a| a.name.clone()).collect();
        let blocked_names: Vec<String> = blocked.iter().map(|a| a.name.clone()).collect();

        // 허용/차단 집합이 실제로 바뀔 때만 로그
        if (allowed_names != entry.prev_allowed || blocked_names != entry.prev_blocked)
            && !blocked_names.is_empty()
        {
            info!(
                exchange = %exchange,
                allowed = allowed_names.len(),
                blocked = ?blocked_names,
                "Account track limit applied, trimming price subscriptions"
            );
        }
        entry.prev_allowed = allowed_names;
        entry.prev_blocked = blocked_names;

        let mut map: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for account in allowed {
            match self.store.open_position_symbols(account).await {
                Ok(symbols) => {
                    for symbol in symbols {
                        map.entry(to_exchange_symbol(&symbol))
                            .or_default()
                            .push((account.name.clone(), symbol));
                    }
                }
                Err(e) => {
                    warn!(
                        account = %account,
                        error = %e,
                        "Open position lookup failed during symbol rebuild"
                    );
                }
            }
        }

        entry.entries = Arc::new(map);
        entry.rebuilt_at = Some(Instant::now());
        entry.entries.clone()
    }

    /// 거래소가 현재 구독할 심볼을 갖고 있는지 확인 (스냅샷 기준).
    pub async fn has_symbols(&self, exchange: &ExchangeId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .get(exchange)
            .map(|e| !e.entries.is_empty())
            .unwrap_or(false)
    }

    /// 거래소 항목 제거 (거래소에 더 이상 계좌가 없을 때).
    pub async fn remove_exchange(&self, exchange: &ExchangeId) {
        self.inner.lock().await.remove(exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_data::MemorySyncStore;

    fn account(name: &str) -> Account {
        Account::new(name, ExchangeId::new("binance"), "cred")
    }

    fn exchange() -> ExchangeId {
        ExchangeId::new("binance")
    }

    #[test]
    fn test_to_exchange_symbol() {
        assert_eq!(to_exchange_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(to_exchange_symbol("eth/usdt"), "ETHUSDT");
    }

    #[tokio::test]
    async fn test_rebuild_unions_account_symbols() {
        let store = Arc::new(MemorySyncStore::new());
        store.set_open_symbols("alpha", &["BTC/USDT", "ETH/USDT"]);
        store.set_open_symbols("beta", &["BTC/USDT", "SOL/USDT"]);

        let registry = SymbolMapRegistry::new(store, Duration::from_secs(60));
        registry
            .set_accounts(&exchange(), vec![account("alpha"), account("beta")])
            .await;

        let entries = registry.rebuild_if_stale(&exchange()).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.get("BTCUSDT").unwrap().len(), 2);
        assert_eq!(entries.get("SOLUSDT").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_throttled() {
        let store = Arc::new(MemorySyncStore::new());
        store.set_open_symbols("alpha", &["BTC/USDT"]);

        let registry = SymbolMapRegistry::new(store.clone(), Duration::from_secs(60));
        registry
            .set_accounts(&exchange(), vec![account("alpha")])
            .await;

        let first = registry.rebuild_if_stale(&exchange()).await;
        // 간격 내 재요청은 같은 스냅샷 재사용 (포지션 변경 미반영)
        store.set_open_symbols("alpha", &["ETH/USDT"]);
        let second = registry.rebuild_if_stale(&exchange()).await;

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_track_limit_stable_prefix() {
        let store = Arc::new(MemorySyncStore::new());
        store.set_open_symbols("alpha", &["BTC/USDT"]);
        store.set_open_symbols("beta", &["ETH/USDT"]);
        store.set_open_symbols("gamma", &["SOL/USDT"]);

        let registry = SymbolMapRegistry::new(store, Duration::from_secs(60));
        // 등록 순서와 무관하게 이름순 prefix
        registry
            .set_accounts(
                &exchange(),
                vec![account("gamma"), account("alpha"), account("beta")],
            )
            .await;
        registry.set_track_limit(&exchange(), Some(2)).await;

        let entries = registry.rebuild_if_stale(&exchange()).await;
        assert!(entries.contains_key("BTCUSDT"));
        assert!(entries.contains_key("ETHUSDT"));
        assert!(!entries.contains_key("SOLUSDT"));
    }

    #[tokio::test]
    async fn test_account_change_forces_rebuild() {
        let store = Arc::new(MemorySyncStore::new());
        store.set_open_symbols("alpha", &["BTC/USDT"]);
        store.set_open_symbols("beta", &["ETH/USDT"]);

        let registry = SymbolMapRegistry::new(store, Duration::from_secs(60));
        registry
            .set_accounts(&exchange(), vec![account("alpha")])
            .await;
        let first = registry.rebuild_if_stale(&exchange()).await;
        assert_eq!(first.len(), 1);

        registry
            .set_accounts(&exchange(), vec![account("alpha"), account("beta")])
            .await;
        let second = registry.rebuild_if_stale(&exchange()).await;
        assert_eq!(second.len(), 2);
    }
}
