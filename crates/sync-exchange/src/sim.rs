//! 시뮬레이션 게이트웨이.
//!
//! 실제 거래소 없이 엔진을 구동하기 위한 게이트웨이 구현입니다:
//! - 개발/페이퍼 모드: 주기적으로 합성 이벤트와 시세 틱을 생성
//! - 테스트: 이벤트/에러 시퀀스를 스크립트로 주입
//!
//! # 사용 예제
//!
//! ```ignore
//! use sync_exchange::sim::{SimGateway, SimPrivateClient};
//!
//! let gateway = SimGateway::new();
//! let client = SimPrivateClient::new();
//! client.push_success(DataKind::Balance);
//! client.push_error(StreamError::BenignClose);
//! gateway.register_private(&account, client.clone());
//! ```

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{Account, DataKind, ExchangeId};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

use crate::error::{StreamError, StreamResult};
use crate::traits::{
    CloseNotification, Gateway, PrivateStreamClient, RestClient, SharedStreamClient,
    StreamCapabilities, StreamEvent, TickerEvent,
};

/// 시뮬레이션 계좌 스트림 클라이언트.
///
/// 스크립트 큐가 비어 있으면 자동 모드에서는 합성 이벤트를 생성하고,
/// 그렇지 않으면 다음 스크립트 항목이 들어올 때까지 대기합니다.
pub struct SimPrivateClient {
    caps: StreamCapabilities,
    auto_interval: Option<Duration>,
    script_tx: mpsc::UnboundedSender<StreamResult<StreamEvent>>,
    script_rx: AsyncMutex<mpsc::UnboundedReceiver<StreamResult<StreamEvent>>>,
    restarts: AtomicUsize,
    restart_results: Mutex<VecDeque<StreamResult<()>>>,
}

impl SimPrivateClient {
    /// 스크립트 전용 클라이언트 생성 (모든 종류 지원).
    pub fn new() -> Arc<Self> {
        Self::build(StreamCapabilities::all(), None)
    }

    /// 지원 플래그를 지정하여 생성.
    pub fn with_capabilities(caps: StreamCapabilities) -> Arc<Self> {
        Self::build(caps, None)
    }

    /// 자동 이벤트 생성 모드로 생성 (개발/페이퍼 모드용).
    pub fn with_auto_events(interval: Duration) -> Arc<Self> {
        Self::build(StreamCapabilities::all(), Some(interval))
    }

    fn build(caps: StreamCapabilities, auto_interval: Option<Duration>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            caps,
            auto_interval,
            script_tx: tx,
            script_rx: AsyncMutex::new(rx),
            restarts: AtomicUsize::new(0),
            restart_results: Mutex::new(VecDeque::new()),
        })
    }

    /// 스크립트 항목 주입.
    pub fn push(&self, item: StreamResult<StreamEvent>) {
        let _ = self.script_tx.send(item);
    }

    /// 빈 스냅샷 성공 이벤트 주입.
    pub fn push_success(&self, kind: DataKind) {
        let event = match kind {
            DataKind::Balance => StreamEvent::Balance(vec![]),
            DataKind::Position => StreamEvent::Positions(vec![]),
            DataKind::Order => StreamEvent::Orders(vec![]),
        };
        self.push(Ok(event));
    }

    /// 에러 주입.
    pub fn push_error(&self, err: StreamError) {
        self.push(Err(err));
    }

    /// 다음 `restart()` 호출의 결과 지정 (기본: 성공).
    pub fn queue_restart_result(&self, result: StreamResult<()>) {
        self.restart_results.lock().unwrap().push_back(result);
    }

    /// 지금까지의 `restart()` 호출 횟수.
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    fn synthetic_event(kind: DataKind) -> StreamEvent {
        match kind {
            DataKind::Balance => StreamEvent::Balance(vec![]),
            DataKind::Position => StreamEvent::Positions(vec![]),
            DataKind::Order => StreamEvent::Orders(vec![]),
        }
    }

    async fn next_event(&self, kind: DataKind) -> StreamResult<StreamEvent> {
        let mut rx = self.script_rx.lock().await;

        if let Some(interval) = self.auto_interval {
            // 자동 모드: 스크립트 우선, 없으면 합성 이벤트
            match rx.try_recv() {
                Ok(item) => item,
                Err(_) => {
                    tokio::time::sleep(interval).await;
                    Ok(Self::synthetic_event(kind))
                }
            }
        } else {
            // 스크립트 모드: 항목이 들어올 때까지 대기
            match rx.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    fn extract(event: StreamResult<StreamEvent>, kind: DataKind) -> StreamResult<StreamEvent> {
        match event {
            Ok(ev) if ev.kind() == kind => Ok(ev),
            Ok(ev) => Err(StreamError::Unknown(format!(
                "scripted event kind mismatch: expected {}, got {}",
                kind,
                ev.kind()
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PrivateStreamClient for SimPrivateClient {
    fn capabilities(&self) -> StreamCapabilities {
        self.caps
    }

    async fn watch_balance(&self) -> StreamResult<Vec<sync_core::AssetBalance>> {
        let event = Self::extract(self.next_event(DataKind::Balance).await, DataKind::Balance)?;
        match event {
            StreamEvent::Balance(balances) => Ok(balances),
            _ => unreachable!(),
        }
    }

    async fn watch_positions(&self) -> StreamResult<Vec<sync_core::PositionSnapshot>> {
        let event = Self::extract(self.next_event(DataKind::Position).await, DataKind::Position)?;
        match event {
            StreamEvent::Positions(positions) => Ok(positions),
            _ => unreachable!(),
        }
    }

    async fn watch_orders(&self) -> StreamResult<Vec<sync_core::OrderSnapshot>> {
        let event = Self::extract(self.next_event(DataKind::Order).await, DataKind::Order)?;
        match event {
            StreamEvent::Orders(orders) => Ok(orders),
            _ => unreachable!(),
        }
    }

    async fn restart(&self) -> StreamResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.restart_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// 시뮬레이션 공용 시세 스트림 클라이언트.
pub struct SimSharedClient {
    track_limit: Option<usize>,
    auto_interval: Option<Duration>,
    subscribed: Mutex<HashSet<String>>,
    subscribe_calls: Mutex<Vec<Vec<String>>>,
    subscribe_failures: Mutex<VecDeque<StreamError>>,
    tick_tx: mpsc::UnboundedSender<StreamResult<Vec<TickerEvent>>>,
    tick_rx: AsyncMutex<mpsc::UnboundedReceiver<StreamResult<Vec<TickerEvent>>>>,
    // 자동 모드 랜덤워크 가격 (basis point 단위, scale 4)
    prices_bp: Mutex<HashMap<String, i64>>,
}

impl SimSharedClient {
    /// 스크립트 전용 클라이언트 생성.
    pub fn new() -> Arc<Self> {
        Self::build(None, None)
    }

    /// 계좌 추적 한도를 지정하여 생성.
    pub fn with_track_limit(limit: usize) -> Arc<Self> {
        Self::build(Some(limit), None)
    }

    /// 자동 틱 생성 모드로 생성.
    pub fn with_auto_ticks(interval: Duration) -> Arc<Self> {
        Self::build(None, Some(interval))
    }

    fn build(track_limit: Option<usize>, auto_interval: Option<Duration>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            track_limit,
            auto_interval,
            subscribed: Mutex::new(HashSet::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            subscribe_failures: Mutex::new(VecDeque::new()),
            tick_tx: tx,
            tick_rx: AsyncMutex::new(rx),
            prices_bp: Mutex::new(HashMap::new()),
        })
    }

    /// 틱 배치 주입.
    pub fn push_ticks(&self, ticks: Vec<TickerEvent>) {
        let _ = self.tick_tx.send(Ok(ticks));
    }

    /// 틱 스트림 에러 주입.
    pub fn push_tick_error(&self, err: StreamError) {
        let _ = self.tick_tx.send(Err(err));
    }

    /// 다음 `subscribe()` 호출을 실패시킴.
    pub fn queue_subscribe_failure(&self, err: StreamError) {
        self.subscribe_failures.lock().unwrap().push_back(err);
    }

    /// 지금까지의 구독 호출 묶음들.
    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    /// 현재 구독된 심볼 집합.
    pub fn subscribed(&self) -> HashSet<String> {
        self.subscribed.lock().unwrap().clone()
    }

    fn synthetic_ticks(&self) -> Vec<TickerEvent> {
        let symbols: Vec<String> = self.subscribed.lock().unwrap().iter().cloned().collect();
        let mut prices = self.prices_bp.lock().unwrap();
        let mut rng = rand::thread_rng();

        symbols
            .into_iter()
            .map(|symbol| {
                let bp = prices.entry(symbol.clone()).or_insert(10_000_0000);
                *bp += rng.gen_range(-500..=500);
                TickerEvent {
                    symbol,
                    price: Decimal::new(*bp, 4),
                    timestamp: Utc::now(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl SharedStreamClient for SimSharedClient {
    async fn subscribe(&self, symbols: &[String]) -> StreamResult<()> {
        self.subscribe_calls.lock().unwrap().push(symbols.to_vec());

        if let Some(err) = self.subscribe_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut subscribed = self.subscribed.lock().unwrap();
        for symbol in symbols {
            // 중복 구독은 성공으로 처리
            subscribed.insert(symbol.clone());
        }
        Ok(())
    }

    async fn watch_tickers(&self) -> StreamResult<Vec<TickerEvent>> {
        let mut rx = self.tick_rx.lock().await;

        if let Some(interval) = self.auto_interval {
            match rx.try_recv() {
                Ok(item) => item,
                Err(_) => {
                    tokio::time::sleep(interval).await;
                    Ok(self.synthetic_ticks())
                }
            }
        } else {
            match rx.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    fn account_track_limit(&self) -> Option<usize> {
        self.track_limit
    }
}

/// 시뮬레이션 REST 클라이언트.
///
/// 항상 빈 스냅샷을 반환하며, 테스트를 위해 호출 횟수와 인위적 지연을
/// 설정할 수 있습니다.
pub struct SimRestClient {
    delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl SimRestClient {
    /// 새 REST 클라이언트 생성.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: Mutex::new(Duration::ZERO),
            fetches: AtomicUsize::new(0),
        })
    }

    /// 각 조회에 인위적 지연 설정 (과부하 신호 테스트용).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// 지금까지의 조회 횟수.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn simulate_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RestClient for SimRestClient {
    async fn fetch_balances(&self, _account: &Account) -> StreamResult<Vec<sync_core::AssetBalance>> {
        self.simulate_fetch().await;
        Ok(vec![])
    }

    async fn fetch_positions(
        &self,
        _account: &Account,
    ) -> StreamResult<Vec<sync_core::PositionSnapshot>> {
        self.simulate_fetch().await;
        Ok(vec![])
    }

    async fn fetch_orders(&self, _account: &Account) -> StreamResult<Vec<sync_core::OrderSnapshot>> {
        self.simulate_fetch().await;
        Ok(vec![])
    }
}

#[derive(Default)]
struct SimGatewayState {
    privates: HashMap<(ExchangeId, String), Arc<SimPrivateClient>>,
    shareds: HashMap<ExchangeId, Arc<SimSharedClient>>,
    fail_private: HashSet<String>,
    private_opens: usize,
    closed_privates: Vec<String>,
    closed_shareds: Vec<ExchangeId>,
}

/// 시뮬레이션 게이트웨이.
///
/// 등록되지 않은 클라이언트 요청은 자동 모드 여부에 따라 합성
/// 클라이언트를 생성하거나 스크립트 클라이언트를 새로 만듭니다.
pub struct SimGateway {
    auto_interval: Option<Duration>,
    state: Mutex<SimGatewayState>,
    close_tx: broadcast::Sender<CloseNotification>,
}

impl SimGateway {
    /// 스크립트 전용 게이트웨이 생성.
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// 자동 이벤트 생성 게이트웨이 생성 (개발/페이퍼 모드).
    pub fn with_auto_events(interval: Duration) -> Arc<Self> {
        Self::build(Some(interval))
    }

    fn build(auto_interval: Option<Duration>) -> Arc<Self> {
        let (close_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            auto_interval,
            state: Mutex::new(SimGatewayState::default()),
            close_tx,
        })
    }

    /// 계좌 클라이언트 사전 등록 (테스트 스크립팅용).
    pub fn register_private(&self, account: &Account, client: Arc<SimPrivateClient>) {
        self.state
            .lock()
            .unwrap()
            .privates
            .insert((account.exchange.clone(), account.name.clone()), client);
    }

    /// 공용 클라이언트 사전 등록.
    pub fn register_shared(&self, exchange: &ExchangeId, client: Arc<SimSharedClient>) {
        self.state
            .lock()
            .unwrap()
            .shareds
            .insert(exchange.clone(), client);
    }

    /// 이후 해당 계좌의 클라이언트 생성을 실패시킴.
    pub fn fail_private_for(&self, account_name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_private
            .insert(account_name.to_string());
    }

    /// 게이트웨이 측 종료 알림 발행 (테스트 훅).
    pub fn notify_close(&self, exchange: &ExchangeId, account_name: &str) {
        let _ = self.close_tx.send(CloseNotification {
            exchange: exchange.clone(),
            account: account_name.to_string(),
        });
    }

    /// 지금까지 생성된 계좌 클라이언트 수.
    pub fn private_open_count(&self) -> usize {
        self.state.lock().unwrap().private_opens
    }

    /// 종료된 계좌 클라이언트 이름들 (순서대로).
    pub fn closed_privates(&self) -> Vec<String> {
        self.state.lock().unwrap().closed_privates.clone()
    }

    /// 종료된 공용 클라이언트 거래소들.
    pub fn closed_shareds(&self) -> Vec<ExchangeId> {
        self.state.lock().unwrap().closed_shareds.clone()
    }
}

#[async_trait]
impl Gateway for SimGateway {
    async fn connect(&self, _exchange: &ExchangeId) -> StreamResult<()> {
        Ok(())
    }

    async fn shared_stream_client(
        &self,
        exchange: &ExchangeId,
    ) -> StreamResult<Arc<dyn SharedStreamClient>> {
        let mut state = self.state.lock().unwrap();
        let client = state
            .shareds
            .entry(exchange.clone())
            .or_insert_with(|| match self.auto_interval {
                Some(interval) => SimSharedClient::with_auto_ticks(interval),
                None => SimSharedClient::new(),
            })
            .clone();
        Ok(client)
    }

    async fn private_stream_client(
        &self,
        account: &Account,
    ) -> StreamResult<Arc<dyn PrivateStreamClient>> {
        let mut state = self.state.lock().unwrap();

        if state.fail_private.contains(&account.name) {
            return Err(StreamError::Network(format!(
                "connection refused for {}",
                account
            )));
        }

        let auto = self.auto_interval;
        let client = state
            .privates
            .entry((account.exchange.clone(), account.name.clone()))
            .or_insert_with(|| match auto {
                Some(interval) => SimPrivateClient::with_auto_events(interval),
                None => SimPrivateClient::new(),
            })
            .clone();
        state.private_opens += 1;
        Ok(client)
    }

    async fn close_private_stream_client(&self, account: &Account) {
        self.state
            .lock()
            .unwrap()
            .closed_privates
            .push(account.name.clone());
    }

    async fn close_shared_stream_client(&self, exchange: &ExchangeId) {
        let mut state = self.state.lock().unwrap();
        state.shareds.remove(exchange);
        state.closed_shareds.push(exchange.clone());
    }

    fn subscribe_close_notifications(&self) -> broadcast::Receiver<CloseNotification> {
        self.close_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("alpha", ExchangeId::new("binance"), "cred")
    }

    #[tokio::test]
    async fn test_scripted_private_client_events() {
        let client = SimPrivateClient::new();
        client.push_success(DataKind::Balance);
        client.push_error(StreamError::BenignClose);

        assert!(client.watch_balance().await.is_ok());
        assert!(matches!(
            client.watch_balance().await,
            Err(StreamError::BenignClose)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_success() {
        let client = SimSharedClient::new();
        let symbols = vec!["BTC/USDT".to_string()];
        client.subscribe(&symbols).await.unwrap();
        client.subscribe(&symbols).await.unwrap();
        assert_eq!(client.subscribed().len(), 1);
        assert_eq!(client.subscribe_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_fail_private() {
        let gateway = SimGateway::new();
        gateway.fail_private_for("alpha");
        let result = gateway.private_stream_client(&account()).await;
        assert!(matches!(result, Err(StreamError::Network(_))));
    }

    #[tokio::test]
    async fn test_close_notification_channel() {
        let gateway = SimGateway::new();
        let mut rx = gateway.subscribe_close_notifications();
        gateway.notify_close(&ExchangeId::new("binance"), "alpha");

        let note = rx.recv().await.unwrap();
        assert_eq!(note.account, "alpha");
        assert_eq!(note.exchange.as_str(), "binance");
    }
}
