//! 거래소 백오프 및 강등 조정자.
//!
//! 두 가지 횡단 정책을 담당합니다:
//!
//! # 거래소 전체 백오프
//!
//! 슬라이딩 윈도우 안의 에러 수가 임계치에 도달하면 거래소가 일정 시간
//! 백오프에 들어갑니다. 백오프 중에는 REST 폴러가 해당 거래소를 완전히
//! 건너뜁니다. 임계치를 넘게 오래 걸린 REST 호출도 과부하 신호로 간주해
//! 같은 백오프를 유발합니다.
//!
//! # 네트워크 에러 강등 프로토콜
//!
//! 거래소별 강등 윈도우 안에서는 최대 한 계좌만 REST로 강등됩니다.
//! 윈도우에 이미 강등 이력이 있으면 이후 에러 계좌는 강등하지 않고
//! 클라이언트 재획득 후 스트리밍을 유지합니다. 거래소 측 일시 장애가
//! 모든 계좌를 동시에 강등시키는 것을 방지합니다.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sync_core::ExchangeId;

use crate::config::BackoffConfig;

/// 네트워크 에러에 대한 강등 판정.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionDecision {
    /// 이 계좌를 REST로 강등 (클라이언트 종료, watcher 종료)
    Demote,
    /// 강등하지 않음 (클라이언트 재획득 후 스트리밍 유지)
    Retry,
}

#[derive(Default)]
struct ExchangeBackoff {
    errors: VecDeque<Instant>,
    backoff_until: Option<Instant>,
    demoted: HashMap<String, Instant>,
}

/// 백오프/강등 조정자.
///
/// 모든 watcher와 폴러가 공유하는 단일 인스턴스로 주입됩니다.
pub struct BackoffCoordinator {
    config: BackoffConfig,
    state: Mutex<HashMap<ExchangeId, ExchangeBackoff>>,
}

impl BackoffCoordinator {
    /// 새 조정자를 생성합니다.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// 거래소 에러 기록.
    ///
    /// 윈도우 내 에러 수가 임계치에 도달하면 백오프에 진입합니다.
    pub fn record_error(&self, exchange: &ExchangeId) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(exchange.clone()).or_default();
        let now = Instant::now();

        while let Some(front) = entry.errors.front() {
            if now.duration_since(*front) > self.config.error_window() {
                entry.errors.pop_front();
            } else {
                break;
            }
        }
        entry.errors.push_back(now);

        let already_backed_off = entry
            .backoff_until
            .is_some_and(|until| now < until);
        if !already_backed_off && entry.errors.len() as u32 >= self.config.error_threshold {
            entry.backoff_until = Some(now + self.config.backoff_duration());
            entry.errors.clear();
            tracing::warn!(
                exchange = %exchange,
                threshold = self.config.error_threshold,
                backoff_ms = self.config.backoff_ms,
                "Error threshold reached, exchange entering backoff"
            );
        }
    }

    /// 백오프 즉시 진입 (구독 거부, 과부하 신호 등).
    pub fn trigger_backoff(&self, exchange: &ExchangeId, reason: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(exchange.clone()).or_default();
        let now = Instant::now();
        let until = now + self.config.backoff_duration();

        // 이미 더 긴 백오프가 걸려 있으면 유지
        if entry.backoff_until.map_or(true, |current| current < until) {
            entry.backoff_until = Some(until);
            tracing::warn!(
                exchange = %exchange,
                reason,
                backoff_ms = self.config.backoff_ms,
                "Exchange entering backoff"
            );
        }
    }

    /// REST 호출 소요 시간 보고.
    ///
    /// 임계치를 넘으면 과부하 신호로 간주해 백오프를 유발합니다.
    pub fn record_rest_elapsed(&self, exchange: &ExchangeId, elapsed: Duration) {
        if elapsed >= self.config.slow_rest_threshold() {
            self.trigger_backoff(exchange, "slow rest operation");
        }
    }

    /// 거래소가 현재 백오프 중인지 확인.
    pub fn is_backed_off(&self, exchange: &ExchangeId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .get(exchange)
            .and_then(|e| e.backoff_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// 남은 백오프 시간 (백오프 중이 아니면 None).
    pub fn backoff_remaining(&self, exchange: &ExchangeId) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .get(exchange)
            .and_then(|e| e.backoff_until)
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// 현재 백오프 중인 거래소와 남은 시간.
    pub fn backed_off_exchanges(&self) -> Vec<(ExchangeId, Duration)> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .iter()
            .filter_map(|(exchange, e)| {
                e.backoff_until
                    .and_then(|until| until.checked_duration_since(now))
                    .filter(|d| !d.is_zero())
                    .map(|d| (exchange.clone(), d))
            })
            .collect()
    }

    /// 네트워크 에러 계좌의 강등 여부 판정.
    ///
    /// 거래소별 잠금 아래에서 수행되며, 강등 윈도우당 최대 한 계좌만
    /// `Demote`를 받습니다.
    pub fn try_demote(&self, exchange: &ExchangeId, account_name: &str) -> DemotionDecision {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(exchange.clone()).or_default();
        let now = Instant::now();

        entry
            .demoted
            .retain(|_, at| now.duration_since(*at) <= self.config.demotion_window());

        if entry.demoted.is_empty() {
            entry.demoted.insert(account_name.to_string(), now);
            tracing::info!(
                exchange = %exchange,
                account = account_name,
                "Network error, demoting account to rest polling"
            );
            DemotionDecision::Demote
        } else {
            tracing::info!(
                exchange = %exchange,
                account = account_name,
                "Recent demotion in window, keeping account on stream"
            );
            DemotionDecision::Retry
        }
    }
}

/// 지터가 적용된 지수 백오프 지연.
///
/// `attempt`는 1부터 시작하며, `base * 2^(attempt-1)`을 `max`로 제한한
/// 값에 0.8~1.2배 지터를 곱합니다.
pub fn jittered_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base
        .checked_mul(1u32 << attempt.saturating_sub(1).min(16))
        .unwrap_or(max)
        .min(max);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((exp.as_millis() as f64 * jitter) as u64)
}
