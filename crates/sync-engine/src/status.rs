//! 전달 상태 레지스트리 및 요약 파일 작성기.
//!
//! (계좌, 종류)별 현재 전달 방식(push/pull)과 마지막 성공 갱신 시각을
//! 추적하고, 주기적으로 기계 판독용 JSON 요약 파일을 재작성합니다.
//! 외부 대시보드가 소비하며, 엔진 자신은 읽지 않습니다.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{DataKind, ExchangeId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffCoordinator;
use crate::config::StatusConfig;

/// 데이터 전달 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// 스트리밍 구독
    Push,
    /// 주기적 REST 폴링
    Pull,
}

#[derive(Debug, Clone)]
struct EntryState {
    mode: DeliveryMode,
    last_update: Option<DateTime<Utc>>,
}

/// 전달 상태 레지스트리.
///
/// watcher와 폴러가 공유하며, 폴러는 push로 전달 중인 항목을 건너뛰기
/// 위해 조회합니다.
#[derive(Default)]
pub struct StatusRegistry {
    inner: Mutex<HashMap<(String, DataKind), EntryState>>,
}

impl StatusRegistry {
    /// 새 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// (계좌, 종류)의 전달 방식 설정.
    pub fn set_mode(&self, account_name: &str, kind: DataKind, mode: DeliveryMode) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry((account_name.to_string(), kind))
            .and_modify(|e| e.mode = mode)
            .or_insert(EntryState {
                mode,
                last_update: None,
            });
    }

    /// 성공적인 저장 완료 기록.
    pub fn record_update(&self, account_name: &str, kind: DataKind) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry((account_name.to_string(), kind))
            .and_modify(|e| e.last_update = Some(Utc::now()))
            .or_insert(EntryState {
                mode: DeliveryMode::Pull,
                last_update: Some(Utc::now()),
            });
    }

    /// 현재 전달 방식 조회.
    pub fn mode(&self, account_name: &str, kind: DataKind) -> Option<DeliveryMode> {
        self.inner
            .lock()
            .unwrap()
            .get(&(account_name.to_string(), kind))
            .map(|e| e.mode)
    }

    /// 마지막 성공 갱신 시각 조회.
    pub fn last_update(&self, account_name: &str, kind: DataKind) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .get(&(account_name.to_string(), kind))
            .and_then(|e| e.last_update)
    }

    /// 계좌의 모든 항목 제거 (계좌가 더 이상 희망 목록에 없을 때).
    pub fn remove_account(&self, account_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .retain(|(name, _), _| name != account_name);
    }

    /// 요약 항목 스냅샷.
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        let now = Utc::now();
        let mut entries: Vec<StatusEntry> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|((account, kind), state)| StatusEntry {
                account: account.clone(),
                kind: *kind,
                mode: state.mode,
                last_update: state.last_update,
                age_secs: state
                    .last_update
                    .map(|at| (now - at).num_seconds().max(0)),
            })
            .collect();
        entries.sort_by(|a, b| (&a.account, a.kind_order()).cmp(&(&b.account, b.kind_order())));
        entries
    }
}

/// 요약 파일의 (계좌, 종류) 항목.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    /// 계좌 이름
    pub account: String,
    /// 데이터 종류
    pub kind: DataKind,
    /// 현재 전달 방식
    pub mode: DeliveryMode,
    /// 마지막 성공 갱신 시각
    pub last_update: Option<DateTime<Utc>>,
    /// 마지막 갱신 이후 경과 시간 (초)
    pub age_secs: Option<i64>,
}

impl StatusEntry {
    fn kind_order(&self) -> u8 {
        match self.kind {
            DataKind::Balance => 0,
            DataKind::Position => 1,
            DataKind::Order => 2,
        }
    }
}

/// 요약 파일의 백오프 항목.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffEntry {
    /// 거래소
    pub exchange: ExchangeId,
    /// 남은 백오프 시간 (초)
    pub remaining_secs: u64,
}

/// 요약 파일 전체 구조.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    /// 작성 시각
    pub generated_at: DateTime<Utc>,
    /// (계좌, 종류)별 상태
    pub entries: Vec<StatusEntry>,
    /// 백오프 중인 거래소
    pub backoffs: Vec<BackoffEntry>,
}

/// 요약 파일 작성 태스크.
pub struct StatusWriter {
    registry: Arc<StatusRegistry>,
    backoff: Arc<BackoffCoordinator>,
    path: PathBuf,
    interval: Duration,
}

impl StatusWriter {
    /// 새 작성기를 생성합니다.
    pub fn new(
        registry: Arc<StatusRegistry>,
        backoff: Arc<BackoffCoordinator>,
        config: &StatusConfig,
    ) -> Self {
        Self {
            registry,
            backoff,
            path: config.path.clone(),
            interval: config.interval(),
        }
    }

    /// 작성 루프 실행.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write_once() {
                        warn!(path = %self.path.display(), error = %e, "상태 요약 작성 실패");
                    }
                }
            }
        }

        // 종료 직전 마지막 스냅샷
        if let Err(e) = self.write_once() {
            warn!(path = %self.path.display(), error = %e, "종료 시 상태 요약 작성 실패");
        }
    }

    /// 요약 1회 작성 (임시 파일 후 원자적 rename).
    pub fn write_once(&self) -> std::io::Result<()> {
        let summary = StatusSummary {
            generated_at: Utc::now(),
            entries: self.registry.snapshot(),
            backoffs: self
                .backoff
                .backed_off_exchanges()
                .into_iter()
                .map(|(exchange, remaining)| BackoffEntry {
                    exchange,
                    remaining_secs: remaining.as_secs(),
                })
                .collect(),
        };

        let json = serde_json::to_vec_pretty(&summary)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(entries = summary.entries.len(), "상태 요약 작성 완료");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_transitions() {
        let registry = StatusRegistry::new();
        registry.set_mode("alpha", DataKind::Balance, DeliveryMode::Pull);
        assert_eq!(
            registry.mode("alpha", DataKind::Balance),
            Some(DeliveryMode::Pull)
        );

        registry.set_mode("alpha", DataKind::Balance, DeliveryMode::Push);
        assert_eq!(
            registry.mode("alpha", DataKind::Balance),
            Some(DeliveryMode::Push)
        );
    }

    #[test]
    fn test_record_update_sets_timestamp() {
        let registry = StatusRegistry::new();
        assert!(registry.last_update("alpha", DataKind::Order).is_none());

        registry.record_update("alpha", DataKind::Order);
        assert!(registry.last_update("alpha", DataKind::Order).is_some());
    }

    #[test]
    fn test_remove_account() {
        let registry = StatusRegistry::new();
        registry.set_mode("alpha", DataKind::Balance, DeliveryMode::Push);
        registry.set_mode("beta", DataKind::Balance, DeliveryMode::Push);

        registry.remove_account("alpha");
        assert!(registry.mode("alpha", DataKind::Balance).is_none());
        assert!(registry.mode("beta", DataKind::Balance).is_some());
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = StatusRegistry::new();
        registry.set_mode("beta", DataKind::Order, DeliveryMode::Pull);
        registry.set_mode("alpha", DataKind::Position, DeliveryMode::Push);
        registry.set_mode("alpha", DataKind::Balance, DeliveryMode::Push);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].account, "alpha");
        assert_eq!(snapshot[0].kind, DataKind::Balance);
        assert_eq!(snapshot[2].account, "beta");
    }
}
