//! 폴링 사이클 통계.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// REST 폴링 사이클 통계.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollStats {
    /// 폴링 수행 횟수
    pub polled: usize,
    /// 건너뛴 횟수 (스트림이 담당 중)
    pub skipped: usize,
    /// 에러 횟수
    pub errors: usize,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl PollStats {
    /// 새 통계 객체 생성.
    pub fn new() -> Self {
        Self::default()
    }

    /// 사이클 요약 로그 출력.
    pub fn log_summary(&self, exchange: &str) {
        tracing::debug!(
            exchange,
            polled = self.polled,
            skipped = self.skipped,
            errors = self.errors,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "폴링 사이클 완료"
        );
    }
}
