//! 환경변수 기반 엔진 설정.

use std::path::PathBuf;
use std::time::Duration;

/// 엔진 전체 설정.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// 연결 용량 설정
    pub connection: ConnectionConfig,
    /// 계좌 watcher 설정
    pub watcher: WatcherConfig,
    /// 가격 watcher 설정
    pub price: PriceConfig,
    /// 가격 버퍼 설정
    pub buffer: BufferConfig,
    /// 백오프/강등 설정
    pub backoff: BackoffConfig,
    /// REST 폴러 설정
    pub poller: PollerConfig,
    /// 조정 루프 설정
    pub reconcile: ReconcileConfig,
    /// 상태 요약 파일 설정
    pub status: StatusConfig,
}

/// 인증 스트림 연결 용량 설정.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 전체 동시 인증 연결 상한
    pub global_cap: usize,
    /// 거래소별 동시 인증 연결 상한
    pub per_exchange_cap: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            global_cap: 40,
            per_exchange_cap: 10,
        }
    }
}

/// 계좌 watcher 설정.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// 스트림 이벤트 대기 타임아웃 (밀리초)
    pub event_timeout_ms: u64,
    /// (계좌, 종류)별 최소 저장 간격 (밀리초)
    pub min_refresh_ms: u64,
    /// 재시작 플래그 해제에 필요한 연속 성공 수
    pub restart_success_threshold: u32,
    /// 클라이언트 재획득 전 대기 (밀리초)
    pub reconnect_pause_ms: u64,
    /// 알 수 없는 에러 재시도 기본 대기 (밀리초)
    pub retry_base_ms: u64,
    /// 알 수 없는 에러 재시도 최대 대기 (밀리초)
    pub retry_max_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            event_timeout_ms: 30_000,
            min_refresh_ms: 1_000,
            restart_success_threshold: 3,
            reconnect_pause_ms: 2_000,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
        }
    }
}

impl WatcherConfig {
    /// 이벤트 대기 타임아웃.
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// 최소 저장 간격.
    pub fn min_refresh(&self) -> Duration {
        Duration::from_millis(self.min_refresh_ms)
    }

    /// 재획득 전 대기.
    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }
}

/// 거래소별 가격 watcher 설정.
#[derive(Debug, Clone)]
pub struct PriceConfig {
    /// 구독 요청당 최대 심볼 수
    pub subscribe_chunk_size: usize,
    /// 심볼 집합 재구성 최소 간격 (밀리초)
    pub rebuild_interval_ms: u64,
    /// (계좌, 심볼)별 버퍼 기록 최소 간격 (밀리초)
    pub tick_throttle_ms: u64,
    /// 틱 배치 대기 타임아웃 (밀리초)
    pub event_timeout_ms: u64,
    /// 클라이언트 강제 재생성 전 연속 실패 수
    pub max_consecutive_failures: u32,
    /// 구독 거부 후 쿨다운 (밀리초, 지터 적용)
    pub cooldown_ms: u64,
    /// 일시 에러 재시도 기본 대기 (밀리초)
    pub retry_base_ms: u64,
    /// 일시 에러 재시도 최대 대기 (밀리초)
    pub retry_max_ms: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            subscribe_chunk_size: 50,
            rebuild_interval_ms: 30_000,
            tick_throttle_ms: 1_000,
            event_timeout_ms: 30_000,
            max_consecutive_failures: 5,
            cooldown_ms: 60_000,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
        }
    }
}

impl PriceConfig {
    /// 틱 배치 대기 타임아웃.
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// 심볼 집합 재구성 간격.
    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_millis(self.rebuild_interval_ms)
    }

    /// 틱 버퍼 기록 간격.
    pub fn tick_throttle(&self) -> Duration {
        Duration::from_millis(self.tick_throttle_ms)
    }

    /// 구독 거부 쿨다운.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// 가격 버퍼 설정.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// 배치 플러시 주기 (밀리초)
    pub flush_interval_ms: u64,
    /// 종료 시 최종 플러시 타임아웃 (밀리초)
    pub final_flush_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            final_flush_timeout_ms: 5_000,
        }
    }
}

impl BufferConfig {
    /// 플러시 주기.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// 최종 플러시 타임아웃.
    pub fn final_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.final_flush_timeout_ms)
    }
}

/// 거래소 백오프 및 강등 설정.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 에러 집계 슬라이딩 윈도우 (밀리초)
    pub error_window_ms: u64,
    /// 백오프 진입 에러 임계치
    pub error_threshold: u32,
    /// 백오프 유지 시간 (밀리초)
    pub backoff_ms: u64,
    /// 강등 윈도우 (밀리초, 윈도우당 1계좌만 강등)
    pub demotion_window_ms: u64,
    /// 과부하로 간주하는 REST 소요 시간 (밀리초)
    pub slow_rest_threshold_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            error_window_ms: 30_000,
            error_threshold: 6,
            backoff_ms: 60_000,
            demotion_window_ms: 60_000,
            slow_rest_threshold_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    /// 에러 윈도우.
    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }

    /// 백오프 유지 시간.
    pub fn backoff_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// 강등 윈도우.
    pub fn demotion_window(&self) -> Duration {
        Duration::from_millis(self.demotion_window_ms)
    }

    /// 과부하 REST 임계치.
    pub fn slow_rest_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_rest_threshold_ms)
    }
}

/// 공유 REST 폴러 설정.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// 폴링 사이클 간 대기 (밀리초)
    pub cycle_pause_ms: u64,
    /// 요청 간 대기 (밀리초)
    pub request_delay_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cycle_pause_ms: 10_000,
            request_delay_ms: 500,
        }
    }
}

impl PollerConfig {
    /// 사이클 간 대기.
    pub fn cycle_pause(&self) -> Duration {
        Duration::from_millis(self.cycle_pause_ms)
    }

    /// 요청 간 대기.
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

/// 조정 루프 설정.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// 조정 주기 (밀리초)
    pub interval_ms: u64,
    /// watcher 기동 간 지연 (밀리초)
    pub stagger_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stagger_ms: 500,
        }
    }
}

impl ReconcileConfig {
    /// 조정 주기.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// 기동 간 지연.
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

/// 상태 요약 파일 설정.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// 요약 파일 경로
    pub path: PathBuf,
    /// 재작성 주기 (밀리초)
    pub interval_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sync-status.json"),
            interval_ms: 10_000,
        }
    }
}

impl StatusConfig {
    /// 재작성 주기.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl EngineConfig {
    /// 환경변수에서 설정 로드 (누락 시 기본값).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            connection: ConnectionConfig {
                global_cap: env_var_parse("SYNC_GLOBAL_CLIENT_CAP", 40),
                per_exchange_cap: env_var_parse("SYNC_EXCHANGE_CLIENT_CAP", 10),
            },
            watcher: WatcherConfig {
                event_timeout_ms: env_var_parse("SYNC_WATCH_TIMEOUT_MS", 30_000),
                min_refresh_ms: env_var_parse("SYNC_MIN_REFRESH_MS", 1_000),
                restart_success_threshold: env_var_parse("SYNC_RESTART_SUCCESS_THRESHOLD", 3),
                reconnect_pause_ms: env_var_parse("SYNC_RECONNECT_PAUSE_MS", 2_000),
                retry_base_ms: env_var_parse("SYNC_RETRY_BASE_MS", 1_000),
                retry_max_ms: env_var_parse("SYNC_RETRY_MAX_MS", 30_000),
            },
            price: PriceConfig {
                subscribe_chunk_size: env_var_parse("SYNC_SUBSCRIBE_CHUNK_SIZE", 50),
                rebuild_interval_ms: env_var_parse("SYNC_SYMBOL_REBUILD_MS", 30_000),
                tick_throttle_ms: env_var_parse("SYNC_TICK_THROTTLE_MS", 1_000),
                event_timeout_ms: env_var_parse("SYNC_TICK_TIMEOUT_MS", 30_000),
                max_consecutive_failures: env_var_parse("SYNC_PRICE_MAX_FAILURES", 5),
                cooldown_ms: env_var_parse("SYNC_SUBSCRIBE_COOLDOWN_MS", 60_000),
                retry_base_ms: env_var_parse("SYNC_RETRY_BASE_MS", 1_000),
                retry_max_ms: env_var_parse("SYNC_RETRY_MAX_MS", 30_000),
            },
            buffer: BufferConfig {
                flush_interval_ms: env_var_parse("SYNC_PRICE_FLUSH_MS", 5_000),
                final_flush_timeout_ms: env_var_parse("SYNC_FINAL_FLUSH_TIMEOUT_MS", 5_000),
            },
            backoff: BackoffConfig {
                error_window_ms: env_var_parse("SYNC_ERROR_WINDOW_MS", 30_000),
                error_threshold: env_var_parse("SYNC_ERROR_THRESHOLD", 6),
                backoff_ms: env_var_parse("SYNC_BACKOFF_MS", 60_000),
                demotion_window_ms: env_var_parse("SYNC_DEMOTION_WINDOW_MS", 60_000),
                slow_rest_threshold_ms: env_var_parse("SYNC_SLOW_REST_MS", 10_000),
            },
            poller: PollerConfig {
                cycle_pause_ms: env_var_parse("SYNC_POLL_PAUSE_MS", 10_000),
                request_delay_ms: env_var_parse("SYNC_POLL_REQUEST_DELAY_MS", 500),
            },
            reconcile: ReconcileConfig {
                interval_ms: env_var_parse("SYNC_RECONCILE_MS", 30_000),
                stagger_ms: env_var_parse("SYNC_STAGGER_MS", 500),
            },
            status: StatusConfig {
                path: std::env::var("SYNC_STATUS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("sync-status.json")),
                interval_ms: env_var_parse("SYNC_STATUS_INTERVAL_MS", 10_000),
            },
        }
    }
}

/// 환경변수에서 값을 파싱 (실패 시 기본값 사용).
fn env_var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connection.global_cap, 40);
        assert_eq!(config.watcher.restart_success_threshold, 3);
        assert_eq!(config.backoff.error_threshold, 6);
        assert_eq!(config.price.tick_throttle(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_var_parse_fallback() {
        assert_eq!(env_var_parse("SYNC_TEST_MISSING_KEY", 7usize), 7);
    }
}
