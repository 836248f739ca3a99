//! 스트림 에러 분류.
//!
//! 게이트웨이 경계에서 닫힌 에러 enum으로 분류합니다. 엔진은 이 분류에만
//! 의존하며, 원본 에러 메시지 문자열을 검사하지 않습니다. 와이어 에러를
//! 어느 variant로 매핑할지는 각 게이트웨이 구현이 책임집니다.

use thiserror::Error;

/// 스트림 작업을 위한 Result 타입.
pub type StreamResult<T> = Result<T, StreamError>;

/// 스트리밍/게이트웨이 에러.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// 해당 계좌/종류에 대한 스트리밍 미지원 (영구적, REST로 위임)
    #[error("Capability unsupported: {0}")]
    CapabilityUnsupported(String),

    /// 정상 종료 코드에 의한 연결 종료 (즉시 재연결)
    #[error("Benign close")]
    BenignClose,

    /// keepalive/응답 타임아웃 (1회 한정 클라이언트 재시작)
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    /// 네트워크/연결 에러 (강등 프로토콜 대상)
    #[error("Network error: {0}")]
    Network(String),

    /// 거래소의 구독 거부 (하드 리밋, 거래소 전체 백오프)
    #[error("Subscribe rejected: {0}")]
    SubscribeRejected(String),

    /// 요청 한도 초과 / 과부하 (거래소 전체 백오프)
    #[error("Rate limited")]
    RateLimited,

    /// 분류 불가 에러 (지터 지수 백오프 후 재시도)
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl StreamError {
    /// 재시도 가능한 일시적 에러인지 확인.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::BenignClose
                | StreamError::KeepaliveTimeout
                | StreamError::Network(_)
                | StreamError::Unknown(_)
        )
    }

    /// 거래소 전체 백오프를 유발하는 에러인지 확인.
    pub fn is_exchange_wide(&self) -> bool {
        matches!(
            self,
            StreamError::SubscribeRejected(_) | StreamError::RateLimited
        )
    }

    /// 해당 (계좌, 종류)에 대해 영구적으로 스트리밍을 포기해야 하는지 확인.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::CapabilityUnsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StreamError::BenignClose.is_transient());
        assert!(StreamError::KeepaliveTimeout.is_transient());
        assert!(StreamError::Network("reset".into()).is_transient());
        assert!(!StreamError::RateLimited.is_transient());
        assert!(!StreamError::CapabilityUnsupported("orders".into()).is_transient());
    }

    #[test]
    fn test_exchange_wide_classification() {
        assert!(StreamError::RateLimited.is_exchange_wide());
        assert!(StreamError::SubscribeRejected("limit".into()).is_exchange_wide());
        assert!(!StreamError::Network("reset".into()).is_exchange_wide());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(StreamError::CapabilityUnsupported("balance".into()).is_terminal());
        assert!(!StreamError::KeepaliveTimeout.is_terminal());
    }
}
