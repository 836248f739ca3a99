//! 엔진 에러 타입.
//!
//! watcher 내부 에러는 각 태스크 안에서 처리되며 밖으로 전파되지
//! 않습니다. 이 타입은 구성/기동 경로에서만 사용됩니다.

use thiserror::Error;

/// 엔진 작업을 위한 Result 타입.
pub type EngineResult<T> = Result<T, EngineError>;

/// 엔진 구성/기동 에러.
#[derive(Debug, Error)]
pub enum EngineError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 계좌 목록 로드 에러
    #[error("Accounts source error: {0}")]
    Accounts(String),

    /// 상태 파일 입출력 에러
    #[error("Status file error: {0}")]
    Io(#[from] std::io::Error),
}
