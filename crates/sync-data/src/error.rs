//! 저장소 에러 타입.

use sync_exchange::StreamError;
use thiserror::Error;

/// 저장소 작업을 위한 Result 타입.
pub type DataResult<T> = Result<T, DataError>;

/// 저장소 관련 에러.
#[derive(Debug, Error)]
pub enum DataError {
    /// 데이터베이스 에러
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 게이트웨이 REST 조회 에러
    #[error("Gateway fetch error: {0}")]
    Gateway(#[from] StreamError),

    /// 일반 에러
    #[error("Store error: {0}")]
    Other(String),
}

impl DataError {
    /// 게이트웨이 조회 실패에서 비롯된 에러인지 확인.
    ///
    /// 폴러는 이 경우 거래소 백오프 판단에 에러를 반영합니다.
    pub fn is_gateway(&self) -> bool {
        matches!(self, DataError::Gateway(_))
    }
}
