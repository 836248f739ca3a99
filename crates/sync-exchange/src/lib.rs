//! # Sync Exchange
//!
//! 거래소 게이트웨이 경계를 정의합니다.
//!
//! 실제 거래소 와이어 프로토콜(REST 서명, WebSocket 프레이밍)은 이
//! 크레이트 뒤에 구현되며, 동기화 엔진은 여기 정의된 trait과 닫힌
//! 에러 분류만을 사용합니다:
//! - `Gateway` - 클라이언트 생성/종료 및 종료 알림 채널
//! - `PrivateStreamClient` - 계좌별 인증 스트림 (잔고/포지션/주문)
//! - `SharedStreamClient` - 거래소별 공용 시세 스트림
//! - `RestClient` - 폴링 경로용 REST 조회
//! - `StreamError` - 닫힌 에러 분류 (문자열 매칭 금지)

pub mod error;
pub mod sim;
pub mod traits;

pub use error::{StreamError, StreamResult};
pub use traits::{
    CloseNotification, Gateway, PrivateStreamClient, RestClient, SharedStreamClient,
    StreamCapabilities, StreamEvent, TickerEvent,
};
