//! # Sync Engine
//!
//! 계좌 잔고/포지션/주문과 최근 체결가를 준실시간으로 동기화하는
//! 엔진입니다. 계좌와 데이터 종류별로 push(스트리밍 구독)와 pull(주기적
//! REST 폴링)을 선택하며, 인증 스트림 연결의 전역/거래소별 상한을
//! 지키고 연결 장애나 레이트리밋 상황에서 연쇄 실패 없이 성능만
//! 저하되도록 동작합니다.
//!
//! 구성요소:
//! - [`connection::ConnectionManager`] - 용량 검사-예약을 직렬화하는 연결 풀
//! - [`watcher::AccountWatcher`] - (계좌, 종류)별 스트림 상태 기계
//! - [`price_watcher::PriceWatcher`] - 거래소별 시세 구독
//! - [`backoff::BackoffCoordinator`] - 거래소 백오프 및 강등 프로토콜
//! - [`price_buffer::PriceBuffer`] - latest-wins 가격 버퍼 + 배치 플러시
//! - [`poller::RestPoller`] - 스트림 없는 항목의 REST 폴링
//! - [`reconcile::SyncEngine`] - 희망/실행 diff 조정 루프

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod poller;
pub mod price_buffer;
pub mod price_watcher;
pub mod reconcile;
pub mod stats;
pub mod status;
pub mod symbol_map;
pub mod watcher;

pub use backoff::{BackoffCoordinator, DemotionDecision};
pub use config::EngineConfig;
pub use connection::ConnectionManager;
pub use error::{EngineError, EngineResult};
pub use price_buffer::{PriceBuffer, PriceFlusher};
pub use reconcile::{AccountsProvider, StaticAccountsProvider, SyncEngine};
pub use status::{DeliveryMode, StatusRegistry};
pub use watcher::{AccountWatcher, WatcherState};
