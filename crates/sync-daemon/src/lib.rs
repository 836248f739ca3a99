//! 동기화 데몬 구성 요소.
//!
//! 바이너리와 독립적으로 계좌 목록 공급자를 제공합니다.

pub mod accounts;

pub use accounts::FileAccountsProvider;
