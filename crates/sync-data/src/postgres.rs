//! PostgreSQL 저장소 구현.
//!
//! 계좌 상태는 스냅샷 전체 치환(delete + insert)으로, 가격은 append
//! 전용 배치 insert로 저장합니다. REST 조회는 주입된 `RestClient`를
//! 통해 수행됩니다.
//!
//! # 테이블
//!
//! - `account_balances` (account, asset, free, locked, updated_at)
//! - `account_positions` (account, symbol, quantity, entry_price, updated_at)
//! - `account_orders` (account, order_id, symbol, price, remaining, updated_at)
//! - `price_ticks` (account, symbol, price, ts)

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use sync_core::{Account, PriceRow};
use sync_exchange::RestClient;
use tracing::debug;

use crate::error::DataResult;
use crate::store::SyncStore;

/// PostgreSQL 기반 동기화 저장소.
pub struct PgSyncStore {
    pool: PgPool,
    rest: Arc<dyn RestClient>,
}

impl PgSyncStore {
    /// 새 저장소를 생성합니다.
    pub fn new(pool: PgPool, rest: Arc<dyn RestClient>) -> Self {
        Self { pool, rest }
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn update_balances(&self, account: &Account) -> DataResult<()> {
        let balances = self.rest.fetch_balances(account).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM account_balances WHERE account = $1")
            .bind(&account.name)
            .execute(&mut *tx)
            .await?;

        for balance in &balances {
            sqlx::query(
                r#"
                INSERT INTO account_balances (account, asset, free, locked, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(&account.name)
            .bind(&balance.asset)
            .bind(balance.free)
            .bind(balance.locked)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(account = %account, assets = balances.len(), "잔고 저장 완료");
        Ok(())
    }

    async fn update_positions(&self, account: &Account) -> DataResult<()> {
        let positions = self.rest.fetch_positions(account).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM account_positions WHERE account = $1")
            .bind(&account.name)
            .execute(&mut *tx)
            .await?;

        for position in positions.iter().filter(|p| p.is_open()) {
            sqlx::query(
                r#"
                INSERT INTO account_positions (account, symbol, quantity, entry_price, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(&account.name)
            .bind(&position.symbol)
            .bind(position.quantity)
            .bind(position.entry_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(account = %account, positions = positions.len(), "포지션 저장 완료");
        Ok(())
    }

    async fn update_orders(&self, account: &Account) -> DataResult<()> {
        let orders = self.rest.fetch_orders(account).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM account_orders WHERE account = $1")
            .bind(&account.name)
            .execute(&mut *tx)
            .await?;

        for order in &orders {
            sqlx::query(
                r#"
                INSERT INTO account_orders (account, order_id, symbol, price, remaining, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(&account.name)
            .bind(&order.order_id)
            .bind(&order.symbol)
            .bind(order.price)
            .bind(order.remaining)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(account = %account, orders = orders.len(), "주문 저장 완료");
        Ok(())
    }

    async fn write_prices_batch(&self, rows: &[PriceRow]) -> DataResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO price_ticks (account, symbol, price, ts)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&row.account)
            .bind(&row.symbol)
            .bind(row.price)
            .bind(row.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(rows = rows.len(), "가격 배치 저장 완료");
        Ok(rows.len())
    }

    async fn open_position_symbols(&self, account: &Account) -> DataResult<Vec<String>> {
        let symbols: Vec<String> = sqlx::query_scalar(
            "SELECT symbol FROM account_positions WHERE account = $1 AND quantity <> 0",
        )
        .bind(&account.name)
        .fetch_all(&self.pool)
        .await?;

        Ok(symbols)
    }
}
