//! PostgreSQL schema
//!
//! Idempotent bootstrap, applied at startup. Status columns are SMALLINT ids
//! (see [`crate::models`]).

use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;

pub const USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users_tb (
    user_id     BIGSERIAL PRIMARY KEY,
    balance     NUMERIC(30, 8) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    role        SMALLINT NOT NULL DEFAULT 1,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const PRODUCTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS products_tb (
    product_id  BIGSERIAL PRIMARY KEY,
    name        VARCHAR(128) NOT NULL,
    price       NUMERIC(30, 8) NOT NULL CHECK (price >= 0),
    is_active   BOOLEAN NOT NULL DEFAULT TRUE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const STOCK_UNITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stock_units_tb (
    unit_id     BIGSERIAL PRIMARY KEY,
    product_id  BIGINT NOT NULL REFERENCES products_tb (product_id),
    code        TEXT NOT NULL,
    status      SMALLINT NOT NULL DEFAULT 0,
    sold_to     BIGINT REFERENCES users_tb (user_id),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (product_id, code)
)"#;

pub const STOCK_READY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stock_units_ready
    ON stock_units_tb (product_id, unit_id) WHERE status = 0"#;

pub const ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders_tb (
    order_id        BIGSERIAL PRIMARY KEY,
    order_ref       VARCHAR(64) NOT NULL UNIQUE,
    user_id         BIGINT REFERENCES users_tb (user_id),
    product_id      BIGINT NOT NULL REFERENCES products_tb (product_id),
    quantity        INTEGER NOT NULL CHECK (quantity > 0),
    price           NUMERIC(30, 8) NOT NULL,
    total_amount    NUMERIC(30, 8) NOT NULL,
    payment_method  VARCHAR(32) NOT NULL,
    status          SMALLINT NOT NULL DEFAULT 0,
    expired_at      TIMESTAMPTZ NOT NULL,
    paid_at         TIMESTAMPTZ,
    is_notified     BOOLEAN NOT NULL DEFAULT FALSE,
    assigned_codes  TEXT[] NOT NULL DEFAULT '{}',
    amount_charged  NUMERIC(30, 8),
    amount_received NUMERIC(30, 8),
    qr_payload      TEXT,
    checkout_url    TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const ORDERS_PENDING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_pending
    ON orders_tb (expired_at) WHERE status = 0"#;

pub const ORDERS_UNNOTIFIED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_unnotified
    ON orders_tb (order_id) WHERE is_notified = FALSE AND status <> 0"#;

pub const DEPOSITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deposits_tb (
    deposit_id      BIGSERIAL PRIMARY KEY,
    deposit_ref     VARCHAR(64) NOT NULL UNIQUE,
    user_id         BIGINT NOT NULL REFERENCES users_tb (user_id),
    amount          NUMERIC(30, 8) NOT NULL CHECK (amount > 0),
    channel         VARCHAR(32) NOT NULL,
    status          SMALLINT NOT NULL DEFAULT 0,
    expired_at      TIMESTAMPTZ NOT NULL,
    paid_at         TIMESTAMPTZ,
    is_notified     BOOLEAN NOT NULL DEFAULT FALSE,
    amount_charged  NUMERIC(30, 8),
    amount_received NUMERIC(30, 8),
    qr_payload      TEXT,
    checkout_url    TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const DEPOSITS_PENDING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deposits_pending
    ON deposits_tb (expired_at) WHERE status = 0"#;

/// A unit can sit in at most one order's queue: `UNIQUE (unit_id)`.
pub const RESERVATION_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reservation_queue_tb (
    order_id    BIGINT NOT NULL REFERENCES orders_tb (order_id),
    unit_id     BIGINT NOT NULL REFERENCES stock_units_tb (unit_id),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (order_id, unit_id),
    UNIQUE (unit_id)
)"#;

/// Statements in dependency order
pub const STATEMENTS: &[&str] = &[
    USERS_TABLE,
    PRODUCTS_TABLE,
    STOCK_UNITS_TABLE,
    STOCK_READY_INDEX,
    ORDERS_TABLE,
    ORDERS_PENDING_INDEX,
    ORDERS_UNNOTIFIED_INDEX,
    DEPOSITS_TABLE,
    DEPOSITS_PENDING_INDEX,
    RESERVATION_QUEUE_TABLE,
];

/// Create all tables and indexes that do not exist yet
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "Schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_idempotent() {
        for statement in STATEMENTS {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement must be re-runnable: {}",
                statement
            );
        }
    }

    #[test]
    fn test_dependency_order() {
        let pos = |needle: &str| {
            STATEMENTS
                .iter()
                .position(|s| s.contains(needle))
                .unwrap()
        };
        assert!(pos("users_tb (") < pos("stock_units_tb ("));
        assert!(pos("products_tb (") < pos("stock_units_tb ("));
        assert!(pos("orders_tb (") < pos("reservation_queue_tb ("));
    }
}
