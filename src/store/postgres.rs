//! PostgreSQL resource store
//!
//! All state updates are conditional (`WHERE status = $expected`) so that two
//! workers racing on one record serialize on the row lock and the loser sees
//! zero affected rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{ResourceStore, StoreTx};
use crate::core_types::{DepositId, Money, OrderId, ProductId, StockUnitId, UserId};
use crate::error::StoreError;
use crate::models::{
    Deposit, DepositStatus, NewDeposit, NewOrder, Order, OrderStatus, PaymentInstructions,
    PaymentMethod, Product, Role, StockCounts, StockStatus, StockUnit, User,
};

const ORDER_COLUMNS: &str = "order_id, order_ref, user_id, product_id, quantity, price, \
     total_amount, payment_method, status, expired_at, paid_at, is_notified, assigned_codes, \
     amount_charged, amount_received, qr_payload, checkout_url, created_at, updated_at";

const DEPOSIT_COLUMNS: &str = "deposit_id, deposit_ref, user_id, amount, channel, status, \
     expired_at, paid_at, is_notified, amount_charged, amount_received, qr_payload, \
     checkout_url, created_at, updated_at";

const UNIT_COLUMNS: &str = "unit_id, product_id, code, status, sold_to";

// ============================================================================
// Row mapping
// ============================================================================

fn payment_from_row(row: &PgRow) -> Result<PaymentInstructions, StoreError> {
    Ok(PaymentInstructions {
        amount_charged: row.try_get("amount_charged")?,
        amount_received: row.try_get("amount_received")?,
        qr_payload: row.try_get("qr_payload")?,
        checkout_url: row.try_get("checkout_url")?,
    })
}

fn row_to_order(row: &PgRow) -> Result<Order, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    let status = OrderStatus::from_id(status_id).ok_or_else(|| StoreError::Corrupt {
        table: "orders_tb",
        detail: format!("invalid status id {}", status_id),
    })?;
    let method: String = row.try_get("payment_method")?;

    Ok(Order {
        id: row.try_get("order_id")?,
        order_ref: row.try_get("order_ref")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        total_amount: row.try_get("total_amount")?,
        payment_method: PaymentMethod::parse(&method),
        status,
        expired_at: row.try_get("expired_at")?,
        paid_at: row.try_get("paid_at")?,
        is_notified: row.try_get("is_notified")?,
        assigned_codes: row.try_get("assigned_codes")?,
        payment: payment_from_row(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_deposit(row: &PgRow) -> Result<Deposit, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    let status = DepositStatus::from_id(status_id).ok_or_else(|| StoreError::Corrupt {
        table: "deposits_tb",
        detail: format!("invalid status id {}", status_id),
    })?;

    Ok(Deposit {
        id: row.try_get("deposit_id")?,
        deposit_ref: row.try_get("deposit_ref")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        channel: row.try_get("channel")?,
        status,
        expired_at: row.try_get("expired_at")?,
        paid_at: row.try_get("paid_at")?,
        is_notified: row.try_get("is_notified")?,
        payment: payment_from_row(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_unit(row: &PgRow) -> Result<StockUnit, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    let status = StockStatus::from_id(status_id).ok_or_else(|| StoreError::Corrupt {
        table: "stock_units_tb",
        detail: format!("invalid status id {}", status_id),
    })?;

    Ok(StockUnit {
        id: row.try_get("unit_id")?,
        product_id: row.try_get("product_id")?,
        code: row.try_get("code")?,
        status,
        sold_to: row.try_get("sold_to")?,
    })
}

fn row_to_user(row: &PgRow) -> Result<User, StoreError> {
    let role_id: i16 = row.try_get("role")?;
    let role = Role::from_id(role_id).ok_or_else(|| StoreError::Corrupt {
        table: "users_tb",
        detail: format!("invalid role id {}", role_id),
    })?;

    Ok(User {
        id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        role,
    })
}

fn row_to_product(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: row.try_get("product_id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        is_active: row.try_get("is_active")?,
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    map: fn(&PgRow) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

// ============================================================================
// Transaction
// ============================================================================

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO orders_tb
                (order_ref, user_id, product_id, quantity, price, total_amount,
                 payment_method, status, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&order.order_ref)
            .bind(order.user_id)
            .bind(order.product_id)
            .bind(order.quantity)
            .bind(order.price)
            .bind(order.total_amount)
            .bind(order.payment_method.as_str())
            .bind(OrderStatus::Pending.id())
            .bind(order.expired_at)
            .fetch_one(&mut *self.tx)
            .await?;
        row_to_order(&row)
    }

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO deposits_tb (deposit_ref, user_id, amount, channel, status, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&deposit.deposit_ref)
            .bind(deposit.user_id)
            .bind(deposit.amount)
            .bind(&deposit.channel)
            .bind(DepositStatus::Pending.id())
            .bind(deposit.expired_at)
            .fetch_one(&mut *self.tx)
            .await?;
        row_to_deposit(&row)
    }

    async fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            r#"
            UPDATE orders_tb
            SET status = $1, paid_at = COALESCE($2, paid_at), updated_at = NOW()
            WHERE order_id = $3 AND status = $4
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(to.id())
            .bind(paid_at)
            .bind(id)
            .bind(from.id())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn transition_deposit(
        &mut self,
        id: DepositId,
        from: DepositStatus,
        to: DepositStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>, StoreError> {
        let sql = format!(
            r#"
            UPDATE deposits_tb
            SET status = $1, paid_at = COALESCE($2, paid_at), updated_at = NOW()
            WHERE deposit_id = $3 AND status = $4
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(to.id())
            .bind(paid_at)
            .bind(id)
            .bind(from.id())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn lock_ready_units(
        &mut self,
        product_id: ProductId,
        limit: i64,
    ) -> Result<Vec<StockUnit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM stock_units_tb
            WHERE product_id = $1 AND status = $2
            ORDER BY unit_id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            UNIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(product_id)
            .bind(StockStatus::Ready.id())
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        collect(rows, row_to_unit)
    }

    async fn set_unit_status(
        &mut self,
        unit_ids: &[StockUnitId],
        status: StockStatus,
        sold_to: Option<UserId>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stock_units_tb
            SET status = $1, sold_to = $2, updated_at = NOW()
            WHERE unit_id = ANY($3)
            "#,
        )
        .bind(status.id())
        .bind(sold_to)
        .bind(unit_ids.to_vec())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_reservations(
        &mut self,
        order_id: OrderId,
        unit_ids: &[StockUnitId],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reservation_queue_tb (order_id, unit_id)
            SELECT $1, UNNEST($2::BIGINT[])
            "#,
        )
        .bind(order_id)
        .bind(unit_ids.to_vec())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn reserved_units(&mut self, order_id: OrderId) -> Result<Vec<StockUnit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.unit_id, s.product_id, s.code, s.status, s.sold_to
            FROM stock_units_tb s
            JOIN reservation_queue_tb q ON q.unit_id = s.unit_id
            WHERE q.order_id = $1
            ORDER BY s.unit_id ASC
            FOR UPDATE OF s
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, row_to_unit)
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM reservation_queue_tb WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_assigned_codes(
        &mut self,
        order_id: OrderId,
        codes: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orders_tb SET assigned_codes = $1, updated_at = NOW() WHERE order_id = $2",
        )
        .bind(codes.to_vec())
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn reset_order_notified(&mut self, order_id: OrderId) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders_tb SET is_notified = FALSE WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn credit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users_tb SET balance = balance + $1, updated_at = NOW()
            WHERE user_id = $2
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn debit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users_tb SET balance = balance - $1, updated_at = NOW()
            WHERE user_id = $2 AND balance >= $1
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_orders(&self, sql: &str, binds: OrderQuery) -> Result<Vec<Order>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(now) = binds.now {
            query = query.bind(now);
        }
        let rows = query.bind(binds.limit).fetch_all(&self.pool).await?;
        collect(rows, row_to_order)
    }

    async fn fetch_deposits(
        &self,
        sql: &str,
        binds: OrderQuery,
    ) -> Result<Vec<Deposit>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(now) = binds.now {
            query = query.bind(now);
        }
        let rows = query.bind(binds.limit).fetch_all(&self.pool).await?;
        collect(rows, row_to_deposit)
    }
}

/// Shared binds of the listing queries: optional `now`, then `limit`
struct OrderQuery {
    now: Option<DateTime<Utc>>,
    limit: i64,
}

#[async_trait]
impl ResourceStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn create_user(&self, role: Role, balance: Money) -> Result<User, StoreError> {
        let row = sqlx::query(
            "INSERT INTO users_tb (balance, role) VALUES ($1, $2) RETURNING user_id, balance, role",
        )
        .bind(balance)
        .bind(role.id())
        .fetch_one(&self.pool)
        .await?;
        row_to_user(&row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT user_id, balance, role FROM users_tb WHERE user_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create_product(&self, name: &str, price: Money) -> Result<Product, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO products_tb (name, price) VALUES ($1, $2)
            RETURNING product_id, name, price, is_active
            "#,
        )
        .bind(name)
        .bind(price)
        .fetch_one(&self.pool)
        .await?;
        row_to_product(&row)
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            "SELECT product_id, name, price, is_active FROM products_tb WHERE product_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_product).transpose()
    }

    async fn import_stock(
        &self,
        product_id: ProductId,
        codes: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_units_tb (product_id, code, status)
            SELECT $1, UNNEST($2::TEXT[]), $3
            ON CONFLICT (product_id, code) DO NOTHING
            "#,
        )
        .bind(product_id)
        .bind(codes.to_vec())
        .bind(StockStatus::Ready.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stock_counts(&self, product_id: ProductId) -> Result<StockCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM stock_units_tb
            WHERE product_id = $1
            GROUP BY status
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StockCounts::default();
        for row in rows {
            let status: i16 = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match StockStatus::from_id(status) {
                Some(StockStatus::Ready) => counts.ready = n,
                Some(StockStatus::Reserved) => counts.reserved = n,
                Some(StockStatus::Sold) => counts.sold = n,
                None => {
                    return Err(StoreError::Corrupt {
                        table: "stock_units_tb",
                        detail: format!("invalid status id {}", status),
                    });
                }
            }
        }
        Ok(counts)
    }

    async fn stock_units(&self, product_id: ProductId) -> Result<Vec<StockUnit>, StoreError> {
        let sql = format!(
            "SELECT {} FROM stock_units_tb WHERE product_id = $1 ORDER BY unit_id",
            UNIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, row_to_unit)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders_tb WHERE order_id = $1", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn get_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders_tb WHERE order_ref = $1", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(order_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn pending_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders_tb WHERE status = 0 ORDER BY expired_at ASC LIMIT $1",
            ORDER_COLUMNS
        );
        self.fetch_orders(&sql, OrderQuery { now: None, limit })
            .await
    }

    async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM orders_tb
            WHERE status = 0 AND expired_at <= $1
            ORDER BY expired_at ASC
            LIMIT $2
            "#,
            ORDER_COLUMNS
        );
        self.fetch_orders(&sql, OrderQuery { now: Some(now), limit })
            .await
    }

    async fn unnotified_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM orders_tb
            WHERE is_notified = FALSE AND status <> 0
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
            ORDER_COLUMNS
        );
        self.fetch_orders(&sql, OrderQuery { now: None, limit })
            .await
    }

    async fn mark_order_notified(
        &self,
        id: OrderId,
        announced: OrderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET is_notified = TRUE \
             WHERE order_id = $1 AND is_notified = FALSE AND status = $2",
        )
        .bind(id)
        .bind(announced.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_order_payment(
        &self,
        id: OrderId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE orders_tb
            SET amount_charged = $1, amount_received = $2, qr_payload = $3,
                checkout_url = $4, updated_at = NOW()
            WHERE order_id = $5
            "#,
        )
        .bind(payment.amount_charged)
        .bind(payment.amount_received)
        .bind(&payment.qr_payload)
        .bind(&payment.checkout_url)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, StoreError> {
        let sql = format!(
            "SELECT {} FROM deposits_tb WHERE deposit_id = $1",
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn get_deposit_by_ref(&self, deposit_ref: &str) -> Result<Option<Deposit>, StoreError> {
        let sql = format!(
            "SELECT {} FROM deposits_tb WHERE deposit_ref = $1",
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(deposit_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn pending_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError> {
        let sql = format!(
            "SELECT {} FROM deposits_tb WHERE status = 0 ORDER BY expired_at ASC LIMIT $1",
            DEPOSIT_COLUMNS
        );
        self.fetch_deposits(&sql, OrderQuery { now: None, limit })
            .await
    }

    async fn overdue_deposits(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Deposit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM deposits_tb
            WHERE status = 0 AND expired_at <= $1
            ORDER BY expired_at ASC
            LIMIT $2
            "#,
            DEPOSIT_COLUMNS
        );
        self.fetch_deposits(&sql, OrderQuery { now: Some(now), limit })
            .await
    }

    async fn unnotified_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM deposits_tb
            WHERE is_notified = FALSE AND status <> 0
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
            DEPOSIT_COLUMNS
        );
        self.fetch_deposits(&sql, OrderQuery { now: None, limit })
            .await
    }

    async fn mark_deposit_notified(
        &self,
        id: DepositId,
        announced: DepositStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE deposits_tb SET is_notified = TRUE \
             WHERE deposit_id = $1 AND is_notified = FALSE AND status = $2",
        )
        .bind(id)
        .bind(announced.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_deposit_payment(
        &self,
        id: DepositId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE deposits_tb
            SET amount_charged = $1, amount_received = $2, qr_payload = $3,
                checkout_url = $4, updated_at = NOW()
            WHERE deposit_id = $5
            "#,
        )
        .bind(payment.amount_charged)
        .bind(payment.amount_received)
        .bind(&payment.qr_payload)
        .bind(&payment.checkout_url)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
