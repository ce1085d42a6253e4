use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::models::{Delivery, Item, Order, Payment};

// ============================================================================
// Persistent Order Store
// ============================================================================
//
// Durable keyed storage for order aggregates. The consumer depends on three
// guarantees here:
//
// 1. `get_by_uid` distinguishes "not found" from every other failure, so the
//    dedup check can tell "new" from "duplicate" from "store unavailable".
// 2. `save` is transactional across the order row and its owned delivery,
//    payment and item rows.
// 3. A unique violation on order_uid (or the payment transaction id) maps to
//    `StoreError::Duplicate`: an existence-check-then-insert that loses a
//    race to a concurrent writer still resolves as a duplicate, not a fault.
//
// ============================================================================

/// Postgres SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order not found")]
    NotFound,

    #[error("order already exists")]
    Duplicate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage contract consumed by the consumer and the query path.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order with its delivery, payment and items atomically.
    async fn save(&self, order: &Order) -> Result<(), StoreError>;

    /// Point lookup by order_uid.
    async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError>;

    /// Full scan, used once at startup to warm the cache.
    async fn get_all(&self) -> Result<Vec<Order>, StoreError>;
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema if it does not exist. Failure here is fatal to
    /// startup; the caller decides that, not the store.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running database migration");

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!("Database migration complete");
        Ok(())
    }

    async fn load_deliveries(&self) -> Result<HashMap<String, Delivery>, StoreError> {
        let rows = sqlx::query("SELECT * FROM deliveries")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("order_uid"), delivery_from_row(&row)))
            .collect())
    }

    async fn load_payments(&self) -> Result<HashMap<String, Payment>, StoreError> {
        let rows = sqlx::query("SELECT * FROM payments")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("order_uid"), payment_from_row(&row)))
            .collect())
    }

    async fn load_items(&self) -> Result<HashMap<String, Vec<Item>>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut items: HashMap<String, Vec<Item>> = HashMap::new();
        for row in rows {
            items
                .entry(row.get("order_uid"))
                .or_default()
                .push(item_from_row(&row));
        }
        Ok(items)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO orders (order_uid, track_number, entry, locale, internal_signature, \
             customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&order.order_uid)
        .bind(&order.track_number)
        .bind(&order.entry)
        .bind(&order.locale)
        .bind(&order.internal_signature)
        .bind(&order.customer_id)
        .bind(&order.delivery_service)
        .bind(&order.shardkey)
        .bind(order.sm_id)
        .bind(order.date_created)
        .bind(&order.oof_shard)
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        sqlx::query(
            "INSERT INTO deliveries (order_uid, name, phone, zip, city, address, region, email) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&order.order_uid)
        .bind(&order.delivery.name)
        .bind(&order.delivery.phone)
        .bind(&order.delivery.zip)
        .bind(&order.delivery.city)
        .bind(&order.delivery.address)
        .bind(&order.delivery.region)
        .bind(&order.delivery.email)
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        sqlx::query(
            "INSERT INTO payments (order_uid, transaction, request_id, currency, provider, \
             amount, payment_dt, bank, delivery_cost, goods_total, custom_fee) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&order.order_uid)
        .bind(&order.payment.transaction)
        .bind(&order.payment.request_id)
        .bind(&order.payment.currency)
        .bind(&order.payment.provider)
        .bind(order.payment.amount)
        .bind(order.payment.payment_dt)
        .bind(&order.payment.bank)
        .bind(order.payment.delivery_cost)
        .bind(order.payment.goods_total)
        .bind(order.payment.custom_fee)
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        for item in &order.items {
            sqlx::query(
                "INSERT INTO items (order_uid, chrt_id, track_number, price, rid, name, sale, \
                 size, total_price, nm_id, brand, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(&order.order_uid)
            .bind(item.chrt_id)
            .bind(&item.track_number)
            .bind(item.price)
            .bind(&item.rid)
            .bind(&item.name)
            .bind(item.sale)
            .bind(&item.size)
            .bind(item.total_price)
            .bind(item.nm_id)
            .bind(&item.brand)
            .bind(item.status)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError> {
        let order_row = sqlx::query("SELECT * FROM orders WHERE order_uid = $1")
            .bind(order_uid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let delivery_row = sqlx::query("SELECT * FROM deliveries WHERE order_uid = $1")
            .bind(order_uid)
            .fetch_optional(&self.pool)
            .await?;

        let payment_row = sqlx::query("SELECT * FROM payments WHERE order_uid = $1")
            .bind(order_uid)
            .fetch_optional(&self.pool)
            .await?;

        let item_rows = sqlx::query("SELECT * FROM items WHERE order_uid = $1 ORDER BY id")
            .bind(order_uid)
            .fetch_all(&self.pool)
            .await?;

        Ok(assemble_order(
            &order_row,
            delivery_row.as_ref().map(delivery_from_row).unwrap_or_default(),
            payment_row.as_ref().map(payment_from_row).unwrap_or_default(),
            item_rows.iter().map(item_from_row).collect(),
        ))
    }

    async fn get_all(&self) -> Result<Vec<Order>, StoreError> {
        let order_rows = sqlx::query("SELECT * FROM orders")
            .fetch_all(&self.pool)
            .await?;

        let mut deliveries = self.load_deliveries().await?;
        let mut payments = self.load_payments().await?;
        let mut items = self.load_items().await?;

        let orders = order_rows
            .into_iter()
            .map(|row| {
                let uid: String = row.get("order_uid");
                assemble_order(
                    &row,
                    deliveries.remove(&uid).unwrap_or_default(),
                    payments.remove(&uid).unwrap_or_default(),
                    items.remove(&uid).unwrap_or_default(),
                )
            })
            .collect();

        Ok(orders)
    }
}

/// A unique violation on insert means a concurrent writer got there first.
fn classify_write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Duplicate;
        }
    }
    StoreError::Database(e)
}

fn assemble_order(
    row: &sqlx::postgres::PgRow,
    delivery: Delivery,
    payment: Payment,
    items: Vec<Item>,
) -> Order {
    Order {
        order_uid: row.get("order_uid"),
        track_number: row.get("track_number"),
        entry: row.get("entry"),
        delivery,
        payment,
        items,
        locale: row.get("locale"),
        internal_signature: row.get("internal_signature"),
        customer_id: row.get("customer_id"),
        delivery_service: row.get("delivery_service"),
        shardkey: row.get("shardkey"),
        sm_id: row.get("sm_id"),
        date_created: row.get("date_created"),
        oof_shard: row.get("oof_shard"),
    }
}

fn delivery_from_row(row: &sqlx::postgres::PgRow) -> Delivery {
    Delivery {
        name: row.get("name"),
        phone: row.get("phone"),
        zip: row.get("zip"),
        city: row.get("city"),
        address: row.get("address"),
        region: row.get("region"),
        email: row.get("email"),
    }
}

fn payment_from_row(row: &sqlx::postgres::PgRow) -> Payment {
    Payment {
        transaction: row.get("transaction"),
        request_id: row.get("request_id"),
        currency: row.get("currency"),
        provider: row.get("provider"),
        amount: row.get("amount"),
        payment_dt: row.get("payment_dt"),
        bank: row.get("bank"),
        delivery_cost: row.get("delivery_cost"),
        goods_total: row.get("goods_total"),
        custom_fee: row.get("custom_fee"),
    }
}

fn item_from_row(row: &sqlx::postgres::PgRow) -> Item {
    Item {
        chrt_id: row.get("chrt_id"),
        track_number: row.get("track_number"),
        price: row.get("price"),
        rid: row.get("rid"),
        name: row.get("name"),
        sale: row.get("sale"),
        size: row.get("size"),
        total_price: row.get("total_price"),
        nm_id: row.get("nm_id"),
        brand: row.get("brand"),
        status: row.get("status"),
    }
}

/// Idempotent DDL, executed statement by statement at startup.
/// Orders are insert-only; deletion cascades from the order row if it ever
/// happens administratively.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        order_uid          TEXT PRIMARY KEY,
        track_number       TEXT NOT NULL UNIQUE,
        entry              TEXT NOT NULL DEFAULT '',
        locale             TEXT NOT NULL DEFAULT '',
        internal_signature TEXT NOT NULL DEFAULT '',
        customer_id        TEXT NOT NULL DEFAULT '',
        delivery_service   TEXT NOT NULL DEFAULT '',
        shardkey           TEXT NOT NULL DEFAULT '',
        sm_id              BIGINT NOT NULL DEFAULT 0,
        date_created       TIMESTAMPTZ NOT NULL,
        oof_shard          TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS deliveries (
        order_uid TEXT PRIMARY KEY REFERENCES orders(order_uid) ON DELETE CASCADE,
        name      TEXT NOT NULL DEFAULT '',
        phone     TEXT NOT NULL DEFAULT '',
        zip       TEXT NOT NULL DEFAULT '',
        city      TEXT NOT NULL DEFAULT '',
        address   TEXT NOT NULL DEFAULT '',
        region    TEXT NOT NULL DEFAULT '',
        email     TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        order_uid     TEXT PRIMARY KEY REFERENCES orders(order_uid) ON DELETE CASCADE,
        transaction   TEXT NOT NULL UNIQUE,
        request_id    TEXT NOT NULL DEFAULT '',
        currency      TEXT NOT NULL DEFAULT '',
        provider      TEXT NOT NULL DEFAULT '',
        amount        DOUBLE PRECISION NOT NULL DEFAULT 0,
        payment_dt    BIGINT NOT NULL DEFAULT 0,
        bank          TEXT NOT NULL DEFAULT '',
        delivery_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
        goods_total   DOUBLE PRECISION NOT NULL DEFAULT 0,
        custom_fee    DOUBLE PRECISION NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS items (
        id           BIGSERIAL PRIMARY KEY,
        order_uid    TEXT NOT NULL REFERENCES orders(order_uid) ON DELETE CASCADE,
        chrt_id      BIGINT NOT NULL DEFAULT 0,
        track_number TEXT NOT NULL DEFAULT '',
        price        DOUBLE PRECISION NOT NULL DEFAULT 0,
        rid          TEXT NOT NULL DEFAULT '',
        name         TEXT NOT NULL DEFAULT '',
        sale         INT NOT NULL DEFAULT 0,
        size         TEXT NOT NULL DEFAULT '',
        total_price  DOUBLE PRECISION NOT NULL DEFAULT 0,
        nm_id        BIGINT NOT NULL DEFAULT 0,
        brand        TEXT NOT NULL DEFAULT '',
        status       INT NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_items_order_uid ON items (order_uid)",
];
