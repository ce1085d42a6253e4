use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Order Aggregate
// ============================================================================
//
// Canonical in-memory representation of one order document as it arrives on
// the stream. `order_uid` is the sole key for both the store and the cache;
// Delivery, Payment and Items are exclusively owned by their Order and never
// addressed independently.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    #[serde(default)]
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub internal_signature: String,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub delivery_service: String,
    #[serde(default)]
    pub shardkey: String,
    #[serde(default)]
    pub sm_id: i64,
    pub date_created: DateTime<Utc>,
    #[serde(default)]
    pub oof_shard: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Delivery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Payment {
    pub transaction: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub payment_dt: i64,
    #[serde(default)]
    pub bank: String,
    #[serde(default)]
    pub delivery_cost: f64,
    #[serde(default)]
    pub goods_total: f64,
    #[serde(default)]
    pub custom_fee: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Item {
    #[serde(default)]
    pub chrt_id: i64,
    #[serde(default)]
    pub track_number: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub rid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sale: i32,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub nm_id: i64,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("order_uid must not be empty")]
    EmptyOrderUid,

    #[error("payment transaction id must not be empty")]
    EmptyTransaction,
}

impl Order {
    /// Validate required fields immediately after decode, instead of
    /// trusting the wire. A document failing here is permanently malformed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.order_uid.is_empty() {
            return Err(ValidationError::EmptyOrderUid);
        }
        if self.payment.transaction.is_empty() {
            return Err(ValidationError::EmptyTransaction);
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test_fixtures {
    use super::*;
    use chrono::TimeZone;

    /// The canonical sample document used across the test suite.
    pub fn sample_order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: format!("WBILMTESTTRACK-{uid}"),
            entry: "WBIL".to_string(),
            delivery: Delivery {
                name: "Test Testov".to_string(),
                phone: "+9720000000".to_string(),
                zip: "2639809".to_string(),
                city: "Kiryat Mozkin".to_string(),
                address: "Ploshad Mira 15".to_string(),
                region: "Kraiot".to_string(),
                email: "test@gmail.com".to_string(),
            },
            payment: Payment {
                transaction: format!("txn-{uid}"),
                request_id: String::new(),
                currency: "USD".to_string(),
                provider: "wbpay".to_string(),
                amount: 1817.0,
                payment_dt: 1637907727,
                bank: "alpha".to_string(),
                delivery_cost: 1500.0,
                goods_total: 317.0,
                custom_fee: 0.0,
            },
            items: vec![Item {
                chrt_id: 9934930,
                track_number: format!("WBILMTESTTRACK-{uid}"),
                price: 453.0,
                rid: "ab4219087a764ae0btest".to_string(),
                name: "Mascaras".to_string(),
                sale: 30,
                size: "0".to_string(),
                total_price: 317.0,
                nm_id: 2389212,
                brand: "Vivienne Sabo".to_string(),
                status: 202,
            }],
            locale: "en".to_string(),
            internal_signature: String::new(),
            customer_id: "test".to_string(),
            delivery_service: "meest".to_string(),
            shardkey: "9".to_string(),
            sm_id: 99,
            date_created: Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap(),
            oof_shard: "1".to_string(),
        }
    }
}
