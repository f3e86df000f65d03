pub mod db;
pub mod models;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the change channel raised for every inserted sale row.
pub const SALE_CHANNEL: &str = "sale";
/// Name of the change channel raised for every inserted price adjustment row.
pub const PRICE_ADJUSTMENT_CHANNEL: &str = "price_adjustment";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleEvent {
    pub id: i32,
    pub product_id: i32,
    pub sale_price: f64,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAdjustmentEvent {
    pub id: i32,
    pub product_id: i32,
    pub old_price: f64,
    pub new_price: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Increase,
    Decrease,
    Unchanged,
}

impl ChangeType {
    pub fn classify(old_price: f64, new_price: f64) -> Self {
        if new_price > old_price {
            ChangeType::Increase
        } else if new_price < old_price {
            ChangeType::Decrease
        } else {
            ChangeType::Unchanged
        }
    }
}

/// Compact payload pushed to live clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub product_id: i32,
    pub new_price: f64,
    pub changed_at: DateTime<Utc>,
    pub price_change: f64,
    pub change_type: ChangeType,
    pub product_name: String,
}

impl PriceUpdate {
    pub fn from_adjustment(event: &PriceAdjustmentEvent, product_name: String) -> Self {
        Self {
            product_id: event.product_id,
            new_price: event.new_price,
            changed_at: event.created_at,
            price_change: round_to_cents(event.new_price - event.old_price),
            change_type: ChangeType::classify(event.old_price, event.new_price),
            product_name,
        }
    }
}

fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub fn fallback_product_name(product_id: i32) -> String {
    format!("Product #{}", product_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "success",
        }
    }
}

pub const PAYMENT_METHOD_CARD: &str = "card";
