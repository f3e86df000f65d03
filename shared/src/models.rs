use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct CartItem {
    pub id: i32,
    pub cart_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i32,
    pub customer_id: i32,
    pub total_price: BigDecimal,
    pub status: String,
    pub price_valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub customer_id: i32,
    pub total_price: BigDecimal,
    pub status: String,
    pub price_valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItem {
    pub id: i32,
    pub order_id: i32,
    pub product_id: i32,
    pub price: BigDecimal,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub order_id: i32,
    pub product_id: i32,
    pub price: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub order_id: i32,
    pub payment_method: String,
    pub amount: BigDecimal,
    pub status: String,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::sales)]
pub struct NewSale {
    pub order_item_id: Option<i32>,
    pub product_id: i32,
    pub sale_price: BigDecimal,
    pub quantity: i32,
}

/// One trained model version. Rows are only ever inserted.
#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::price_model_coefficients)]
pub struct PriceModelCoefficients {
    pub id: i32,
    pub model_version: String,
    pub training_date: DateTime<Utc>,
    pub sample_size: i32,
    pub r_squared: f64,
    pub intercept: f64,
    pub sales_count_coef: f64,
    pub sales_value_coef: f64,
    pub sales_velocity_coef: f64,
    pub days_since_sale_coef: f64,
    pub category_rank_coef: f64,
    pub category_percentile_coef: f64,
    pub review_score_coef: f64,
    pub wishlist_ratio_coef: f64,
    pub days_in_stock_coef: f64,
    pub seasonal_factor_coef: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::price_model_coefficients)]
pub struct NewPriceModelCoefficients {
    pub model_version: String,
    pub training_date: DateTime<Utc>,
    pub sample_size: i32,
    pub r_squared: f64,
    pub intercept: f64,
    pub sales_count_coef: f64,
    pub sales_value_coef: f64,
    pub sales_velocity_coef: f64,
    pub days_since_sale_coef: f64,
    pub category_rank_coef: f64,
    pub category_percentile_coef: f64,
    pub review_score_coef: f64,
    pub wishlist_ratio_coef: f64,
    pub days_in_stock_coef: f64,
    pub seasonal_factor_coef: f64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::price_adjustments)]
pub struct NewPriceAdjustment {
    pub product_id: i32,
    pub old_price: BigDecimal,
    pub new_price: BigDecimal,
    pub model_version: String,
    pub confidence_score: f32,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::pricing_features)]
pub struct PricingFeaturesRow {
    pub product_id: i32,
    pub days_since_last_sale: i32,
    pub sales_velocity: f64,
    pub total_sales_count: i32,
    pub total_sales_value: f64,
    pub category_rank: i32,
    pub category_percentile: f64,
    pub review_score: f64,
    pub wishlist_to_sales_ratio: f64,
    pub days_in_stock: i32,
    pub seasonal_factor: f64,
    pub last_model_run: DateTime<Utc>,
}
