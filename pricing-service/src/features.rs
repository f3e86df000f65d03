//! Derives the regression feature vector for one product from its sales,
//! engagement and stock history.
//!
//! Every signal has a defined fallback for missing history so that a product
//! with no sales, no reviews or no stock row still yields a usable vector.

use chrono::{DateTime, Datelike, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Nullable, Timestamptz};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::models::PricingFeaturesRow;

use crate::error::PricingResult;

pub const FEATURE_COUNT: usize = 10;

/// Reported as days since last sale when a product has never sold.
pub const NO_SALES_DAYS_FALLBACK: i32 = 100;

pub const VELOCITY_WINDOW_DAYS: i64 = 30;

/// Predictor names in the order used by [`PricingFeatures::as_vector`].
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "sales_count",
    "sales_value",
    "sales_velocity",
    "days_since_sale",
    "category_rank",
    "category_percentile",
    "review_score",
    "wishlist_ratio",
    "days_in_stock",
    "seasonal_factor",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingFeatures {
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
}

impl PricingFeatures {
    pub fn from_history(product_id: i32, now: DateTime<Utc>, history: &ProductHistory) -> Self {
        let sales = &history.sales;
        Self {
            product_id,
            days_since_last_sale: days_since_last_sale(now, sales.last_sale_at),
            sales_velocity: sales_velocity(now, sales.first_recent_sale_at, sales.recent_count),
            total_sales_count: sales.total_count as i32,
            total_sales_value: sales.total_value,
            category_rank: history.standing.category_rank.unwrap_or(0) as i32,
            category_percentile: category_percentile(
                history.standing.category_rank.unwrap_or(0),
                history.standing.category_size,
            ),
            review_score: history.engagement.average_rating.unwrap_or(0.0),
            wishlist_to_sales_ratio: wishlist_to_sales_ratio(
                history.engagement.wishlist_count,
                sales.total_count,
            ),
            days_in_stock: days_in_stock(now, history.engagement.stocked_at),
            seasonal_factor: seasonal_factor(now.month()),
        }
    }

    pub fn as_vector(&self) -> [f64; FEATURE_COUNT] {
        [
            self.total_sales_count as f64,
            self.total_sales_value,
            self.sales_velocity,
            self.days_since_last_sale as f64,
            self.category_rank as f64,
            self.category_percentile,
            self.review_score,
            self.wishlist_to_sales_ratio,
            self.days_in_stock as f64,
            self.seasonal_factor,
        ]
    }

    pub fn to_row(&self, last_model_run: DateTime<Utc>) -> PricingFeaturesRow {
        PricingFeaturesRow {
            product_id: self.product_id,
            days_since_last_sale: self.days_since_last_sale,
            sales_velocity: self.sales_velocity,
            total_sales_count: self.total_sales_count,
            total_sales_value: self.total_sales_value,
            category_rank: self.category_rank,
            category_percentile: self.category_percentile,
            review_score: self.review_score,
            wishlist_to_sales_ratio: self.wishlist_to_sales_ratio,
            days_in_stock: self.days_in_stock,
            seasonal_factor: self.seasonal_factor,
            last_model_run,
        }
    }
}

#[derive(Debug, Clone, Default, QueryableByName)]
pub struct SalesSummary {
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub last_sale_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub first_recent_sale_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    pub recent_count: i64,
    #[diesel(sql_type = BigInt)]
    pub total_count: i64,
    #[diesel(sql_type = Double)]
    pub total_value: f64,
}

#[derive(Debug, Clone, Default, QueryableByName)]
pub struct CategoryStanding {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub category_rank: Option<i64>,
    #[diesel(sql_type = BigInt)]
    pub category_size: i64,
}

#[derive(Debug, Clone, Default, QueryableByName)]
pub struct Engagement {
    #[diesel(sql_type = Nullable<Double>)]
    pub average_rating: Option<f64>,
    #[diesel(sql_type = Integer)]
    pub wishlist_count: i32,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub stocked_at: Option<DateTime<Utc>>,
}

/// Raw aggregates read for one product, before fallbacks are applied.
#[derive(Debug, Clone, Default)]
pub struct ProductHistory {
    pub sales: SalesSummary,
    pub standing: CategoryStanding,
    pub engagement: Engagement,
}

const SALES_SUMMARY_QUERY: &str = r#"
    SELECT
        MAX(created_at) AS last_sale_at,
        MIN(created_at) FILTER (WHERE created_at > NOW() - INTERVAL '30 days') AS first_recent_sale_at,
        COUNT(*) FILTER (WHERE created_at > NOW() - INTERVAL '30 days') AS recent_count,
        COUNT(*) AS total_count,
        COALESCE(SUM(sale_price * quantity), 0)::float8 AS total_value
    FROM sales
    WHERE product_id = $1
"#;

// Ties on rating fall through to review count; equal pairs share a rank.
// Only products with metrics are ranked, but every active product counts
// towards the category size.
const CATEGORY_STANDING_QUERY: &str = r#"
    WITH target AS (
        SELECT category_id FROM products WHERE id = $1
    ),
    ranked AS (
        SELECT p.id,
               RANK() OVER (
                   ORDER BY COALESCE(pm.average_rating, 0) DESC,
                            pm.review_count DESC
               ) AS category_rank
        FROM products p
        JOIN product_metrics pm ON pm.product_id = p.id
        WHERE p.category_id = (SELECT category_id FROM target)
          AND p.is_active = TRUE
    )
    SELECT
        (SELECT category_rank FROM ranked WHERE id = $1) AS category_rank,
        (SELECT COUNT(*)
         FROM products
         WHERE category_id = (SELECT category_id FROM target)
           AND is_active = TRUE) AS category_size
"#;

const ENGAGEMENT_QUERY: &str = r#"
    SELECT pm.average_rating, pm.wishlist_count, s.created_at AS stocked_at
    FROM product_metrics pm
    LEFT JOIN stocks s ON s.product_id = pm.product_id
    WHERE pm.product_id = $1
"#;

/// Read-only queries over the store. Holds no state of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub async fn build(
        &self,
        conn: &mut AsyncPgConnection,
        product_id: i32,
    ) -> PricingResult<PricingFeatures> {
        let history = self.load_history(conn, product_id).await?;
        Ok(PricingFeatures::from_history(product_id, Utc::now(), &history))
    }

    pub async fn load_history(
        &self,
        conn: &mut AsyncPgConnection,
        product_id: i32,
    ) -> PricingResult<ProductHistory> {
        let sales = diesel::sql_query(SALES_SUMMARY_QUERY)
            .bind::<Integer, _>(product_id)
            .get_result::<SalesSummary>(conn)
            .await?;

        let standing = diesel::sql_query(CATEGORY_STANDING_QUERY)
            .bind::<Integer, _>(product_id)
            .get_result::<CategoryStanding>(conn)
            .await?;

        let engagement = diesel::sql_query(ENGAGEMENT_QUERY)
            .bind::<Integer, _>(product_id)
            .get_result::<Engagement>(conn)
            .await
            .optional()?
            .unwrap_or_default();

        Ok(ProductHistory {
            sales,
            standing,
            engagement,
        })
    }
}

pub fn days_since_last_sale(now: DateTime<Utc>, last_sale_at: Option<DateTime<Utc>>) -> i32 {
    match last_sale_at {
        Some(at) => (now - at).num_days().max(0) as i32,
        None => NO_SALES_DAYS_FALLBACK,
    }
}

/// Sales per day since the first sale inside the trailing window. A window
/// that opened less than a day ago counts as one day.
pub fn sales_velocity(
    now: DateTime<Utc>,
    first_recent_sale_at: Option<DateTime<Utc>>,
    recent_count: i64,
) -> f64 {
    match first_recent_sale_at {
        Some(first) if recent_count > 0 => {
            let days = (now - first).num_days().clamp(1, VELOCITY_WINDOW_DAYS);
            recent_count as f64 / days as f64
        }
        _ => 0.0,
    }
}

/// Higher is better; a product outside any ranking scores 0.
pub fn category_percentile(rank: i64, category_size: i64) -> f64 {
    if rank <= 0 || category_size <= 0 {
        return 0.0;
    }
    (1.0 - rank as f64 / category_size as f64) * 100.0
}

pub fn wishlist_to_sales_ratio(wishlist_count: i32, sales_count: i64) -> f64 {
    if sales_count == 0 {
        return 0.0;
    }
    wishlist_count as f64 / sales_count as f64
}

pub fn days_in_stock(now: DateTime<Utc>, stocked_at: Option<DateTime<Utc>>) -> i32 {
    stocked_at
        .map(|at| (now - at).num_days().max(0) as i32)
        .unwrap_or(0)
}

pub fn seasonal_factor(month: u32) -> f64 {
    match month {
        11 | 12 => 1.2,
        1 | 2 => 0.8,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn empty_history_uses_fallbacks() {
        let features = PricingFeatures::from_history(4, at(2024, 6, 10), &ProductHistory::default());

        assert_eq!(features.days_since_last_sale, NO_SALES_DAYS_FALLBACK);
        assert_eq!(features.sales_velocity, 0.0);
        assert_eq!(features.total_sales_count, 0);
        assert_eq!(features.total_sales_value, 0.0);
        assert_eq!(features.category_rank, 0);
        assert_eq!(features.category_percentile, 0.0);
        assert_eq!(features.review_score, 0.0);
        assert_eq!(features.wishlist_to_sales_ratio, 0.0);
        assert_eq!(features.days_in_stock, 0);
        assert_eq!(features.seasonal_factor, 1.0);
        assert!(features.as_vector().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn wishlist_without_sales_never_divides_by_zero() {
        assert_eq!(wishlist_to_sales_ratio(12, 0), 0.0);
        assert_eq!(wishlist_to_sales_ratio(12, 4), 3.0);
    }

    #[test]
    fn velocity_counts_per_day_since_first_recent_sale() {
        let now = at(2024, 6, 10);
        assert_eq!(sales_velocity(now, Some(now - Duration::days(10)), 5), 0.5);
        assert_eq!(sales_velocity(now, Some(now - Duration::hours(3)), 2), 2.0);
        assert_eq!(sales_velocity(now, None, 0), 0.0);
    }

    #[test]
    fn days_since_sale_tracks_most_recent_sale() {
        let now = at(2024, 6, 10);
        assert_eq!(days_since_last_sale(now, Some(now - Duration::days(3))), 3);
        assert_eq!(days_since_last_sale(now, Some(now)), 0);
    }

    #[test]
    fn percentile_is_relative_to_category_size() {
        assert_eq!(category_percentile(1, 4), 75.0);
        assert_eq!(category_percentile(4, 4), 0.0);
        assert_eq!(category_percentile(0, 4), 0.0);
        assert_eq!(category_percentile(1, 0), 0.0);
    }

    #[test]
    fn seasonal_factor_weights_holidays() {
        assert_eq!(seasonal_factor(12), 1.2);
        assert_eq!(seasonal_factor(11), 1.2);
        assert_eq!(seasonal_factor(1), 0.8);
        assert_eq!(seasonal_factor(2), 0.8);
        assert_eq!(seasonal_factor(7), 1.0);
    }

    #[test]
    fn full_history_maps_into_vector_order() {
        let now = at(2024, 12, 1);
        let history = ProductHistory {
            sales: SalesSummary {
                last_sale_at: Some(now - Duration::days(2)),
                first_recent_sale_at: Some(now - Duration::days(20)),
                recent_count: 10,
                total_count: 40,
                total_value: 800.0,
            },
            standing: CategoryStanding {
                category_rank: Some(2),
                category_size: 10,
            },
            engagement: Engagement {
                average_rating: Some(4.5),
                wishlist_count: 8,
                stocked_at: Some(now - Duration::days(90)),
            },
        };

        let features = PricingFeatures::from_history(1, now, &history);
        let expected = [40.0, 800.0, 0.5, 2.0, 2.0, 80.0, 4.5, 0.2, 90.0, 1.2];
        for (got, want) in features.as_vector().iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }
}
