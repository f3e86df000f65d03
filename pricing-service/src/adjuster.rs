use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use shared::db::DbPool;
use shared::models::{
    NewPriceAdjustment, NewPriceModelCoefficients, PriceModelCoefficients, PricingFeaturesRow,
};
use shared::schema::{price_adjustments, price_model_coefficients, pricing_features, product_metrics, products};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::{PricingError, PricingResult};
use crate::features::{FeatureExtractor, PricingFeatures, FEATURE_COUNT};
use crate::regression::{self, FittedModel, Observation};

/// Reported with every adjustment. Not derived from the fit.
pub const CONFIDENCE_PLACEHOLDER: f32 = 0.85;

pub const SEED_MODEL_VERSION: &str = "v1.0";

const SEED_INTERCEPT: f64 = 100.0;
const SEED_COEFFICIENTS: [f64; FEATURE_COUNT] =
    [0.5, 0.01, 2.0, -0.1, -0.5, 0.3, 5.0, 2.0, -0.05, 10.0];

/// Outcome of one price recomputation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub product_id: i32,
    pub old_price: BigDecimal,
    pub new_price: BigDecimal,
    pub confidence: f32,
    pub model_version: String,
}

pub trait PriceAdjuster: Send + Sync {
    fn adjust_price(&self, product_id: i32) -> impl Future<Output = PricingResult<PriceQuote>> + Send;
}

/// Entry points driven by the scheduler.
pub trait PricingJobs: PriceAdjuster {
    fn active_product_ids(&self) -> impl Future<Output = PricingResult<Vec<i32>>> + Send;

    fn train_new_model(
        &self,
    ) -> impl Future<Output = PricingResult<PriceModelCoefficients>> + Send;
}

/// Coefficients of one stored model, laid out in feature vector order.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelWeights {
    pub version: String,
    pub intercept: f64,
    pub coefficients: [f64; FEATURE_COUNT],
}

impl ModelWeights {
    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        predict_price(self.intercept, &self.coefficients, features)
    }
}

impl From<&PriceModelCoefficients> for ModelWeights {
    fn from(row: &PriceModelCoefficients) -> Self {
        Self {
            version: row.model_version.clone(),
            intercept: row.intercept,
            coefficients: [
                row.sales_count_coef,
                row.sales_value_coef,
                row.sales_velocity_coef,
                row.days_since_sale_coef,
                row.category_rank_coef,
                row.category_percentile_coef,
                row.review_score_coef,
                row.wishlist_ratio_coef,
                row.days_in_stock_coef,
                row.seasonal_factor_coef,
            ],
        }
    }
}

pub fn predict_price(
    intercept: f64,
    coefficients: &[f64; FEATURE_COUNT],
    features: &[f64; FEATURE_COUNT],
) -> f64 {
    intercept
        + coefficients
            .iter()
            .zip(features)
            .map(|(c, x)| c * x)
            .sum::<f64>()
}

/// Converts a raw prediction into a storable price, rounded to cents.
pub fn to_price(product_id: i32, raw: f64) -> PricingResult<BigDecimal> {
    if !raw.is_finite() || raw < 0.0 {
        return Err(PricingError::InvalidPrice {
            product_id,
            price: raw,
        });
    }
    BigDecimal::from_f64(raw)
        .map(|price| price.round(2))
        .ok_or(PricingError::InvalidPrice {
            product_id,
            price: raw,
        })
}

pub fn generate_model_version(at: DateTime<Utc>) -> String {
    format!("v{}", at.format("%Y%m%d%H%M%S"))
}

fn coefficient_row(
    model_version: String,
    training_date: DateTime<Utc>,
    intercept: f64,
    c: [f64; FEATURE_COUNT],
    sample_size: i32,
    r_squared: f64,
) -> NewPriceModelCoefficients {
    NewPriceModelCoefficients {
        model_version,
        training_date,
        sample_size,
        r_squared,
        intercept,
        sales_count_coef: c[0],
        sales_value_coef: c[1],
        sales_velocity_coef: c[2],
        days_since_sale_coef: c[3],
        category_rank_coef: c[4],
        category_percentile_coef: c[5],
        review_score_coef: c[6],
        wishlist_ratio_coef: c[7],
        days_in_stock_coef: c[8],
        seasonal_factor_coef: c[9],
    }
}

pub fn seed_coefficients(now: DateTime<Utc>) -> NewPriceModelCoefficients {
    coefficient_row(
        SEED_MODEL_VERSION.to_string(),
        now,
        SEED_INTERCEPT,
        SEED_COEFFICIENTS,
        0,
        0.0,
    )
}

pub fn fitted_coefficients(now: DateTime<Utc>, model: &FittedModel) -> NewPriceModelCoefficients {
    coefficient_row(
        generate_model_version(now),
        now,
        model.intercept,
        model.coefficients,
        model.sample_size as i32,
        model.r_squared,
    )
}

#[derive(Clone)]
pub struct ModelService {
    pool: DbPool,
    extractor: FeatureExtractor,
    min_training_observations: usize,
}

impl ModelService {
    pub fn new(pool: DbPool, min_training_observations: usize) -> Self {
        Self {
            pool,
            extractor: FeatureExtractor,
            min_training_observations,
        }
    }

    /// Inserts the seed model when nothing has been trained yet. Returns
    /// whether a row was written.
    pub async fn initialize_pricing_model(&self) -> PricingResult<bool> {
        match self.latest_coefficients().await {
            Ok(latest) => {
                info!("Pricing model {} already present", latest.model_version);
                Ok(false)
            }
            Err(PricingError::NoCoefficients) => {
                let seed = seed_coefficients(Utc::now());
                self.save_model_coefficients(&seed).await?;
                info!("Seeded pricing model {}", seed.model_version);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn latest_coefficients(&self) -> PricingResult<PriceModelCoefficients> {
        let mut conn = self.pool.get().await?;
        load_latest_coefficients(&mut conn).await
    }

    pub async fn save_model_coefficients(
        &self,
        coefficients: &NewPriceModelCoefficients,
    ) -> PricingResult<PriceModelCoefficients> {
        let mut conn = self.pool.get().await?;
        let saved = diesel::insert_into(price_model_coefficients::table)
            .values(coefficients)
            .get_result::<PriceModelCoefficients>(&mut conn)
            .await?;
        Ok(saved)
    }

    /// When the product's feature snapshot was last refreshed, if ever.
    pub async fn last_model_run(&self, product_id: i32) -> PricingResult<Option<DateTime<Utc>>> {
        let mut conn = self.pool.get().await?;
        let last_run = pricing_features::table
            .filter(pricing_features::product_id.eq(product_id))
            .select(pricing_features::last_model_run)
            .first::<DateTime<Utc>>(&mut conn)
            .await
            .optional()?;
        Ok(last_run)
    }

    async fn adjust(&self, product_id: i32) -> PricingResult<PriceQuote> {
        let mut conn = self.pool.get().await?;

        let weights = ModelWeights::from(&load_latest_coefficients(&mut conn).await?);
        let features = self.extractor.build(&mut conn, product_id).await?;
        let new_price = to_price(product_id, weights.predict(&features.as_vector()))?;

        let now = Utc::now();
        let snapshot = features.to_row(now);
        let model_version = weights.version.clone();
        let price = new_price.clone();

        let old_price = conn
            .transaction::<_, PricingError, _>(|conn| {
                Box::pin(async move {
                    let old_price: BigDecimal = product_metrics::table
                        .filter(product_metrics::product_id.eq(product_id))
                        .select(product_metrics::adjusted_price)
                        .for_update()
                        .get_result(conn)
                        .await
                        .optional()?
                        .ok_or(PricingError::ProductNotFound(product_id))?;

                    let adjustment = NewPriceAdjustment {
                        product_id,
                        old_price: old_price.clone(),
                        new_price: price,
                        model_version,
                        confidence_score: CONFIDENCE_PLACEHOLDER,
                    };
                    diesel::insert_into(price_adjustments::table)
                        .values(&adjustment)
                        .execute(conn)
                        .await?;

                    diesel::update(
                        product_metrics::table.filter(product_metrics::product_id.eq(product_id)),
                    )
                    .set((
                        product_metrics::adjusted_price.eq(&adjustment.new_price),
                        product_metrics::last_price_update.eq(Some(now)),
                    ))
                    .execute(conn)
                    .await?;

                    upsert_snapshot(conn, &snapshot).await?;

                    Ok(old_price)
                })
            })
            .await?;

        debug!(
            "Product {} repriced {} -> {} with model {}",
            product_id, old_price, new_price, weights.version
        );

        Ok(PriceQuote {
            product_id,
            old_price,
            new_price,
            confidence: CONFIDENCE_PLACEHOLDER,
            model_version: weights.version,
        })
    }

    async fn active_ids(&self) -> PricingResult<Vec<i32>> {
        let mut conn = self.pool.get().await?;
        let ids = products::table
            .filter(products::is_active.eq(true))
            .select(products::id)
            .order(products::id.asc())
            .load::<i32>(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Refreshes every active product's feature snapshot, fits a new model
    /// against the current prices and stores it as a new version.
    async fn train(&self) -> PricingResult<PriceModelCoefficients> {
        let ids = self.active_ids().await?;
        let mut conn = self.pool.get().await?;

        let prices: HashMap<i32, BigDecimal> = product_metrics::table
            .filter(product_metrics::product_id.eq_any(&ids))
            .select((product_metrics::product_id, product_metrics::adjusted_price))
            .load::<(i32, BigDecimal)>(&mut conn)
            .await?
            .into_iter()
            .collect();

        let now = Utc::now();
        let mut observations = Vec::with_capacity(ids.len());
        for product_id in ids {
            let Some(price) = prices.get(&product_id).and_then(|p| p.to_f64()) else {
                warn!("Product {} has no current price, left out of training", product_id);
                continue;
            };
            match self.refresh_snapshot(&mut conn, product_id, now).await {
                Ok(features) => observations.push(Observation {
                    features: features.as_vector(),
                    price,
                }),
                Err(e) => warn!("Skipping product {} in training: {}", product_id, e),
            }
        }

        let model = regression::fit(&observations, self.min_training_observations)?;
        let saved = self
            .save_model_coefficients(&fitted_coefficients(now, &model))
            .await?;

        info!(
            "Trained pricing model {} on {} products (r2 = {:.4})",
            saved.model_version, saved.sample_size, saved.r_squared
        );
        Ok(saved)
    }

    async fn refresh_snapshot(
        &self,
        conn: &mut AsyncPgConnection,
        product_id: i32,
        now: DateTime<Utc>,
    ) -> PricingResult<PricingFeatures> {
        let features = self.extractor.build(conn, product_id).await?;
        upsert_snapshot(conn, &features.to_row(now)).await?;
        Ok(features)
    }
}

impl PriceAdjuster for ModelService {
    fn adjust_price(&self, product_id: i32) -> impl Future<Output = PricingResult<PriceQuote>> + Send {
        self.adjust(product_id)
    }
}

impl PricingJobs for ModelService {
    fn active_product_ids(&self) -> impl Future<Output = PricingResult<Vec<i32>>> + Send {
        self.active_ids()
    }

    fn train_new_model(
        &self,
    ) -> impl Future<Output = PricingResult<PriceModelCoefficients>> + Send {
        self.train()
    }
}

async fn load_latest_coefficients(
    conn: &mut AsyncPgConnection,
) -> PricingResult<PriceModelCoefficients> {
    price_model_coefficients::table
        .order((
            price_model_coefficients::training_date.desc(),
            price_model_coefficients::id.desc(),
        ))
        .first::<PriceModelCoefficients>(conn)
        .await
        .optional()?
        .ok_or(PricingError::NoCoefficients)
}

async fn upsert_snapshot(
    conn: &mut AsyncPgConnection,
    row: &PricingFeaturesRow,
) -> PricingResult<()> {
    diesel::insert_into(pricing_features::table)
        .values(row)
        .on_conflict(pricing_features::product_id)
        .do_update()
        .set(row)
        .execute(conn)
        .await?;
    Ok(())
}
