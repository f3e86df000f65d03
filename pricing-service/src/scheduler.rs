use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use crate::adjuster::PricingJobs;
use crate::error::PricingResult;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub adjusted: usize,
    pub failed: Vec<i32>,
}

/// Reprices every active product in fixed-size batches. A failing product
/// is logged and skipped; only listing the products can fail the sweep.
pub async fn adjust_all_prices<J: PricingJobs>(
    jobs: &J,
    config: &SweepConfig,
) -> PricingResult<SweepReport> {
    let ids = jobs.active_product_ids().await?;
    let mut report = SweepReport::default();

    for (index, batch) in ids.chunks(config.batch_size.max(1)).enumerate() {
        if index > 0 && !config.batch_pause.is_zero() {
            time::sleep(config.batch_pause).await;
        }
        for &product_id in batch {
            match jobs.adjust_price(product_id).await {
                Ok(_) => report.adjusted += 1,
                Err(e) => {
                    warn!("Error adjusting price for product {}: {}", product_id, e);
                    report.failed.push(product_id);
                }
            }
        }
    }

    info!(
        "Price sweep finished: {} adjusted, {} failed",
        report.adjusted,
        report.failed.len()
    );
    Ok(report)
}

/// First instant of the calendar month after `now`, in UTC.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now + chrono::Duration::days(31))
}

pub struct Scheduler<J> {
    jobs: J,
    sweep: SweepConfig,
    sweep_interval: Duration,
}

impl<J: PricingJobs> Scheduler<J> {
    pub fn new(jobs: J, sweep: SweepConfig, sweep_interval: Duration) -> Self {
        Self {
            jobs,
            sweep,
            sweep_interval,
        }
    }

    /// Runs the periodic sweep and the monthly retrain side by side.
    pub async fn run(self) {
        tokio::join!(self.run_sweeps(), self.run_retraining());
    }

    async fn run_sweeps(&self) {
        let mut interval = time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        loop {
            interval.tick().await;
            if let Err(e) = adjust_all_prices(&self.jobs, &self.sweep).await {
                error!("Scheduled price sweep failed: {}", e);
            }
        }
    }

    async fn run_retraining(&self) {
        let mut next = next_month_start(Utc::now());
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!("Next model retrain at {}", next);
            time::sleep(wait).await;

            match self.jobs.train_new_model().await {
                Ok(model) => info!("Monthly retrain produced model {}", model.model_version),
                Err(e) => error!("Monthly retrain failed, keeping current model: {}", e),
            }
            next = next_month_start(next);
        }
    }
}
