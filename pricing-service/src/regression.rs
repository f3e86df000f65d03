//! Ordinary least squares over a cross-sectional snapshot of products.
//!
//! Predictors are standardised before solving the normal equations so that
//! lifetime sales value (thousands) and ratios (fractions) share a scale.
//! A predictor with no variance across the snapshot carries no information;
//! it is left out of the solve and its weight is reported as zero.

use crate::error::{PricingError, PricingResult};
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};

const VARIANCE_FLOOR: f64 = 1e-12;
const PIVOT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub features: [f64; FEATURE_COUNT],
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    pub intercept: f64,
    pub coefficients: [f64; FEATURE_COUNT],
    pub r_squared: f64,
    pub sample_size: usize,
}

impl FittedModel {
    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }
}

pub fn fit(observations: &[Observation], min_observations: usize) -> PricingResult<FittedModel> {
    let n = observations.len();
    if n < min_observations {
        return Err(PricingError::InsufficientObservations {
            required: min_observations,
            available: n,
        });
    }

    if observations
        .iter()
        .any(|o| !o.price.is_finite() || o.features.iter().any(|x| !x.is_finite()))
    {
        return Err(PricingError::DegenerateFit(
            "non-finite value in training data".to_string(),
        ));
    }

    let count = n as f64;
    let mut means = [0.0; FEATURE_COUNT];
    for obs in observations {
        for (mean, x) in means.iter_mut().zip(obs.features) {
            *mean += x / count;
        }
    }
    let mean_price = observations.iter().map(|o| o.price).sum::<f64>() / count;

    let mut scales = [0.0; FEATURE_COUNT];
    for (j, scale) in scales.iter_mut().enumerate() {
        let variance = observations
            .iter()
            .map(|o| (o.features[j] - means[j]).powi(2))
            .sum::<f64>()
            / count;
        *scale = variance.sqrt();
    }

    let active: Vec<usize> = (0..FEATURE_COUNT)
        .filter(|&j| scales[j] * scales[j] > VARIANCE_FLOOR)
        .collect();

    let required = min_observations.max(active.len() + 2);
    if n < required {
        return Err(PricingError::InsufficientObservations {
            required,
            available: n,
        });
    }

    let k = active.len();
    let mut normal = vec![vec![0.0; k]; k];
    let mut rhs = vec![0.0; k];
    for obs in observations {
        let z: Vec<f64> = active
            .iter()
            .map(|&j| (obs.features[j] - means[j]) / scales[j])
            .collect();
        let y = obs.price - mean_price;
        for a in 0..k {
            rhs[a] += z[a] * y;
            for b in 0..k {
                normal[a][b] += z[a] * z[b];
            }
        }
    }

    let solution = solve(normal, rhs, count).ok_or_else(|| {
        let names: Vec<&str> = active.iter().map(|&j| FEATURE_NAMES[j]).collect();
        PricingError::DegenerateFit(format!(
            "predictors are collinear: {}",
            names.join(", ")
        ))
    })?;

    let mut coefficients = [0.0; FEATURE_COUNT];
    for (slot, &j) in active.iter().enumerate() {
        coefficients[j] = solution[slot] / scales[j];
    }
    let intercept = mean_price
        - coefficients
            .iter()
            .zip(means)
            .map(|(c, m)| c * m)
            .sum::<f64>();

    if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
        return Err(PricingError::DegenerateFit(
            "solver produced non-finite coefficients".to_string(),
        ));
    }

    let mut model = FittedModel {
        intercept,
        coefficients,
        r_squared: 0.0,
        sample_size: n,
    };
    model.r_squared = r_squared(&model, observations, mean_price);
    Ok(model)
}

fn r_squared(model: &FittedModel, observations: &[Observation], mean_price: f64) -> f64 {
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for obs in observations {
        ss_res += (obs.price - model.predict(&obs.features)).powi(2);
        ss_tot += (obs.price - mean_price).powi(2);
    }
    if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res <= f64::EPSILON {
        1.0
    } else {
        0.0
    }
}

/// Gaussian elimination with partial pivoting. `None` when the system is
/// singular relative to `scale` (the diagonal of a standardised Gram matrix).
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>, scale: f64) -> Option<Vec<f64>> {
    let k = b.len();
    let tolerance = PIVOT_TOLERANCE * scale.max(1.0);

    for col in 0..k {
        let pivot = (col..k).max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))?;
        if a[pivot][col].abs() < tolerance {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..k {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for c in col..k {
                a[row][c] -= factor * a[col][c];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; k];
    for row in (0..k).rev() {
        let tail: f64 = (row + 1..k).map(|c| a[row][c] * x[c]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random values in [0, 1).
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    fn synthetic(n: usize, seasonal: f64) -> Vec<Observation> {
        let mut rng = Lcg(42);
        (0..n)
            .map(|_| {
                let mut features = [0.0; FEATURE_COUNT];
                for x in features.iter_mut().take(FEATURE_COUNT - 1) {
                    *x = rng.next() * 50.0;
                }
                features[FEATURE_COUNT - 1] = seasonal;
                let price = 5.0 + 2.0 * features[0] + 0.5 * features[2] - 0.25 * features[6];
                Observation { features, price }
            })
            .collect()
    }

    #[test]
    fn recovers_exact_linear_relationship() {
        let model = fit(&synthetic(40, 1.2), 12).unwrap();

        assert!((model.intercept - 5.0).abs() < 1e-6, "{}", model.intercept);
        assert!((model.coefficients[0] - 2.0).abs() < 1e-8);
        assert!((model.coefficients[2] - 0.5).abs() < 1e-8);
        assert!((model.coefficients[6] + 0.25).abs() < 1e-8);
        assert!(model.coefficients[1].abs() < 1e-8);
        assert!((model.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(model.sample_size, 40);
    }

    #[test]
    fn constant_predictor_is_absorbed_by_intercept() {
        let model = fit(&synthetic(30, 0.8), 12).unwrap();
        assert_eq!(model.coefficients[FEATURE_COUNT - 1], 0.0);
        assert!((model.intercept - 5.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_too_few_observations() {
        let err = fit(&synthetic(5, 1.0), 12).unwrap_err();
        assert!(matches!(
            err,
            PricingError::InsufficientObservations {
                required: 12,
                available: 5
            }
        ));
    }

    #[test]
    fn needs_more_rows_than_varying_predictors() {
        // nine varying predictors need at least eleven rows
        let err = fit(&synthetic(10, 1.0), 2).unwrap_err();
        assert!(matches!(
            err,
            PricingError::InsufficientObservations {
                required: 11,
                available: 10
            }
        ));
    }

    #[test]
    fn collinear_predictors_are_degenerate() {
        let mut data = synthetic(30, 1.0);
        for obs in data.iter_mut() {
            obs.features[3] = obs.features[0];
        }
        let err = fit(&data, 12).unwrap_err();
        assert!(matches!(err, PricingError::DegenerateFit(_)));
    }

    #[test]
    fn non_finite_input_is_degenerate() {
        let mut data = synthetic(30, 1.0);
        data[4].price = f64::NAN;
        assert!(matches!(
            fit(&data, 12).unwrap_err(),
            PricingError::DegenerateFit(_)
        ));
    }

    #[test]
    fn all_constant_predictors_fit_the_mean() {
        let data: Vec<Observation> = (0..12)
            .map(|i| Observation {
                features: [1.0; FEATURE_COUNT],
                price: if i % 2 == 0 { 90.0 } else { 110.0 },
            })
            .collect();
        let model = fit(&data, 12).unwrap();
        assert_eq!(model.coefficients, [0.0; FEATURE_COUNT]);
        assert!((model.intercept - 100.0).abs() < 1e-9);
        assert_eq!(model.r_squared, 0.0);
    }
}
