//! Random quantities used by module states.
//!
//! Two generations of syntax are accepted. The legacy form uses `exact` /
//! `range` objects directly on a state; the newer form uses a
//! `distribution` object with a `kind` and named `parameters`:
//!
//! ```json
//! {"kind": "GAUSSIAN", "round": true, "parameters": {"mean": 7, "standardDeviation": 2}}
//! ```

use crate::time::TimeUnit;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A sampled numeric distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDistribution")]
pub struct Distribution {
    pub shape: Shape,
    /// Round samples to the nearest integer.
    pub round: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Exact { value: f64 },
    Uniform { low: f64, high: f64 },
    Gaussian { mean: f64, standard_deviation: f64 },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum RawKind {
    Exact,
    Uniform,
    Gaussian,
}

#[derive(Debug, Deserialize)]
struct RawDistribution {
    kind: RawKind,
    #[serde(default)]
    round: bool,
    #[serde(default)]
    parameters: BTreeMap<String, f64>,
}

impl TryFrom<RawDistribution> for Distribution {
    type Error = String;

    fn try_from(raw: RawDistribution) -> Result<Self, Self::Error> {
        let param = |name: &str| {
            raw.parameters
                .get(name)
                .copied()
                .ok_or_else(|| format!("distribution is missing parameter '{}'", name))
        };

        let shape = match raw.kind {
            RawKind::Exact => Shape::Exact {
                value: param("value")?,
            },
            RawKind::Uniform => {
                let (low, high) = (param("low")?, param("high")?);
                if low > high {
                    return Err(format!("uniform distribution low {} > high {}", low, high));
                }
                Shape::Uniform { low, high }
            }
            RawKind::Gaussian => {
                let standard_deviation = param("standardDeviation")?;
                if standard_deviation < 0.0 {
                    return Err("gaussian standardDeviation must not be negative".to_string());
                }
                Shape::Gaussian {
                    mean: param("mean")?,
                    standard_deviation,
                }
            }
        };

        Ok(Self {
            shape,
            round: raw.round,
        })
    }
}

impl Distribution {
    pub fn exact(value: f64) -> Self {
        Self {
            shape: Shape::Exact { value },
            round: false,
        }
    }

    pub fn uniform(low: f64, high: f64) -> Self {
        Self {
            shape: Shape::Uniform { low, high },
            round: false,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let value = match self.shape {
            Shape::Exact { value } => value,
            Shape::Uniform { low, high } => uniform(rng, low, high),
            Shape::Gaussian {
                mean,
                standard_deviation,
            } => mean + standard_deviation * standard_normal(rng),
        };
        if self.round {
            value.round()
        } else {
            value
        }
    }
}

/// Uniform sample in `[low, high)`; returns `low` for an empty interval.
pub fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    low + (high - low) * rng.gen::<f64>()
}

/// Standard normal sample via the Box-Muller transform.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // 1 - u keeps the logarithm argument in (0, 1]
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Legacy `exact` value: `{"quantity": 3}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Exact {
    pub quantity: f64,
}

/// Legacy `range` value: `{"low": 1, "high": 3, "decimals": 1}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub decimals: Option<u32>,
}

impl Range {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let value = uniform(rng, self.low, self.high);
        match self.decimals {
            Some(decimals) => {
                let scale = 10f64.powi(decimals as i32);
                (value * scale).round() / scale
            }
            None => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExactWithUnit {
    pub quantity: f64,
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeWithUnit {
    pub low: f64,
    pub high: f64,
    pub unit: TimeUnit,
}

/// A length of simulated time, drawn once when a state is first processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Span {
    Exact(ExactWithUnit),
    Range(RangeWithUnit),
    Sampled {
        distribution: Distribution,
        unit: TimeUnit,
    },
}

impl Span {
    /// Builds a span from the optional fields a state may carry.
    ///
    /// Returns `Ok(None)` when no field is set and an error when more than
    /// one form is given or a distribution has no unit.
    pub fn from_parts(
        exact: Option<ExactWithUnit>,
        range: Option<RangeWithUnit>,
        distribution: Option<Distribution>,
        unit: Option<TimeUnit>,
    ) -> Result<Option<Self>, String> {
        match (exact, range, distribution) {
            (None, None, None) => Ok(None),
            (Some(exact), None, None) => Ok(Some(Span::Exact(exact))),
            (None, Some(range), None) => {
                if range.low > range.high {
                    return Err(format!("range low {} > high {}", range.low, range.high));
                }
                Ok(Some(Span::Range(range)))
            }
            (None, None, Some(distribution)) => {
                let unit = unit.ok_or("distribution requires a 'unit'")?;
                Ok(Some(Span::Sampled { distribution, unit }))
            }
            _ => Err("only one of 'exact', 'range' or 'distribution' may be set".to_string()),
        }
    }

    /// Draws the span length in milliseconds.
    pub fn millis<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        match self {
            Span::Exact(exact) => exact.unit.to_millis(exact.quantity),
            Span::Range(range) => range.unit.to_millis(uniform(rng, range.low, range.high)),
            Span::Sampled { distribution, unit } => {
                // whole units, matching the legacy integer delay semantics
                unit.to_millis(distribution.sample(rng).trunc())
            }
        }
    }

    /// Smallest length this span can produce, in milliseconds.
    pub fn min_millis(&self) -> Option<i64> {
        match self {
            Span::Exact(exact) => Some(exact.unit.to_millis(exact.quantity)),
            Span::Range(range) => Some(range.unit.to_millis(range.low)),
            Span::Sampled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DAY;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_distributions() {
        let d: Distribution = serde_json::from_value(serde_json::json!({
            "kind": "UNIFORM",
            "parameters": {"low": 2, "high": 4}
        }))
        .unwrap();
        assert_eq!(d.shape, Shape::Uniform { low: 2.0, high: 4.0 });
        assert!(!d.round);

        let d: Distribution = serde_json::from_value(serde_json::json!({
            "kind": "GAUSSIAN",
            "round": true,
            "parameters": {"mean": 10, "standardDeviation": 1.5}
        }))
        .unwrap();
        assert!(d.round);
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let result = serde_json::from_value::<Distribution>(serde_json::json!({
            "kind": "GAUSSIAN",
            "parameters": {"mean": 10}
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<Distribution>(serde_json::json!({
            "kind": "POISSON",
            "parameters": {"mean": 10}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let d = Distribution::uniform(5.0, 6.0);
        for _ in 0..1000 {
            let v = d.sample(&mut rng);
            assert!((5.0..6.0).contains(&v));
        }
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(11);
        let d = Distribution {
            shape: Shape::Gaussian {
                mean: 50.0,
                standard_deviation: 5.0,
            },
            round: false,
        };
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| d.sample(&mut rng)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 50.0).abs() < 0.3, "mean {}", mean);
        assert!((var.sqrt() - 5.0).abs() < 0.3, "sd {}", var.sqrt());
    }

    #[test]
    fn test_range_decimals() {
        let mut rng = StdRng::seed_from_u64(3);
        let r = Range {
            low: 1.0,
            high: 2.0,
            decimals: Some(1),
        };
        for _ in 0..100 {
            let v = r.sample(&mut rng);
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_span_forms() {
        let exact = ExactWithUnit {
            quantity: 3.0,
            unit: TimeUnit::Days,
        };
        let span = Span::from_parts(Some(exact), None, None, None)
            .unwrap()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(span.millis(&mut rng), 3 * DAY);

        assert!(Span::from_parts(None, None, None, None).unwrap().is_none());
        assert!(Span::from_parts(None, None, Some(Distribution::exact(1.0)), None).is_err());
        let range = RangeWithUnit {
            low: 1.0,
            high: 2.0,
            unit: TimeUnit::Days,
        };
        assert!(Span::from_parts(Some(exact), Some(range), None, None).is_err());
    }
}
