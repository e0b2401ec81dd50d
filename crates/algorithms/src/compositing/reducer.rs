//! Per-pixel aggregation operators for seasonal composites

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use terratrend_core::{Error, Result};

/// Aggregation operator applied across the frames of a seasonal window.
///
/// Textual forms: `sum`, `mean`, `median`, `min`, `max`, `count`, and
/// `pNN` for the NN-th percentile (e.g. `p90`, `p2.5`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Reducer {
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Count,
    /// Percentile in `0..=100`, linearly interpolated between closest ranks
    Percentile(f64),
}

impl Reducer {
    /// Reduce a set of valid observations. `None` when there are none.
    ///
    /// `values` may be reordered.
    pub fn reduce(&self, values: &mut [f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let result = match self {
            Reducer::Sum => values.iter().sum(),
            Reducer::Mean => values.iter().sum::<f64>() / n,
            Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reducer::Count => n,
            Reducer::Median => percentile(values, 50.0),
            Reducer::Percentile(p) => percentile(values, *p),
        };
        Some(result)
    }

    fn validate(self) -> Result<Self> {
        match self {
            Reducer::Percentile(p) if !(0.0..=100.0).contains(&p) => Err(Error::InvalidParameter {
                name: "reducer",
                value: format!("p{p}"),
                reason: "percentile must lie in 0..=100".to_string(),
            }),
            other => Ok(other),
        }
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = p / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}

impl FromStr for Reducer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let reducer = match lower.as_str() {
            "sum" | "total" => Reducer::Sum,
            "mean" | "avg" => Reducer::Mean,
            "median" => Reducer::Median,
            "min" => Reducer::Min,
            "max" => Reducer::Max,
            "count" => Reducer::Count,
            other => {
                let digits = other
                    .strip_prefix("percentile")
                    .or_else(|| other.strip_prefix('p'))
                    .map(|d| d.trim_start_matches([':', '_', ' ']));
                match digits.and_then(|d| d.parse::<f64>().ok()) {
                    Some(p) => Reducer::Percentile(p),
                    None => {
                        return Err(Error::InvalidParameter {
                            name: "reducer",
                            value: s.to_string(),
                            reason: "expected sum, mean, median, min, max, count or pNN".to_string(),
                        })
                    }
                }
            }
        };
        reducer.validate()
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Sum => f.write_str("sum"),
            Reducer::Mean => f.write_str("mean"),
            Reducer::Median => f.write_str("median"),
            Reducer::Min => f.write_str("min"),
            Reducer::Max => f.write_str("max"),
            Reducer::Count => f.write_str("count"),
            Reducer::Percentile(p) => write!(f, "p{p}"),
        }
    }
}

impl TryFrom<String> for Reducer {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Reducer> for String {
    fn from(value: Reducer) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_basic_reducers() {
        let obs = [3.0, 1.0, 4.0, 1.0, 5.0];
        let run = |r: Reducer| r.reduce(&mut obs.clone()).unwrap();

        assert_relative_eq!(run(Reducer::Sum), 14.0);
        assert_relative_eq!(run(Reducer::Mean), 2.8);
        assert_relative_eq!(run(Reducer::Median), 3.0);
        assert_relative_eq!(run(Reducer::Min), 1.0);
        assert_relative_eq!(run(Reducer::Max), 5.0);
        assert_relative_eq!(run(Reducer::Count), 5.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let mut obs = [10.0, 20.0, 30.0, 40.0];
        assert_relative_eq!(Reducer::Median.reduce(&mut obs).unwrap(), 25.0);
        assert_relative_eq!(Reducer::Percentile(90.0).reduce(&mut obs).unwrap(), 37.0);
        assert_relative_eq!(Reducer::Percentile(0.0).reduce(&mut obs).unwrap(), 10.0);
        assert_relative_eq!(Reducer::Percentile(100.0).reduce(&mut obs).unwrap(), 40.0);
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(Reducer::Sum.reduce(&mut []), None);
        assert_eq!(Reducer::Count.reduce(&mut []), None);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("SUM".parse::<Reducer>().unwrap(), Reducer::Sum);
        assert_eq!("p90".parse::<Reducer>().unwrap(), Reducer::Percentile(90.0));
        assert_eq!("percentile:2.5".parse::<Reducer>().unwrap(), Reducer::Percentile(2.5));
        assert!("p150".parse::<Reducer>().is_err());
        assert!("mode".parse::<Reducer>().is_err());
        assert_eq!(Reducer::Percentile(75.0).to_string(), "p75");
    }

    #[test]
    fn test_serde_uses_strings() {
        #[derive(Deserialize)]
        struct Holder {
            op: Reducer,
        }
        let h: Holder = serde_json::from_str(r#"{"op": "median"}"#).unwrap();
        assert_eq!(h.op, Reducer::Median);
        let bad: std::result::Result<Holder, _> = serde_json::from_str(r#"{"op": "mode"}"#);
        assert!(bad.is_err());
    }
}
