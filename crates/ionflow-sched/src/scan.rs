//! Scan specifications and data-point combinatorics.

use ionflow_hal::{ParameterId, ParameterMap, ParameterValue};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::job::ScanParameter;

/// How the values of one scan axis are given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScanValues {
    /// Explicit value list.
    Explicit(Vec<ParameterValue>),
    /// `count` evenly spaced values from `start` to `stop` inclusive.
    Range {
        start: f64,
        stop: f64,
        count: usize,
        #[serde(default)]
        reverse: bool,
        #[serde(default)]
        shuffle: bool,
    },
}

impl ScanValues {
    /// Evenly spaced range.
    pub fn linspace(start: f64, stop: f64, count: usize) -> Self {
        ScanValues::Range {
            start,
            stop,
            count,
            reverse: false,
            shuffle: false,
        }
    }

    /// Expand into the ordered value list.
    pub fn expand(&self) -> SchedResult<Vec<ParameterValue>> {
        match self {
            ScanValues::Explicit(values) => Ok(values.clone()),
            ScanValues::Range {
                start,
                stop,
                count,
                reverse,
                shuffle,
            } => {
                if !start.is_finite() || !stop.is_finite() {
                    return Err(SchedError::Validation(format!(
                        "scan range bounds must be finite, got {start}..{stop}"
                    )));
                }
                let mut values: Vec<ParameterValue> = match *count {
                    0 => Vec::new(),
                    1 => vec![ParameterValue::Float(*start)],
                    n => {
                        let step = (stop - start) / (n - 1) as f64;
                        (0..n)
                            .map(|i| ParameterValue::Float(start + step * i as f64))
                            .collect()
                    }
                };
                if *reverse {
                    values.reverse();
                }
                if *shuffle {
                    values.shuffle(&mut rand::thread_rng());
                }
                Ok(values)
            }
        }
    }
}

/// Client-facing description of one scan axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    /// Variable identifier (device path or shared parameter id).
    pub variable_id: String,

    /// Owning device, if the variable lives on one.
    #[serde(default)]
    pub device: Option<String>,

    /// Values to scan.
    pub values: ScanValues,
}

impl ScanSpec {
    /// Axis over a shared parameter.
    pub fn shared(variable_id: impl Into<String>, values: ScanValues) -> Self {
        Self {
            variable_id: variable_id.into(),
            device: None,
            values,
        }
    }

    /// Axis over a device parameter.
    pub fn on_device(
        device: impl Into<String>,
        variable_id: impl Into<String>,
        values: ScanValues,
    ) -> Self {
        Self {
            variable_id: variable_id.into(),
            device: Some(device.into()),
            values,
        }
    }

    /// Resolve the identifier and expand the values.
    pub fn resolve(&self) -> SchedResult<ScanParameter> {
        let parameter = ParameterId::from_parts(&self.variable_id, self.device.as_deref())
            .map_err(|e| SchedError::Validation(e.to_string()))?;
        let scan = ScanParameter::new(parameter, self.values.expand()?);
        scan.validate()?;
        Ok(scan)
    }
}

/// One resolved combination of scan values, keyed by parameter key.
pub type Combination = Vec<(ParameterId, ParameterValue)>;

/// Convert a combination into a parameter map for merging.
pub fn combination_map(combination: &Combination) -> ParameterMap {
    combination
        .iter()
        .map(|(id, value)| (id.key(), value.clone()))
        .collect()
}

/// Number of data points a scan produces.
///
/// Returns `None` for continuous scans (no axes).
pub fn combination_count(scans: &[ScanParameter], repetitions: u32) -> Option<usize> {
    if scans.is_empty() {
        return None;
    }
    let per_pass: usize = scans.iter().map(|s| s.values.len()).product();
    Some(per_pass * repetitions as usize)
}

/// Cartesian product of all scan axes, whole set repeated `repetitions` times.
///
/// The first axis varies slowest. An empty `scans` yields an empty list,
/// which callers treat as continuous mode.
pub fn combinations(scans: &[ScanParameter], repetitions: u32) -> Vec<Combination> {
    if scans.is_empty() {
        return Vec::new();
    }

    let mut product: Vec<Combination> = vec![Vec::with_capacity(scans.len())];
    for scan in scans {
        let mut next = Vec::with_capacity(product.len() * scan.values.len());
        for prefix in &product {
            for value in &scan.values {
                let mut combo = prefix.clone();
                combo.push((scan.parameter.clone(), value.clone()));
                next.push(combo);
            }
        }
        product = next;
    }

    let per_pass = product.len();
    let mut all = Vec::with_capacity(per_pass * repetitions as usize);
    for _ in 0..repetitions {
        all.extend(product.iter().cloned());
    }
    all
}
