use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::enumerator::AxisEnumerator;
use crate::error::ConfigurationError;

pub const SWEEP_STATE_SCHEMA_VERSION: &str = "v1";
pub const OUTCOME_RECORD_SCHEMA_VERSION: &str = "v1";
pub const MAX_AXIS_VALUES: usize = 10_000;
pub const MAX_TOTAL_COMBINATIONS: usize = 200_000;
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Axis name to ordered candidate values, in declaration order.
pub type IterateOver = IndexMap<String, Vec<Value>>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CombinationMode {
    /// Pair axes positionally; all axes must have the same length.
    #[default]
    Zip,
    /// Full cartesian cross, first-declared axis varying slowest.
    Product,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Axis {
    pub name: String,
    pub values: Vec<Value>,
}

impl Axis {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepRequest {
    pub run_id: String,
    pub iterate_over: IterateOver,
    #[serde(default)]
    pub iterate_mode: CombinationMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// A request that passed eager validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    pub run_id: String,
    pub axes: Vec<Axis>,
    pub mode: CombinationMode,
    pub batch_size: usize,
    pub total_combinations: usize,
}

impl SweepConfig {
    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|axis| axis.name.as_str())
    }
}

pub fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

pub fn normalize_request(payload: SweepRequest) -> Result<SweepConfig, ConfigurationError> {
    let run_id = payload.run_id.trim().to_string();
    if run_id.is_empty() {
        return Err(ConfigurationError::EmptyRunId);
    }

    if payload.iterate_over.is_empty() {
        return Err(ConfigurationError::NoAxes);
    }

    if payload.batch_size == 0 {
        return Err(ConfigurationError::InvalidBatchSize);
    }

    let mut axes = Vec::with_capacity(payload.iterate_over.len());
    for (name, values) in payload.iterate_over {
        if name.trim().is_empty() {
            return Err(ConfigurationError::BlankAxisName);
        }
        if values.is_empty() {
            return Err(ConfigurationError::EmptyAxis { name });
        }
        if values.len() > MAX_AXIS_VALUES {
            return Err(ConfigurationError::TooManyValues {
                name,
                limit: MAX_AXIS_VALUES,
            });
        }
        axes.push(Axis::new(name, values));
    }

    let total_combinations = AxisEnumerator::combination_count(&axes, payload.iterate_mode)?;
    if total_combinations > MAX_TOTAL_COMBINATIONS {
        return Err(ConfigurationError::SpaceTooLarge {
            limit: MAX_TOTAL_COMBINATIONS,
        });
    }

    Ok(SweepConfig {
        run_id,
        axes,
        mode: payload.iterate_mode,
        batch_size: payload.batch_size,
        total_combinations,
    })
}

pub fn contract_fingerprint(value: impl Serialize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stable_contract_json(value));
    format!("{:x}", hasher.finalize())
}

pub fn stable_contract_json(value: impl Serialize) -> String {
    serde_json::to_string(&value).expect("serialization of contract value should not fail")
}
