//! Deterministic enumeration of axis combinations.
//!
//! The enumerator never holds iteration state. A combination is a pure
//! function of `(axes, mode, index)`, so the sequence can be regenerated from
//! a persisted cursor after the process that started the sweep is gone.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{Axis, CombinationMode};
use crate::error::ConfigurationError;

/// One point of the sweep space: a value for every axis, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Combination {
    pub index: usize,
    pub values: IndexMap<String, Value>,
}

impl Combination {
    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.values.get(axis)
    }

    /// `"axis": value` pairs, one per line, for progress reports.
    pub fn describe(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| format!("\"{name}\": {value}"))
            .collect::<Vec<_>>()
            .join("\n\t")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Next {
        combination: Combination,
        cursor: usize,
    },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxisEnumerator {
    axes: Vec<Axis>,
    mode: CombinationMode,
    len: usize,
}

impl AxisEnumerator {
    pub fn new(axes: Vec<Axis>, mode: CombinationMode) -> Result<Self, ConfigurationError> {
        let len = Self::combination_count(&axes, mode)?;
        Ok(Self { axes, mode, len })
    }

    /// Size of the combination space, validating zip lengths on the way.
    pub fn combination_count(
        axes: &[Axis],
        mode: CombinationMode,
    ) -> Result<usize, ConfigurationError> {
        let Some(first) = axes.first() else {
            return Err(ConfigurationError::NoAxes);
        };

        match mode {
            CombinationMode::Zip => {
                let expected = first.len();
                for axis in &axes[1..] {
                    if axis.len() != expected {
                        return Err(ConfigurationError::MismatchedAxisLength {
                            axis: axis.name.clone(),
                            expected,
                            found: axis.len(),
                        });
                    }
                }
                Ok(expected)
            }
            CombinationMode::Product => axes.iter().try_fold(1usize, |total, axis| {
                total
                    .checked_mul(axis.len())
                    .ok_or(ConfigurationError::SpaceTooLarge { limit: usize::MAX })
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> CombinationMode {
        self.mode
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn combination_at(&self, index: usize) -> Option<Combination> {
        if index >= self.len {
            return None;
        }

        let values = match self.mode {
            CombinationMode::Zip => self
                .axes
                .iter()
                .map(|axis| (axis.name.clone(), axis.values[index].clone()))
                .collect(),
            CombinationMode::Product => {
                // Mixed radix: the last axis is the least significant digit.
                let mut digits = vec![0usize; self.axes.len()];
                let mut remainder = index;
                for (position, axis) in self.axes.iter().enumerate().rev() {
                    let radix = axis.len();
                    digits[position] = remainder % radix;
                    remainder /= radix;
                }
                self.axes
                    .iter()
                    .zip(digits)
                    .map(|(axis, digit)| (axis.name.clone(), axis.values[digit].clone()))
                    .collect()
            }
        };

        Some(Combination { index, values })
    }

    pub fn next(&self, cursor: usize) -> Step {
        match self.combination_at(cursor) {
            Some(combination) => Step::Next {
                combination,
                cursor: cursor + 1,
            },
            None => Step::Exhausted,
        }
    }

    pub fn is_exhausted_at(&self, cursor: usize) -> bool {
        cursor >= self.len
    }

    pub fn iter_from(&self, cursor: usize) -> impl Iterator<Item = Combination> + '_ {
        (cursor..self.len).filter_map(move |index| self.combination_at(index))
    }
}
