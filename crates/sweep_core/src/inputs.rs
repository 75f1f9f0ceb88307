//! Job inputs and the builder that realizes one combination into them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::enumerator::Combination;
use crate::error::TransformError;
use crate::keys::KeyNormalizer;
use crate::router::RouteTable;

/// Inputs of one job, grouped by namespace (top-level input slot).
///
/// Nested stage groups are plain objects inside a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInputs(Map<String, Value>);

impl JobInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.0.get(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains_key(namespace)
    }

    pub fn insert(&mut self, namespace: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(namespace.into(), value)
    }

    pub fn remove(&mut self, namespace: &str) -> Option<Value> {
        self.0.remove(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Copy of `namespace` as an object, empty when absent.
    pub(crate) fn object_at(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Map<String, Value>, TransformError> {
        match self.0.get(namespace) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(object)) => Ok(object.clone()),
            Some(_) => Err(TransformError::NotAnObject {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

impl From<Map<String, Value>> for JobInputs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Sets one flag of a key-value document.
///
/// Last write wins per normalized key; every other entry is left untouched.
pub fn set_parameter(
    document: &mut Map<String, Value>,
    key: &str,
    value: Value,
    normalizer: &dyn KeyNormalizer,
) {
    let canonical = normalizer.normalize(key);
    document.retain(|existing, _| normalizer.normalize(existing) != canonical);
    document.insert(canonical, value);
}

/// Looks a flag up by normalized key.
pub fn get_parameter<'a>(
    document: &'a Map<String, Value>,
    key: &str,
    normalizer: &dyn KeyNormalizer,
) -> Option<&'a Value> {
    let canonical = normalizer.normalize(key);
    document
        .iter()
        .find(|(existing, _)| normalizer.normalize(existing) == canonical)
        .map(|(_, value)| value)
}

/// Applies every axis of `combination`, in declaration order, on top of
/// `base`. Later axes observe what earlier axes wrote.
pub fn build_job_inputs(
    base: &JobInputs,
    combination: &Combination,
    routes: &RouteTable,
) -> Result<JobInputs, TransformError> {
    let mut inputs = base.clone();
    for (axis, value) in &combination.values {
        let route = routes.get(axis).ok_or_else(|| TransformError::Unrouted {
            axis: axis.clone(),
        })?;
        route.apply(value, &mut inputs)?;
    }
    Ok(inputs)
}
