//! Key routing: which input namespace an axis writes to, and how.
//!
//! A [`KeyRouter`] is an immutable, ordered list of rule groups plus a set of
//! pass-through input slots. Resolution runs in three passes:
//!
//! 1. a pass-through slot with the axis' normalized name takes the raw value;
//! 2. the first group whose override table lists the key wins, with the
//!    override's defaults bound into the resolved [`Route`];
//! 3. the first group whose condition matches supplies its namespace and
//!    transform.
//!
//! Nested rules ([`RouterRule::nested`]) strip a stage prefix and resolve the
//! remainder against an inner router, writing into the stage's own group.
//! When the inner router cannot place the remainder, later groups are tried.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{ConfigurationError, TransformError};
use crate::inputs::{set_parameter, JobInputs};
use crate::keys::{FdfKeyNormalizer, KeyNormalizer};

pub type SharedNormalizer = Arc<dyn KeyNormalizer>;

/// Per-key defaults bound into a route at configuration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Value>,
}

impl ParamDefaults {
    pub fn with_units(units: impl Into<String>) -> Self {
        Self {
            units: Some(units.into()),
            ..Self::default()
        }
    }

    pub fn init_value(mut self, value: Value) -> Self {
        self.init_value = Some(value);
        self
    }

    pub fn step(mut self, value: Value) -> Self {
        self.step = Some(value);
        self
    }
}

pub struct TransformContext<'a> {
    pub key: &'a str,
    pub namespace: &'a str,
    pub defaults: &'a ParamDefaults,
    pub normalizer: &'a dyn KeyNormalizer,
}

/// Caller-supplied transform: `(value, current namespace) -> new namespace`.
pub trait ValueTransform: Send + Sync + fmt::Debug {
    fn apply(
        &self,
        value: &Value,
        current: Option<&Value>,
        ctx: &TransformContext<'_>,
    ) -> Result<Value, TransformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KpointMode {
    /// Value is a k-point density; the mesh is derived later by the job.
    Density,
    /// Value is the number of points along one reciprocal axis (0, 1 or 2).
    Component(usize),
}

#[derive(Debug, Clone)]
pub enum Transform {
    /// Replace the whole namespace with the raw value.
    Identity,
    /// Merge the value into the namespace's key-value document.
    SetParameter,
    KpointGrid(KpointMode),
    /// Strip `strip` from the key and route the rest through `inner`,
    /// inside the rule's namespace.
    Nested {
        strip: String,
        inner: Arc<KeyRouter>,
    },
    Custom(Arc<dyn ValueTransform>),
}

#[derive(Clone)]
pub enum Condition {
    /// Catch-all; must be the last group of a router.
    Always,
    /// Only keys listed in the group's override table.
    OverridesOnly,
    Prefix(String),
    /// Receives the normalized key.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Condition {
    fn matches(&self, canonical: &str) -> bool {
        match self {
            Self::Always => true,
            Self::OverridesOnly => false,
            Self::Prefix(prefix) => canonical.starts_with(prefix.as_str()),
            Self::Predicate(predicate) => predicate(canonical),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::OverridesOnly => f.write_str("OverridesOnly"),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyOverride {
    pub namespace: Option<String>,
    pub transform: Option<Transform>,
    pub defaults: ParamDefaults,
}

impl KeyOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_defaults(mut self, defaults: ParamDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RouterRule {
    group_name: String,
    namespace: String,
    condition: Condition,
    transform: Transform,
    overrides: Vec<(String, KeyOverride)>,
}

impl RouterRule {
    pub fn new(
        group_name: impl Into<String>,
        namespace: impl Into<String>,
        condition: Condition,
        transform: Transform,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            namespace: namespace.into(),
            condition,
            transform,
            overrides: Vec::new(),
        }
    }

    /// Routes keys starting with `prefix` into the nested group `tag`.
    ///
    /// Must be placed before any generic catch-all group, otherwise the
    /// prefixed keys are swallowed as raw parameters.
    pub fn nested(
        group_name: impl Into<String>,
        tag: impl Into<String>,
        prefix: impl Into<String>,
        inner: KeyRouter,
    ) -> Self {
        let prefix = prefix.into();
        Self::new(
            group_name,
            tag,
            Condition::Prefix(prefix.clone()),
            Transform::Nested {
                strip: prefix,
                inner: Arc::new(inner),
            },
        )
    }

    pub fn with_override(mut self, key: impl Into<String>, key_override: KeyOverride) -> Self {
        self.overrides.push((key.into(), key_override));
        self
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    group_name: String,
    namespace: String,
    condition: Condition,
    transform: Transform,
    overrides: BTreeMap<String, KeyOverride>,
}

pub struct KeyRouterBuilder {
    normalizer: SharedNormalizer,
    pass_through: Vec<String>,
    rules: Vec<RouterRule>,
}

impl KeyRouterBuilder {
    pub fn normalizer(mut self, normalizer: impl KeyNormalizer + 'static) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn shared_normalizer(mut self, normalizer: SharedNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn pass_through<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pass_through.extend(slots.into_iter().map(Into::into));
        self
    }

    pub fn rule(mut self, rule: RouterRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = RouterRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn build(self) -> Result<KeyRouter, ConfigurationError> {
        let normalizer = self.normalizer;

        let pass_through = self
            .pass_through
            .into_iter()
            .map(|slot| (normalizer.normalize(&slot), slot))
            .collect();

        let mut catch_all: Option<String> = None;
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in self.rules {
            if let Some(catch_all) = &catch_all {
                return Err(ConfigurationError::UnreachableRule {
                    group: rule.group_name,
                    catch_all: catch_all.clone(),
                });
            }
            if matches!(rule.condition, Condition::Always) {
                catch_all = Some(rule.group_name.clone());
            }

            let condition = match rule.condition {
                Condition::Prefix(prefix) => Condition::Prefix(normalizer.normalize(&prefix)),
                other => other,
            };
            let transform = match rule.transform {
                Transform::Nested { strip, inner } => Transform::Nested {
                    strip: normalizer.normalize(&strip),
                    inner,
                },
                other => other,
            };
            let overrides = rule
                .overrides
                .into_iter()
                .map(|(key, key_override)| (normalizer.normalize(&key), key_override))
                .collect();

            rules.push(CompiledRule {
                group_name: rule.group_name,
                namespace: rule.namespace,
                condition,
                transform,
                overrides,
            });
        }

        Ok(KeyRouter {
            normalizer,
            pass_through,
            rules,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeyRouter {
    normalizer: SharedNormalizer,
    pass_through: BTreeMap<String, String>,
    rules: Vec<CompiledRule>,
}

impl KeyRouter {
    pub fn builder() -> KeyRouterBuilder {
        KeyRouterBuilder {
            normalizer: Arc::new(FdfKeyNormalizer),
            pass_through: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn normalizer(&self) -> &dyn KeyNormalizer {
        self.normalizer.as_ref()
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.group_name.as_str())
    }

    pub fn resolve(&self, axis: &str) -> Result<Route, ConfigurationError> {
        let canonical = self.normalizer.normalize(axis);

        if let Some(slot) = self.pass_through.get(&canonical) {
            return Ok(Route {
                axis: axis.to_string(),
                namespace: slot.clone(),
                key: slot.clone(),
                group: None,
                defaults: ParamDefaults::default(),
                action: Action::Identity,
                normalizer: Arc::clone(&self.normalizer),
            });
        }

        for rule in &self.rules {
            if let Some(key_override) = rule.overrides.get(&canonical) {
                let namespace = key_override
                    .namespace
                    .clone()
                    .unwrap_or_else(|| rule.namespace.clone());
                let transform = key_override.transform.as_ref().unwrap_or(&rule.transform);
                return self.bind(
                    axis,
                    &canonical,
                    rule,
                    namespace,
                    transform,
                    key_override.defaults.clone(),
                );
            }
        }

        for rule in &self.rules {
            if !rule.condition.matches(&canonical) {
                continue;
            }
            let bound = self.bind(
                axis,
                &canonical,
                rule,
                rule.namespace.clone(),
                &rule.transform,
                ParamDefaults::default(),
            );
            match bound {
                // A nested group only claims keys its inner router understands.
                Err(ConfigurationError::UnroutableKey { .. })
                    if matches!(rule.transform, Transform::Nested { .. }) =>
                {
                    continue
                }
                other => return other,
            }
        }

        Err(ConfigurationError::UnroutableKey {
            key: axis.to_string(),
        })
    }

    fn bind(
        &self,
        axis: &str,
        canonical: &str,
        rule: &CompiledRule,
        namespace: String,
        transform: &Transform,
        defaults: ParamDefaults,
    ) -> Result<Route, ConfigurationError> {
        let (key, action) = match transform {
            Transform::Identity => (canonical.to_string(), Action::Identity),
            Transform::SetParameter => (canonical.to_string(), Action::SetParameter),
            Transform::KpointGrid(mode) => (canonical.to_string(), Action::KpointGrid(*mode)),
            Transform::Custom(custom) => (canonical.to_string(), Action::Custom(Arc::clone(custom))),
            Transform::Nested { strip, inner } => {
                let stripped = canonical.strip_prefix(strip.as_str()).unwrap_or(canonical);
                if stripped.is_empty() {
                    return Err(ConfigurationError::UnroutableKey {
                        key: axis.to_string(),
                    });
                }
                let inner_route = inner.resolve(stripped).map_err(|error| match error {
                    ConfigurationError::UnroutableKey { .. } => ConfigurationError::UnroutableKey {
                        key: axis.to_string(),
                    },
                    other => other,
                })?;
                (
                    stripped.to_string(),
                    Action::Nested(Box::new(inner_route)),
                )
            }
        };

        debug!(
            axis,
            group = %rule.group_name,
            namespace = %namespace,
            key = %key,
            "Resolved axis route"
        );

        Ok(Route {
            axis: axis.to_string(),
            namespace,
            key,
            group: Some(rule.group_name.clone()),
            defaults,
            action,
            normalizer: Arc::clone(&self.normalizer),
        })
    }

    /// Resolves every axis up front so unroutable keys surface before any
    /// dispatch.
    pub fn route_table<'a>(
        &self,
        axes: impl IntoIterator<Item = &'a str>,
    ) -> Result<RouteTable, ConfigurationError> {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        let mut routes = IndexMap::new();
        for axis in axes {
            let canonical = self.normalizer.normalize(axis);
            if let Some(first) = seen.insert(canonical.clone(), axis.to_string()) {
                return Err(ConfigurationError::DuplicateAxis {
                    first,
                    second: axis.to_string(),
                    canonical,
                });
            }
            routes.insert(axis.to_string(), self.resolve(axis)?);
        }
        Ok(RouteTable { routes })
    }
}

#[derive(Debug, Clone)]
enum Action {
    Identity,
    SetParameter,
    KpointGrid(KpointMode),
    Nested(Box<Route>),
    Custom(Arc<dyn ValueTransform>),
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Identity, Self::Identity) | (Self::SetParameter, Self::SetParameter) => true,
            (Self::KpointGrid(a), Self::KpointGrid(b)) => a == b,
            (Self::Nested(a), Self::Nested(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A resolved axis: target namespace, canonical key, bound defaults and
/// the transform to run.
#[derive(Debug, Clone)]
pub struct Route {
    axis: String,
    namespace: String,
    key: String,
    group: Option<String>,
    defaults: ParamDefaults,
    action: Action,
    normalizer: SharedNormalizer,
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.axis == other.axis
            && self.namespace == other.namespace
            && self.key == other.key
            && self.group == other.group
            && self.defaults == other.defaults
            && self.action == other.action
    }
}

impl Route {
    pub fn axis(&self) -> &str {
        &self.axis
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rule group that produced the route; `None` for pass-through slots.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn defaults(&self) -> &ParamDefaults {
        &self.defaults
    }

    pub fn nested(&self) -> Option<&Route> {
        match &self.action {
            Action::Nested(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn transform_name(&self) -> &'static str {
        match self.action {
            Action::Identity => "identity",
            Action::SetParameter => "set_parameter",
            Action::KpointGrid(_) => "kpoint_grid",
            Action::Nested(_) => "nested",
            Action::Custom(_) => "custom",
        }
    }

    pub fn apply(&self, value: &Value, inputs: &mut JobInputs) -> Result<(), TransformError> {
        let updated = match &self.action {
            Action::Identity => value.clone(),
            Action::SetParameter => {
                let mut document = inputs.object_at(&self.namespace, &self.key)?;
                let value = with_units(value, self.defaults.units.as_deref());
                set_parameter(&mut document, &self.key, value, self.normalizer.as_ref());
                Value::Object(document)
            }
            Action::KpointGrid(mode) => {
                let grid = inputs.object_at(&self.namespace, &self.key)?;
                Value::Object(kpoint_grid(grid, *mode, value, &self.key)?)
            }
            Action::Nested(inner) => {
                let group = inputs.object_at(&self.namespace, &self.key)?;
                let mut nested = JobInputs::from(group);
                inner.apply(value, &mut nested)?;
                nested.into_value()
            }
            Action::Custom(custom) => {
                let ctx = TransformContext {
                    key: &self.key,
                    namespace: &self.namespace,
                    defaults: &self.defaults,
                    normalizer: self.normalizer.as_ref(),
                };
                custom.apply(value, inputs.get(&self.namespace), &ctx)?
            }
        };
        inputs.insert(self.namespace.clone(), updated);
        Ok(())
    }
}

/// Routes for every axis of one sweep, in axis declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    routes: IndexMap<String, Route>,
}

impl RouteTable {
    pub fn get(&self, axis: &str) -> Option<&Route> {
        self.routes.get(axis)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Route)> {
        self.routes.iter().map(|(axis, route)| (axis.as_str(), route))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn with_units(value: &Value, units: Option<&str>) -> Value {
    match (value, units) {
        (Value::Number(number), Some(units)) => Value::String(format!("{number} {units}")),
        _ => value.clone(),
    }
}

fn kpoint_grid(
    mut grid: Map<String, Value>,
    mode: KpointMode,
    value: &Value,
    key: &str,
) -> Result<Map<String, Value>, TransformError> {
    let offset = grid
        .get("offset")
        .cloned()
        .unwrap_or_else(|| json!([0, 0, 0]));

    match mode {
        KpointMode::Density => {
            let density = value
                .as_f64()
                .filter(|density| *density > 0.0)
                .ok_or_else(|| TransformError::InvalidValue {
                    key: key.to_string(),
                    expected: "a positive number",
                })?;
            grid.insert("density".to_string(), json!(density));
            grid.insert("mesh".to_string(), Value::Null);
        }
        KpointMode::Component(component) => {
            if component > 2 {
                return Err(TransformError::Custom {
                    key: key.to_string(),
                    reason: format!("mesh component {component} is not 0, 1 or 2"),
                });
            }
            let points = value
                .as_u64()
                .filter(|points| *points > 0)
                .ok_or_else(|| TransformError::InvalidValue {
                    key: key.to_string(),
                    expected: "a positive integer",
                })?;
            let mut mesh = current_mesh(&grid);
            mesh[component] = points;
            grid.insert("mesh".to_string(), json!(mesh));
            grid.remove("density");
        }
    }

    grid.insert("offset".to_string(), offset);
    Ok(grid)
}

fn current_mesh(grid: &Map<String, Value>) -> [u64; 3] {
    let parsed = grid
        .get("mesh")
        .and_then(Value::as_array)
        .filter(|mesh| mesh.len() == 3)
        .and_then(|mesh| {
            let points: Option<Vec<u64>> = mesh.iter().map(Value::as_u64).collect();
            points
        });
    match parsed.as_deref() {
        Some([a, b, c]) => [*a, *b, *c],
        _ => [1, 1, 1],
    }
}
