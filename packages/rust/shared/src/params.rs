//! Step parameter values, grouped overrides, and parameter grids.
//!
//! A parameter is either plain JSON data or a [`Callable`]: a function value
//! with a stable name. Callables cannot be serialized or hashed by content,
//! so everything that needs a stable representation (fingerprints, flattened
//! result rows) uses the callable's name instead.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{FieldforgeError, Result};

/// Reserved group key whose overrides apply to every step.
pub const GLOBAL_KEY: &str = "global";

/// Separator between step and parameter names in flattened keys.
pub const FLAT_SEPARATOR: &str = "__";

// ---------------------------------------------------------------------------
// Callable
// ---------------------------------------------------------------------------

/// A named, type-erased function value.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Callable {
    /// Wrap `value` (typically an `Arc<dyn Fn ...>`) under a stable name.
    pub fn new<T: Any + Send + Sync>(name: impl Into<Arc<str>>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow the wrapped value if it has type `T`.
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.name)
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

// ---------------------------------------------------------------------------
// ParamValue
// ---------------------------------------------------------------------------

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Json(Value),
    Callable(Callable),
}

impl ParamValue {
    /// Stable JSON stand-in: callables are replaced by their names.
    pub fn to_stable_json(&self) -> Value {
        match self {
            Self::Json(v) => v.clone(),
            Self::Callable(c) => Value::String(c.name().to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Callable(_) => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Self::Callable(c) => Some(c),
            Self::Json(_) => None,
        }
    }

    /// Interpret as a string, failing with a validation error naming `key`.
    pub fn expect_str(&self, key: &str) -> Result<String> {
        self.as_json()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| type_error(key, "a string", self))
    }

    pub fn expect_usize(&self, key: &str) -> Result<usize> {
        self.as_json()
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| type_error(key, "a non-negative integer", self))
    }

    pub fn expect_object(&self, key: &str) -> Result<serde_json::Map<String, Value>> {
        self.as_json()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| type_error(key, "an object", self))
    }

    pub fn expect_string_list(&self, key: &str) -> Result<Vec<String>> {
        let items = self
            .as_json()
            .and_then(Value::as_array)
            .ok_or_else(|| type_error(key, "a list of strings", self))?;
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error(key, "a list of strings", self))
            })
            .collect()
    }

    /// Downcast a callable parameter to the concrete function type `T`.
    pub fn expect_callable<T: Any + Clone>(&self, key: &str) -> Result<T> {
        self.as_callable()
            .and_then(|c| c.downcast::<T>())
            .cloned()
            .ok_or_else(|| type_error(key, std::any::type_name::<T>(), self))
    }
}

fn type_error(key: &str, expected: &str, got: &ParamValue) -> FieldforgeError {
    FieldforgeError::validation(format!(
        "parameter `{key}` must be {expected}, got {}",
        got.to_stable_json()
    ))
}

impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl From<Callable> for ParamValue {
    fn from(c: Callable) -> Self {
        Self::Callable(c)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Json(Value::String(s.to_string()))
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Json(Value::String(s))
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        Self::Json(Value::from(n))
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        Self::Json(Value::from(n))
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Json(Value::Bool(b))
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_stable_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::Json)
    }
}

// ---------------------------------------------------------------------------
// Grouped params
// ---------------------------------------------------------------------------

/// Parameter overrides for one step.
pub type Params = BTreeMap<String, ParamValue>;

/// Overrides keyed by step name, plus the reserved [`GLOBAL_KEY`] group.
pub type GroupedParams = BTreeMap<String, Params>;

/// Flatten grouped params into `step__param` keys.
pub fn flatten_params(grouped: &GroupedParams) -> Vec<(String, ParamValue)> {
    grouped
        .iter()
        .flat_map(|(step, params)| {
            params
                .iter()
                .map(move |(param, value)| (format!("{step}{FLAT_SEPARATOR}{param}"), value.clone()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ParamGrid
// ---------------------------------------------------------------------------

/// `{step: {param: [values]}}`, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGrid {
    axes: Vec<GridAxis>,
}

/// One (step, param) dimension of a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridAxis {
    pub step: String,
    pub param: String,
    pub values: Vec<ParamValue>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the value list for `step.param`.
    pub fn param<V: Into<ParamValue>>(
        mut self,
        step: impl Into<String>,
        param: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let step = step.into();
        let param = param.into();
        let values: Vec<ParamValue> = values.into_iter().map(Into::into).collect();
        match self
            .axes
            .iter_mut()
            .find(|a| a.step == step && a.param == param)
        {
            Some(axis) => axis.values = values,
            None => self.axes.push(GridAxis {
                step,
                param,
                values,
            }),
        }
        self
    }

    pub fn axes(&self) -> &[GridAxis] {
        &self.axes
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Number of configurations the grid expands to.
    pub fn size(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }
}

impl From<BTreeMap<String, BTreeMap<String, Vec<ParamValue>>>> for ParamGrid {
    fn from(map: BTreeMap<String, BTreeMap<String, Vec<ParamValue>>>) -> Self {
        map.into_iter()
            .flat_map(|(step, params)| {
                params
                    .into_iter()
                    .map(move |(param, values)| (step.clone(), param, values))
            })
            .fold(Self::new(), |grid, (step, param, values)| {
                grid.param(step, param, values)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type PromptFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

    #[test]
    fn callable_downcast_and_stable_name() {
        let f: PromptFn = Arc::new(|s| format!("<{s}>"));
        let value = ParamValue::from(Callable::new("wrap", f));

        let back: PromptFn = value.expect_callable("prompt").expect("downcast");
        assert_eq!(back("x"), "<x>");
        assert_eq!(value.to_stable_json(), json!("wrap"));
        assert!(value.expect_callable::<String>("prompt").is_err());
    }

    #[test]
    fn typed_accessors_report_key() {
        let v = ParamValue::from(json!(3));
        assert_eq!(v.expect_usize("k").unwrap(), 3);
        let err = v.expect_str("model").unwrap_err();
        assert!(err.to_string().contains("`model`"));
        assert!(err.is_fatal());
    }

    #[test]
    fn string_list_accessor() {
        let v = ParamValue::from(json!(["a", "b"]));
        assert_eq!(v.expect_string_list("candidates").unwrap(), vec!["a", "b"]);
        assert!(ParamValue::from(json!(["a", 1])).expect_string_list("c").is_err());
    }

    #[test]
    fn flatten_joins_step_and_param() {
        let mut grouped = GroupedParams::new();
        grouped
            .entry("classify".into())
            .or_default()
            .insert("model".into(), "gpt".into());
        grouped
            .entry("search".into())
            .or_default()
            .insert("k".into(), ParamValue::from(3i64));

        let flat = flatten_params(&grouped);
        assert_eq!(flat[0].0, "classify__model");
        assert_eq!(flat[1].0, "search__k");
        assert_eq!(flat[1].1, ParamValue::from(3i64));
    }

    #[test]
    fn grid_preserves_insertion_order_and_replaces() {
        let grid = ParamGrid::new()
            .param("b", "x", [1i64, 2])
            .param("a", "y", ["p", "q", "r"])
            .param("b", "x", [5i64]);
        assert_eq!(grid.axes().len(), 2);
        assert_eq!(grid.axes()[0].step, "b");
        assert_eq!(grid.axes()[0].values, vec![ParamValue::from(5i64)]);
        assert_eq!(grid.size(), 3);
    }

    #[test]
    fn param_value_serializes_callables_by_name() {
        let f: PromptFn = Arc::new(|s| s.to_string());
        let v = ParamValue::from(Callable::new("identity", f));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#""identity""#);
    }
}
