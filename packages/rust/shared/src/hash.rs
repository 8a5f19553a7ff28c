//! Deterministic content hashing for configurations.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::params::GroupedParams;

/// Number of hex characters kept for configuration identifiers.
pub const SHORT_ID_LEN: usize = 16;

/// SHA-256 hex digest of a JSON value in canonical form.
///
/// `serde_json` objects are sorted maps here (no `preserve_order`), so the
/// serialized text is independent of insertion order.
pub fn content_hash(value: &Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable JSON representation of grouped params (callables by name).
pub fn params_to_json(params: &GroupedParams) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(step, group)| {
                let group = group
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_stable_json()))
                    .collect();
                (step.clone(), Value::Object(group))
            })
            .collect(),
    )
}

/// Short identifier for one configuration, used to name exported runs.
pub fn config_id(params: &GroupedParams) -> String {
    let mut hash = content_hash(&params_to_json(params));
    hash.truncate(SHORT_ID_LEN);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Callable, ParamValue, Params};
    use serde_json::json;
    use std::sync::Arc;

    fn grouped(step: &str, key: &str, value: ParamValue) -> GroupedParams {
        let mut params = Params::new();
        params.insert(key.into(), value);
        let mut g = GroupedParams::new();
        g.insert(step.into(), params);
        g
    }

    #[test]
    fn hash_is_order_independent() {
        let a = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let b = json!({"b": {"y": 2, "x": 1}, "a": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn config_id_changes_with_values() {
        let one = config_id(&grouped("stepA", "threshold", ParamValue::from(1i64)));
        let two = config_id(&grouped("stepA", "threshold", ParamValue::from(2i64)));
        assert_ne!(one, two);
        assert_eq!(one.len(), SHORT_ID_LEN);
        assert_eq!(
            one,
            config_id(&grouped("stepA", "threshold", ParamValue::from(1i64)))
        );
    }

    #[test]
    fn callables_hash_by_name() {
        let f: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let g: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let a = config_id(&grouped("s", "prompt", Callable::new("short", f).into()));
        let b = config_id(&grouped("s", "prompt", Callable::new("short", g).into()));
        assert_eq!(a, b);
    }
}
