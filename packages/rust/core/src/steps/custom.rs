//! User-defined transform step.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use fieldforge_shared::{Callable, FieldforgeError, ParamValue, Params, Record, Result};

use crate::step::{Step, StepCore, StepOutput, guarded};
use crate::steps::timed;

const PARAMS: [&str; 1] = ["transform"];

/// Signature of a record transform.
pub type TransformFn = Arc<dyn Fn(&Record) -> Result<Record> + Send + Sync>;

/// A named record transform.
#[derive(Clone)]
pub struct Transform {
    name: Arc<str>,
    apply: TransformFn,
}

impl Transform {
    pub fn new(
        name: impl Into<Arc<str>>,
        apply: impl Fn(&Record) -> Result<Record> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transform({})", self.name)
    }
}

impl From<Transform> for ParamValue {
    fn from(t: Transform) -> Self {
        ParamValue::Callable(Callable::new(Arc::clone(&t.name), t))
    }
}

/// Applies a user transform and keeps only the declared output fields.
pub struct CustomStep {
    core: StepCore,
    transform: Transform,
    fields: Vec<String>,
}

impl CustomStep {
    pub fn new(transform: Transform, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            core: StepCore::new("CustomStep"),
            transform,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.set_name(name);
        self
    }
}

#[async_trait]
impl Step for CustomStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "CustomStep"
    }

    fn output_fields(&self) -> Vec<String> {
        self.fields.clone()
    }

    fn param_names(&self) -> &'static [&'static str] {
        &PARAMS
    }

    fn params(&self) -> Params {
        Params::from([(
            "transform".to_string(),
            ParamValue::from(self.transform.clone()),
        )])
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        if let Some(v) = params.get("transform") {
            self.transform = v.expect_callable::<Transform>("transform")?;
        }
        Ok(())
    }

    async fn process(&self, record: &Record) -> Result<StepOutput> {
        let started = Instant::now();
        let output = guarded(self.name(), || (self.transform.apply)(record))?
            .map_err(|e| FieldforgeError::step(self.name(), e.to_string()))?;

        if let Some(missing) = self.fields.iter().find(|f| !output.contains_key(f.as_str())) {
            return Err(FieldforgeError::step(
                self.name(),
                format!("transform `{}` did not produce `{missing}`", self.transform.name),
            ));
        }
        Ok(StepOutput::new(output, timed(started)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::steps::testing::record;
    use fieldforge_shared::{Dataset, RowMeta};
    use serde_json::{Value, json};

    fn doubler() -> Transform {
        Transform::new("double_x", |r: &Record| {
            let x = r
                .get("x")
                .and_then(Value::as_i64)
                .ok_or_else(|| FieldforgeError::step("double", "x is not an integer"))?;
            let mut out = Record::new();
            out.insert("doubled".into(), json!(x * 2));
            Ok(out)
        })
    }

    #[tokio::test]
    async fn doubles_every_row() {
        let mut step = CustomStep::new(doubler(), ["doubled"]).named("double");
        let mut data = Dataset::Table(vec![
            record(json!({"x": 1})),
            record(json!({"x": 2})),
            record(json!({"x": 3})),
        ]);
        step.run(&mut data, &SilentProgress).await.unwrap();

        let doubled: Vec<&Value> = data.records().map(|r| &r["doubled"]).collect();
        assert_eq!(doubled, vec![&json!(2), &json!(4), &json!(6)]);
        assert_eq!(step.statistics().num_success, 3);
        assert_eq!(step.statistics().num_failure, 0);
    }

    #[tokio::test]
    async fn transform_error_fails_that_row() {
        let mut step = CustomStep::new(doubler(), ["doubled"]);
        let mut data = Dataset::Table(vec![record(json!({"x": "one"})), record(json!({"x": 5}))]);
        step.run(&mut data, &SilentProgress).await.unwrap();

        let rows: Vec<_> = data.records().collect();
        assert_eq!(RowMeta::success_of(&rows[0]["__CustomStep__"]), Some(false));
        assert_eq!(rows[1]["doubled"], json!(10));
    }

    #[tokio::test]
    async fn validation_error_from_transform_stays_per_record() {
        let picky = Transform::new("picky", |r: &Record| {
            let x = r.get("x").and_then(Value::as_i64).unwrap_or_default();
            if x == 2 {
                return Err(FieldforgeError::validation("x must not be 2"));
            }
            Ok(Record::from_iter([("doubled".to_string(), json!(x * 2))]))
        });
        let mut step = CustomStep::new(picky, ["doubled"]).named("picky");
        let mut data = Dataset::Table(vec![
            record(json!({"x": 1})),
            record(json!({"x": 2})),
            record(json!({"x": 3})),
        ]);
        step.run(&mut data, &SilentProgress).await.unwrap();

        let rows: Vec<_> = data.records().collect();
        assert_eq!(rows[0]["doubled"], json!(2));
        assert!(rows[1].get("doubled").is_none());
        assert!(rows[1]["__picky__"]["error"].as_str().unwrap().contains("x must not be 2"));
        assert_eq!(rows[2]["doubled"], json!(6));
        assert_eq!(step.statistics().num_success, 2);
        assert_eq!(step.statistics().num_failure, 1);
    }

    #[tokio::test]
    async fn missing_declared_field_is_a_failure() {
        let mut step = CustomStep::new(doubler(), ["doubled", "tripled"]);
        let mut data = Dataset::Record(record(json!({"x": 1})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert!(row.get("doubled").is_none());
        let error = row["__CustomStep__"]["error"].as_str().unwrap();
        assert!(error.contains("tripled"));
        assert_eq!(step.statistics().num_failure, 1);
    }

    #[tokio::test]
    async fn panicking_transform_is_contained() {
        let boom = Transform::new("boom", |_r: &Record| -> Result<Record> { panic!("kaboom") });
        let mut step = CustomStep::new(boom, ["y"]);
        let mut data = Dataset::Table(vec![record(json!({})), record(json!({}))]);
        step.run(&mut data, &SilentProgress).await.unwrap();
        assert_eq!(step.statistics().num_failure, 2);
    }

    #[test]
    fn transform_is_swappable_by_name() {
        let mut step = CustomStep::new(doubler(), ["doubled"]);
        let before = step.fingerprint(true);
        let other = Transform::new("double_x_v2", |r: &Record| Ok(r.clone()));
        step.update_params(&Params::from([("transform".to_string(), ParamValue::from(other))]))
            .unwrap();
        assert_ne!(step.fingerprint(true), before);
        assert_eq!(step.params()["transform"].to_stable_json(), json!("double_x_v2"));
    }
}
