//! Core data types: records, datasets, and execution statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of data: a single item or one row of a table.
pub type Record = Map<String, Value>;

/// Name of the per-record metadata column a step writes.
pub fn meta_column(step_name: &str) -> String {
    format!("__{step_name}__")
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// Input to a step or pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dataset {
    /// A tabular batch; every row is processed independently.
    Table(Vec<Record>),
    /// A single record.
    Record(Record),
}

impl Dataset {
    /// Number of records held.
    pub fn len(&self) -> usize {
        match self {
            Self::Table(rows) => rows.len(),
            Self::Record(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }

    /// Iterate over all records.
    pub fn records(&self) -> std::slice::Iter<'_, Record> {
        match self {
            Self::Table(rows) => rows.iter(),
            Self::Record(record) => std::slice::from_ref(record).iter(),
        }
    }

    /// Iterate mutably over all records.
    pub fn records_mut(&mut self) -> std::slice::IterMut<'_, Record> {
        match self {
            Self::Table(rows) => rows.iter_mut(),
            Self::Record(record) => std::slice::from_mut(record).iter_mut(),
        }
    }

    /// Column names in first-seen order across all records.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for record in self.records() {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

impl From<Vec<Record>> for Dataset {
    fn from(rows: Vec<Record>) -> Self {
        Self::Table(rows)
    }
}

impl From<Record> for Dataset {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

// ---------------------------------------------------------------------------
// Row statistics
// ---------------------------------------------------------------------------

/// Outcome of applying one step to one record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowStatistics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD; zero when the model has no known pricing.
    pub input_cost: f64,
    pub output_cost: f64,
    /// Seconds.
    pub latency: f64,
    pub success: bool,
}

impl Default for RowStatistics {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            input_cost: 0.0,
            output_cost: 0.0,
            latency: 0.0,
            success: true,
        }
    }
}

impl RowStatistics {
    /// A failed row with only its latency recorded.
    pub fn failed(latency: f64) -> Self {
        Self {
            latency,
            success: false,
            ..Default::default()
        }
    }

    /// Combine statistics of several calls made for the same record.
    ///
    /// Counters and latency are summed; the row succeeds only if every part did.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a RowStatistics>) -> Self {
        parts.into_iter().fold(Self::default(), |acc, s| Self {
            input_tokens: acc.input_tokens + s.input_tokens,
            output_tokens: acc.output_tokens + s.output_tokens,
            input_cost: acc.input_cost + s.input_cost,
            output_cost: acc.output_cost + s.output_cost,
            latency: acc.latency + s.latency,
            success: acc.success && s.success,
        })
    }
}

// ---------------------------------------------------------------------------
// Step statistics
// ---------------------------------------------------------------------------

/// Token usage of one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

impl From<&RowStatistics> for TokenUsage {
    fn from(row: &RowStatistics) -> Self {
        Self {
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
        }
    }
}

/// Running totals for one step since its last parameter change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStatistics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens split by the model that consumed them.
    #[serde(default)]
    pub tokens_by_model: BTreeMap<String, TokenUsage>,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_latency: f64,
    pub num_success: usize,
    pub num_failure: usize,
}

impl StepStatistics {
    /// Fold one row's outcome into the totals.
    pub fn record(&mut self, row: &RowStatistics) {
        self.input_tokens += row.input_tokens;
        self.output_tokens += row.output_tokens;
        self.input_cost += row.input_cost;
        self.output_cost += row.output_cost;
        self.total_latency += row.latency;
        if row.success {
            self.num_success += 1;
        } else {
            self.num_failure += 1;
        }
    }

    /// Credit `usage` to `model`.
    pub fn record_usage(&mut self, model: &str, usage: TokenUsage) {
        self.tokens_by_model.entry(model.to_string()).or_default().add(usage);
    }

    /// Rows processed since the last reset.
    pub fn rows(&self) -> usize {
        self.num_success + self.num_failure
    }

    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

// ---------------------------------------------------------------------------
// Row metadata
// ---------------------------------------------------------------------------

/// Contents of the `__{step}__` column written for each processed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMeta {
    #[serde(flatten)]
    pub statistics: RowStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl RowMeta {
    /// Read the success flag back from a serialized metadata column.
    pub fn success_of(value: &Value) -> Option<bool> {
        value.get("success").and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn step_statistics_accumulate() {
        let mut stats = StepStatistics::default();
        stats.record(&RowStatistics {
            input_tokens: 10,
            output_tokens: 5,
            input_cost: 0.1,
            output_cost: 0.2,
            latency: 1.5,
            success: true,
        });
        stats.record(&RowStatistics::failed(0.5));

        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.output_tokens, 5);
        assert_eq!(stats.num_success, 1);
        assert_eq!(stats.num_failure, 1);
        assert_eq!(stats.rows(), 2);
        assert!((stats.total_latency - 2.0).abs() < 1e-9);
        assert!((stats.total_cost() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn combine_requires_every_part_to_succeed() {
        let ok = RowStatistics {
            input_tokens: 3,
            latency: 1.0,
            ..Default::default()
        };
        let failed = RowStatistics::failed(2.0);
        let combined = RowStatistics::combine([&ok, &failed]);
        assert_eq!(combined.input_tokens, 3);
        assert!(!combined.success);
        assert!((combined.latency - 3.0).abs() < 1e-9);

        assert!(RowStatistics::combine([&ok, &ok]).success);
    }

    #[test]
    fn dataset_columns_first_seen_order() {
        let data = Dataset::Table(vec![
            record(json!({"x": 1, "y": 2})),
            record(json!({"x": 3, "z": 4})),
        ]);
        assert_eq!(data.columns(), vec!["x", "y", "z"]);
        assert_eq!(data.len(), 2);
        assert!(data.is_table());
    }

    #[test]
    fn single_record_dataset_iterates_once() {
        let mut data = Dataset::Record(record(json!({"x": 1})));
        assert_eq!(data.records().count(), 1);
        for r in data.records_mut() {
            r.insert("y".into(), json!(2));
        }
        assert_eq!(data.columns(), vec!["x", "y"]);
    }

    #[test]
    fn row_meta_flattens_statistics() {
        let meta = RowMeta {
            statistics: RowStatistics::failed(0.25),
            error: Some("boom".into()),
            prompt: None,
        };
        let value = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("boom"));
        assert!(value.get("prompt").is_none());
        assert_eq!(RowMeta::success_of(&value), Some(false));
    }
}
