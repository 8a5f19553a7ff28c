//! CSV import and export of datasets and sweep results.

use std::io::{Read, Write};
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use fieldforge_shared::{Dataset, FieldforgeError, Record, Result};

use crate::grid_search::GridResult;

/// Statistic columns appended after the parameter columns of a summary.
const SUMMARY_COLUMNS: [&str; 9] = [
    "score",
    "input_tokens",
    "output_tokens",
    "input_cost",
    "output_cost",
    "total_latency",
    "num_success",
    "num_failure",
    "id",
];

/// Prefix export errors with the file they concern.
fn with_path(path: &Path, err: FieldforgeError) -> FieldforgeError {
    match err {
        FieldforgeError::Export(msg) => FieldforgeError::Export(format!("{}: {msg}", path.display())),
        other => other,
    }
}

/// Text form of a cell: strings verbatim, null empty, everything else as JSON.
pub fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// Write one row per record; columns are the union of keys in first-seen order.
///
/// Metadata columns (`__{step}__`) are written as JSON text.
pub fn write_dataset_to<W: Write>(data: &Dataset, writer: W) -> Result<()> {
    let columns = data.columns();
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(&columns)
        .map_err(|e| FieldforgeError::Export(e.to_string()))?;
    for record in data.records() {
        let row = columns
            .iter()
            .map(|c| record.get(c).map(cell).unwrap_or_default());
        out.write_record(row)
            .map_err(|e| FieldforgeError::Export(e.to_string()))?;
    }
    out.flush()
        .map_err(|e| FieldforgeError::Export(e.to_string()))?;
    Ok(())
}

pub fn write_dataset(data: &Dataset, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| FieldforgeError::io(path, e))?;
    write_dataset_to(data, file).map_err(|e| with_path(path, e))?;
    debug!(path = %path.display(), rows = data.len(), "dataset written");
    Ok(())
}

/// Read a CSV with a header row into a table; every cell becomes a string.
pub fn read_dataset_from<R: Read>(reader: R) -> Result<Dataset> {
    let mut input = csv::Reader::from_reader(reader);
    let headers = input
        .headers()
        .map_err(|e| FieldforgeError::Export(e.to_string()))?
        .clone();
    let mut rows = Vec::new();
    for row in input.records() {
        let row = row.map_err(|e| FieldforgeError::Export(e.to_string()))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(record);
    }
    Ok(Dataset::Table(rows))
}

pub fn read_dataset(path: &Path) -> Result<Dataset> {
    let file = std::fs::File::open(path).map_err(|e| FieldforgeError::io(path, e))?;
    read_dataset_from(file).map_err(|e| with_path(path, e))
}

// ---------------------------------------------------------------------------
// Sweep summaries
// ---------------------------------------------------------------------------

/// One row per configuration: flattened `step__param` columns, then statistics.
pub fn write_summary_to<W: Write>(results: &[GridResult], writer: W) -> Result<()> {
    let mut param_columns: Vec<String> = Vec::new();
    for result in results {
        for (key, _) in result.flat_params() {
            if !param_columns.contains(&key) {
                param_columns.push(key);
            }
        }
    }

    let mut out = csv::Writer::from_writer(writer);
    let header = param_columns
        .iter()
        .map(String::as_str)
        .chain(SUMMARY_COLUMNS);
    out.write_record(header)
        .map_err(|e| FieldforgeError::Export(e.to_string()))?;

    for result in results {
        let flat = result.flat_params();
        let mut row: Vec<String> = param_columns
            .iter()
            .map(|c| {
                flat.iter()
                    .find(|(k, _)| k == c)
                    .map(|(_, v)| cell(&v.to_stable_json()))
                    .unwrap_or_default()
            })
            .collect();
        let s = &result.statistics;
        row.extend([
            result.score.map(|v| v.to_string()).unwrap_or_default(),
            s.input_tokens.to_string(),
            s.output_tokens.to_string(),
            s.input_cost.to_string(),
            s.output_cost.to_string(),
            s.total_latency.to_string(),
            s.num_success.to_string(),
            s.num_failure.to_string(),
            result.id.clone(),
        ]);
        out.write_record(&row)
            .map_err(|e| FieldforgeError::Export(e.to_string()))?;
    }
    out.flush()
        .map_err(|e| FieldforgeError::Export(e.to_string()))?;
    Ok(())
}

pub fn write_summary(results: &[GridResult], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| FieldforgeError::io(path, e))?;
    write_summary_to(results, file).map_err(|e| with_path(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineStatistics;
    use fieldforge_shared::{GroupedParams, ParamValue, Params};
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn dataset_columns_and_cells() {
        let data = Dataset::Table(vec![
            record(json!({"a": "x", "__s__": {"success": true}})),
            record(json!({"a": 2, "b": null})),
        ]);
        let mut buf = Vec::new();
        write_dataset_to(&data, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "__s__,a,b");
        assert_eq!(lines[1], r#""{""success"":true}",x,"#);
        assert_eq!(lines[2], ",2,");
    }

    #[test]
    fn reads_header_and_rows() {
        let data = read_dataset_from("title,label\nDune,sci-fi\nEmma,romance\n".as_bytes()).unwrap();
        assert_eq!(data.len(), 2);
        let first = data.records().next().unwrap();
        assert_eq!(first["title"], json!("Dune"));
        assert_eq!(first["label"], json!("sci-fi"));
    }

    #[test]
    fn file_round_trip_keeps_text() {
        let path = std::env::temp_dir().join(format!("fieldforge-{}.csv", uuid::Uuid::now_v7()));
        let data = Dataset::Table(vec![record(json!({"q": "a, \"quoted\" value"}))]);
        write_dataset(&data, &path).unwrap();
        let back = read_dataset(&path).unwrap();
        assert_eq!(back, data);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn summary_has_param_and_stat_columns() {
        let params = GroupedParams::from([(
            "stepA".to_string(),
            Params::from([("threshold".to_string(), ParamValue::from(1i64))]),
        )]);
        let result = GridResult {
            id: "abc".into(),
            params,
            score: Some(0.5),
            statistics: PipelineStatistics {
                num_success: 2,
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        write_summary_to(&[result], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "stepA__threshold,score,input_tokens,output_tokens,input_cost,output_cost,total_latency,num_success,num_failure,id"
        );
        assert_eq!(lines[1], "1,0.5,0,0,0,0,0,2,0,abc");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_dataset(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, FieldforgeError::Io { .. }));
    }
}
