//! Nearest-candidate classification by embedding similarity.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use fieldforge_shared::{Callable, FieldforgeError, ParamValue, Params, Record, Result};

use crate::index::{Embedder, FlatIndex};
use crate::prompt::Prompt;
use crate::step::{Step, StepCore, StepOutput, guarded};
use crate::steps::timed;

/// Number of categories written when `k` is not set.
pub const DEFAULT_K: usize = 5;

const PARAMS: [&str; 4] = ["search_prompt", "embedder", "candidates", "k"];

/// Signature of a per-record candidate generator.
pub type CandidatesFn = Arc<dyn Fn(&Record) -> Vec<String> + Send + Sync>;

/// Where the candidate labels come from.
#[derive(Clone)]
pub enum Candidates {
    /// One list shared by every record; indexed once.
    Fixed(Vec<String>),
    /// Computed per record; indexed per record.
    PerRecord { name: Arc<str>, generate: CandidatesFn },
}

impl Candidates {
    pub fn per_record(
        name: impl Into<Arc<str>>,
        generate: impl Fn(&Record) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self::PerRecord {
            name: name.into(),
            generate: Arc::new(generate),
        }
    }

    fn from_param(value: &ParamValue) -> Result<Self> {
        match value {
            ParamValue::Json(Value::Array(_)) => {
                Ok(Self::Fixed(value.expect_string_list("candidates")?))
            }
            other => other.expect_callable::<Candidates>("candidates"),
        }
    }

    fn to_param(&self) -> ParamValue {
        match self {
            Self::Fixed(list) => ParamValue::from(Value::from(list.clone())),
            Self::PerRecord { name, .. } => {
                ParamValue::Callable(Callable::new(Arc::clone(name), self.clone()))
            }
        }
    }
}

impl fmt::Debug for Candidates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(list) => f.debug_tuple("Fixed").field(list).finish(),
            Self::PerRecord { name, .. } => write!(f, "PerRecord({name})"),
        }
    }
}

impl From<Vec<String>> for Candidates {
    fn from(list: Vec<String>) -> Self {
        Self::Fixed(list)
    }
}

impl From<Candidates> for ParamValue {
    fn from(candidates: Candidates) -> Self {
        candidates.to_param()
    }
}

#[derive(Debug, Clone)]
struct SearchConfig {
    search_prompt: Prompt,
    embedder: Embedder,
    candidates: Candidates,
    k: usize,
}

/// Embeds a search prompt per record and writes the `k` nearest candidates
/// to `category1..categoryK`, nearest first.
pub struct EmbeddingSearchStep {
    core: StepCore,
    config: SearchConfig,
    /// Built for [`Candidates::Fixed`] only.
    index: Option<FlatIndex>,
}

impl fmt::Debug for EmbeddingSearchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingSearchStep")
            .field("name", &self.core.name())
            .field("config", &self.config)
            .field("indexed", &self.index.is_some())
            .finish()
    }
}

impl EmbeddingSearchStep {
    /// Fails when a fixed candidate list is empty or cannot be embedded.
    pub fn new(
        search_prompt: impl Into<Prompt>,
        embedder: Embedder,
        candidates: impl Into<Candidates>,
    ) -> Result<Self> {
        let config = SearchConfig {
            search_prompt: search_prompt.into(),
            embedder,
            candidates: candidates.into(),
            k: DEFAULT_K,
        };
        let index = build_fixed_index(&config)?;
        Ok(Self {
            core: StepCore::new("EmbeddingSearchStep"),
            config,
            index,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.set_name(name);
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.config.k = k;
        self
    }

    pub fn k(&self) -> usize {
        self.config.k
    }
}

fn build_fixed_index(config: &SearchConfig) -> Result<Option<FlatIndex>> {
    match &config.candidates {
        Candidates::Fixed(list) if list.is_empty() => Err(FieldforgeError::validation(
            "embedding search needs a non-empty candidate list or a candidate generator",
        )),
        Candidates::Fixed(list) => {
            debug!(embedder = config.embedder.name(), candidates = list.len(), "building index");
            Ok(Some(FlatIndex::build(config.embedder.embed(list)?)?))
        }
        Candidates::PerRecord { .. } => Ok(None),
    }
}

#[async_trait]
impl Step for EmbeddingSearchStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "EmbeddingSearchStep"
    }

    fn output_fields(&self) -> Vec<String> {
        (1..=self.config.k).map(|i| format!("category{i}")).collect()
    }

    fn param_names(&self) -> &'static [&'static str] {
        &PARAMS
    }

    fn params(&self) -> Params {
        Params::from([
            ("search_prompt".to_string(), self.config.search_prompt.to_param()),
            ("embedder".to_string(), ParamValue::from(self.config.embedder.clone())),
            ("candidates".to_string(), self.config.candidates.to_param()),
            ("k".to_string(), ParamValue::from(self.config.k as i64)),
        ])
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let mut next = self.config.clone();
        if let Some(v) = params.get("search_prompt") {
            next.search_prompt = Prompt::from_param(v, "search_prompt")?;
        }
        if let Some(v) = params.get("embedder") {
            next.embedder = v.expect_callable::<Embedder>("embedder")?;
        }
        if let Some(v) = params.get("candidates") {
            next.candidates = Candidates::from_param(v)?;
        }
        if let Some(v) = params.get("k") {
            next.k = v.expect_usize("k")?;
            if next.k == 0 {
                return Err(FieldforgeError::validation("parameter `k` must be at least 1"));
            }
        }

        if params.contains_key("embedder") || params.contains_key("candidates") {
            self.index = build_fixed_index(&next)?;
        }
        self.config = next;
        Ok(())
    }

    async fn process(&self, record: &Record) -> Result<StepOutput> {
        let started = Instant::now();
        let name = self.name();
        let per_record_error = |e: FieldforgeError| FieldforgeError::step(name, e.to_string());

        let (candidates, index): (Cow<'_, [String]>, Cow<'_, FlatIndex>) =
            match (&self.config.candidates, &self.index) {
                (Candidates::Fixed(list), Some(index)) => {
                    (Cow::Borrowed(list.as_slice()), Cow::Borrowed(index))
                }
                (Candidates::Fixed(_), None) => {
                    return Err(FieldforgeError::config(format!("step `{name}` has no index")));
                }
                (Candidates::PerRecord { generate, .. }, _) => {
                    let list = guarded(name, || generate(record))?;
                    if list.is_empty() {
                        return Err(FieldforgeError::step(name, "no candidates for record"));
                    }
                    let vectors =
                        guarded(name, || self.config.embedder.embed(&list))?.map_err(per_record_error)?;
                    let index = FlatIndex::build(vectors).map_err(per_record_error)?;
                    (Cow::Owned(list), Cow::Owned(index))
                }
            };

        let query = guarded(name, || self.config.search_prompt.render(record))?;
        let vectors = guarded(name, || self.config.embedder.embed(std::slice::from_ref(&query)))?
            .map_err(per_record_error)?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| FieldforgeError::step(name, "embedder returned no vector"))?;
        let hits = index.search(&vector, self.config.k)?;

        let fields: Record = hits
            .iter()
            .enumerate()
            .map(|(rank, &i)| (format!("category{}", rank + 1), Value::String(candidates[i].clone())))
            .collect();
        Ok(StepOutput::new(fields, timed(started)).with_prompt(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::steps::testing::record;
    use fieldforge_shared::Dataset;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One-dimensional embedding: the text's length.
    fn length_embedder() -> Embedder {
        Embedder::new("length", |texts: &[String]| {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        })
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn writes_nearest_categories() {
        let mut step = EmbeddingSearchStep::new("{q}", length_embedder(), labels(&["a", "bbb", "bbbbbb"]))
            .unwrap()
            .with_k(2);
        let mut data = Dataset::Record(record(json!({"q": "xxxx"})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(row["category1"], json!("bbb"));
        assert_eq!(row["category2"], json!("bbbbbb"));
        assert!(row.get("category3").is_none());
    }

    #[tokio::test]
    async fn k_beyond_candidates_writes_what_exists() {
        let mut step = EmbeddingSearchStep::new("{q}", length_embedder(), labels(&["a", "bb"])).unwrap();
        assert_eq!(step.k(), DEFAULT_K);
        let mut data = Dataset::Record(record(json!({"q": "x"})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(row["category1"], json!("a"));
        assert_eq!(row["category2"], json!("bb"));
        assert!(row.get("category3").is_none());
        assert_eq!(step.statistics().num_success, 1);
    }

    #[tokio::test]
    async fn per_record_candidates() {
        let candidates = Candidates::per_record("from_row", |r: &Record| {
            r["options"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default()
        });
        let mut step = EmbeddingSearchStep::new("{q}", length_embedder(), candidates)
            .unwrap()
            .with_k(1);
        let mut data = Dataset::Table(vec![
            record(json!({"q": "xx", "options": ["zz", "zzzzz"]})),
            record(json!({"q": "xx", "options": []})),
        ]);
        step.run(&mut data, &SilentProgress).await.unwrap();

        let rows: Vec<_> = data.records().collect();
        assert_eq!(rows[0]["category1"], json!("zz"));
        assert!(rows[1].get("category1").is_none());
        assert_eq!(step.statistics().num_failure, 1);
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        let err = EmbeddingSearchStep::new("{q}", length_embedder(), Vec::<String>::new()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("non-empty candidate list"));
    }

    #[test]
    fn index_rebuilds_only_when_inputs_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let embedder = Embedder::new("counting", move |texts: &[String]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        });
        let mut step = EmbeddingSearchStep::new("{q}", embedder, labels(&["a"])).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        step.update_params(&Params::from([("k".to_string(), ParamValue::from(1i64))]))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let candidates = ParamValue::from(json!(["a", "b"]));
        step.update_params(&Params::from([("candidates".to_string(), candidates)]))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(step.params()["candidates"].to_stable_json(), json!(["a", "b"]));
    }

    #[test]
    fn debug_names_the_step() {
        let step = EmbeddingSearchStep::new("{q}", length_embedder(), labels(&["a"]))
            .unwrap()
            .named("genre");
        let text = format!("{step:?}");
        assert!(text.contains("genre"));
        assert!(text.contains("indexed: true"));
    }

    #[test]
    fn zero_k_is_rejected() {
        let mut step = EmbeddingSearchStep::new("{q}", length_embedder(), labels(&["a"])).unwrap();
        let err = step
            .update_params(&Params::from([("k".to_string(), ParamValue::from(0i64))]))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(step.k(), DEFAULT_K);
    }
}
