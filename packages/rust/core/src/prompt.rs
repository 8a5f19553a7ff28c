//! Prompt builders: closures or `{field}` templates rendered from a record.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde_json::Value;

use fieldforge_shared::{Callable, ParamValue, Record, Result};

/// Signature of a prompt-building closure.
pub type PromptFn = Arc<dyn Fn(&Record) -> String + Send + Sync>;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Text with `{field}` placeholders filled from a record.
///
/// Missing fields and nulls render as empty strings; strings are inserted
/// verbatim and other values as compact JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Field names referenced by the template, in order of appearance.
    pub fn fields(&self) -> Vec<&str> {
        PLACEHOLDER_RE
            .captures_iter(&self.text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    pub fn render(&self, record: &Record) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.text, |caps: &Captures<'_>| {
                record.get(&caps[1]).map(render_value).unwrap_or_default()
            })
            .into_owned()
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// A named prompt builder.
///
/// As a parameter, a template prompt is plain JSON text; a closure prompt is
/// a [`Callable`] wrapping the `Prompt` itself.
#[derive(Clone)]
pub struct Prompt {
    name: Arc<str>,
    template: Option<PromptTemplate>,
    build: PromptFn,
}

impl Prompt {
    /// Prompt built by a closure, identified by `name`.
    pub fn new(
        name: impl Into<Arc<str>>,
        build: impl Fn(&Record) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            template: None,
            build: Arc::new(build),
        }
    }

    /// Prompt rendered from a `{field}` template; its name is the template text.
    pub fn template(text: impl Into<String>) -> Self {
        let template = PromptTemplate::new(text);
        let renderer = template.clone();
        Self {
            name: template.text().into(),
            template: Some(template),
            build: Arc::new(move |record| renderer.render(record)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, record: &Record) -> String {
        (self.build)(record)
    }

    /// Parse a `prompt`-like parameter: template text or a wrapped `Prompt`.
    pub fn from_param(value: &ParamValue, key: &str) -> Result<Self> {
        match value {
            ParamValue::Json(Value::String(text)) => Ok(Self::template(text.clone())),
            other => other.expect_callable::<Prompt>(key),
        }
    }

    pub fn to_param(&self) -> ParamValue {
        match &self.template {
            Some(t) => ParamValue::from(t.text()),
            None => ParamValue::Callable(Callable::new(Arc::clone(&self.name), self.clone())),
        }
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prompt({})", self.name)
    }
}

impl From<Prompt> for ParamValue {
    fn from(prompt: Prompt) -> Self {
        prompt.to_param()
    }
}

impl From<PromptTemplate> for Prompt {
    fn from(template: PromptTemplate) -> Self {
        Self::template(template.text)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::template(text)
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::template(text)
    }
}
