//! `<private>` tag stripping applied before anything reaches the store or a provider.

use regex::Regex;
use std::sync::LazyLock;

static PRIVATE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<private>.*?</private>").expect("valid regex"));

/// Remove every `<private>…</private>` span and trim the result.
pub fn strip_private(text: &str) -> String {
    PRIVATE_TAG.replace_all(text, "").trim().to_string()
}

/// True when nothing remains once private spans are removed.
pub fn is_entirely_private(text: &str) -> bool {
    !text.trim().is_empty() && strip_private(text).is_empty()
}

/// Strip private spans from every string inside a JSON value.
pub fn strip_private_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(strip_private(s)),
        Value::Array(items) => Value::Array(items.iter().map(strip_private_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), strip_private_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
