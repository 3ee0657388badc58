//! Request and response types for the HTTP API.

use crate::inference::Detection;
use crate::language::LanguagePair;
use crate::registry::InstallOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Most alternatives a caller may ask for per text.
pub const MAX_ALTERNATIVES: usize = 10;

/// A single value or a list of them, as `q` and `target` accept either.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn is_many(&self) -> bool {
        matches!(self, OneOrMany::Many(_))
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TranslateRequest {
    pub q: OneOrMany<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub target: OneOrMany<String>,
    /// Extra hypotheses per text. Negative counts as zero.
    #[serde(default)]
    pub alternatives: i64,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl TranslateRequest {
    pub fn alternatives(&self) -> usize {
        usize::try_from(self.alternatives.max(0))
            .unwrap_or(MAX_ALTERNATIVES)
            .min(MAX_ALTERNATIVES)
    }
}

fn default_source() -> String {
    crate::language::AUTO.to_string()
}

/// One value per text: bare for a single `q`, a list for a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PerText<T> {
    One(T),
    Many(Vec<T>),
}

/// Per-text values for one target, or keyed by target code for a target list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PerTarget<T> {
    One(PerText<T>),
    Many(BTreeMap<String, PerText<T>>),
}

impl<T> PerTarget<T> {
    /// Shape `values`, grouped by target in request order, after the request.
    pub fn shape(
        values: Vec<(String, Vec<T>)>,
        many_texts: bool,
        many_targets: bool,
    ) -> Option<Self> {
        let per_text = |mut items: Vec<T>| {
            if many_texts {
                Some(PerText::Many(items))
            } else {
                items.pop().map(PerText::One)
            }
        };
        if many_targets {
            values
                .into_iter()
                .map(|(target, items)| per_text(items).map(|v| (target, v)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(PerTarget::Many)
        } else {
            values
                .into_iter()
                .next()
                .and_then(|(_, items)| per_text(items))
                .map(PerTarget::One)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    #[serde(rename = "translatedText")]
    pub translated_text: PerTarget<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<PerTarget<Vec<String>>>,
    #[serde(rename = "detectedLanguage", skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<Detection>,
    pub path: PerTarget<Vec<LanguagePair>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DetectRequest {
    pub q: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelActionResponse {
    #[serde(flatten)]
    pub pair: LanguagePair,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<InstallOutcome>,
    pub loaded: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub req_limit: Option<u64>,
    #[serde(default)]
    pub char_limit: Option<u64>,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RevokeKeyResponse {
    pub revoked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn q_and_target_accept_one_or_many() {
        let request: TranslateRequest =
            serde_json::from_value(json!({"q": ["a", "b"], "target": "fr"})).unwrap();
        assert_eq!(request.q, OneOrMany::Many(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(request.target, OneOrMany::One("fr".to_string()));
        assert_eq!(request.source, "auto");
        assert_eq!(request.alternatives(), 0);
    }

    #[test]
    fn alternatives_are_clamped() {
        for (raw, expected) in [(-3, 0), (2, 2), (1_000_000, MAX_ALTERNATIVES)] {
            let request: TranslateRequest = serde_json::from_value(
                json!({"q": "a", "target": "fr", "alternatives": raw}),
            )
            .unwrap();
            assert_eq!(request.alternatives(), expected);
        }
    }

    #[test]
    fn results_take_the_shape_of_the_request() {
        let shaped = |values: Vec<(&str, Vec<u32>)>, many_texts, many_targets| {
            let values = values
                .into_iter()
                .map(|(target, items)| (target.to_string(), items))
                .collect();
            serde_json::to_value(PerTarget::shape(values, many_texts, many_targets).unwrap())
                .unwrap()
        };

        assert_eq!(shaped(vec![("fr", vec![1])], false, false), json!(1));
        assert_eq!(shaped(vec![("fr", vec![1, 2])], true, false), json!([1, 2]));
        assert_eq!(
            shaped(vec![("fr", vec![1]), ("de", vec![3])], false, true),
            json!({"de": 3, "fr": 1})
        );
        assert_eq!(
            shaped(vec![("fr", vec![1, 2]), ("de", vec![3, 4])], true, true),
            json!({"de": [3, 4], "fr": [1, 2]})
        );
        assert_eq!(PerTarget::<u32>::shape(Vec::new(), false, false), None);
    }
}
