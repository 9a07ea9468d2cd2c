//! Interpretation of raw tagger/scorer payloads.

use rand::Rng;
use serde_json::Value;

use crate::config::Config;

pub const TIMEOUT_MARKER: &str = "timeout_fallback";
pub const ERROR_MARKER: &str = "error_fallback";
pub const FALLBACK_SCORE_MIN: f64 = 2.0;
pub const FALLBACK_SCORE_MAX: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct TagPolicy {
    pub general_threshold: f64,
    pub character_threshold: f64,
    pub max_general: usize,
}

impl TagPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            general_threshold: cfg.tag_threshold,
            character_threshold: cfg.character_threshold,
            max_general: cfg.max_general_tags,
        }
    }
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagResult {
    /// General tags, most confident first.
    pub general: Vec<String>,
    /// Comma-joined general tags, or a fallback marker.
    pub summary: String,
    pub characters: Vec<String>,
}

impl TagResult {
    pub fn fallback(marker: &str) -> Self {
        Self { general: Vec::new(), summary: marker.to_string(), characters: Vec::new() }
    }

    pub fn is_fallback(&self) -> bool {
        self.summary == TIMEOUT_MARKER || self.summary == ERROR_MARKER
    }
}

/// Accepts either `{"tag": conf, ...}` or the label form
/// `{"label": .., "confidences": [{"label": tag, "confidence": conf}, ..]}`.
/// Entries without a numeric confidence are skipped.
fn confidences(value: &Value) -> Vec<(String, f64)> {
    if let Some(list) = value.get("confidences").and_then(Value::as_array) {
        return list
            .iter()
            .filter_map(|e| {
                let label = e.get("label")?.as_str()?;
                let conf = e.get("confidence")?.as_f64()?;
                Some((label.to_string(), conf))
            })
            .collect();
    }
    match value.as_object() {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|c| (k.clone(), c)))
            .collect(),
        None => Vec::new(),
    }
}

fn ranked(value: &Value, threshold: f64, cap: Option<usize>) -> Vec<String> {
    let mut kept: Vec<(String, f64)> = confidences(value)
        .into_iter()
        .filter(|(_, c)| c.is_finite() && *c > threshold)
        .collect();
    kept.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let iter = kept.into_iter().map(|(t, _)| t);
    match cap {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

/// Tagger payload: `[summary, rating, characters, general]`, or an object with
/// `general` and `character` keys.
pub fn parse_tags(payload: &Value, policy: &TagPolicy) -> TagResult {
    let (characters, general) = match payload {
        Value::Array(items) if items.len() >= 4 => (&items[2], &items[3]),
        Value::Object(map) => (
            map.get("character").unwrap_or(&Value::Null),
            map.get("general").unwrap_or(&Value::Null),
        ),
        _ => return TagResult::fallback(ERROR_MARKER),
    };
    let general = ranked(general, policy.general_threshold, Some(policy.max_general));
    let characters = ranked(characters, policy.character_threshold, None);
    TagResult { summary: general.join(", "), general, characters }
}

/// Scorer payload: a number, a numeric string, or a list whose first entry
/// is either.
pub fn parse_score(payload: &Value) -> Option<f64> {
    let v = match payload {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let score = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    score.is_finite().then_some(score)
}

pub fn fallback_score<R: Rng>(rng: &mut R) -> f64 {
    rng.gen_range(FALLBACK_SCORE_MIN..=FALLBACK_SCORE_MAX)
}
