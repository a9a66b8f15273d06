//! # Emotion Observations
//!
//! The provider's response shape is not contractually fixed: the label may
//! sit at the top level, under a nested `data.face` object, or only be
//! implied by a list of scored candidate emotions. [`normalize`] is the one
//! place that knows about those shapes. Everything downstream sees an
//! [`EmotionObservation`], and a response without a usable label becomes an
//! `"unknown"` observation instead of an error.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::recommend::Recommendations;

/// Label used when a response carries no recognizable emotion.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Dominant label reported for a session without observations.
pub const NEUTRAL_LABEL: &str = "neutral";

/// Top-level keys that may directly hold the label.
const LABEL_KEYS: &[&str] = &["emotion", "dominantEmotion", "dominant_emotion", "label"];

/// Keys that may hold the confidence of a directly labeled response.
const CONFIDENCE_KEYS: &[&str] = &["confidence", "score", "probability"];

/// One normalized inference result.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionObservation {
    /// Lower-cased emotion label, [`UNKNOWN_LABEL`] when none was found.
    pub label: String,

    /// Provider confidence in `0.0..=1.0`, if reported.
    pub confidence: Option<f64>,

    /// When the gateway received the result.
    pub timestamp: DateTime<Utc>,

    /// Recommendations attached by the gateway.
    pub recommendations: Option<Recommendations>,
}

impl EmotionObservation {
    pub fn new(label: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.and_then(clamp_confidence),
            timestamp: Utc::now(),
            recommendations: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_LABEL, None)
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }

    #[must_use]
    pub fn with_recommendations(mut self, recommendations: Option<Recommendations>) -> Self {
        self.recommendations = recommendations;
        self
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Parse a raw upstream text payload.
///
/// Returns `None` only when the payload is not JSON at all; any JSON value
/// yields an observation.
pub fn normalize_text(text: &str) -> Option<EmotionObservation> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(normalize(&value)),
        Err(e) => {
            tracing::debug!(error = %e, "Upstream payload is not JSON");
            None
        }
    }
}

/// Extract an [`EmotionObservation`] from any provider response shape.
pub fn normalize(value: &Value) -> EmotionObservation {
    if let Some((label, confidence)) = direct_label(value) {
        return EmotionObservation::new(label, confidence);
    }

    for path in [&["data", "face"][..], &["data"][..], &["face"][..]] {
        if let Some(nested) = pointer(value, path) {
            if let Some((label, confidence)) = direct_label(nested) {
                return EmotionObservation::new(label, confidence);
            }
        }
    }

    if let Some((label, score)) = scored_candidates(value) {
        return EmotionObservation::new(label, Some(score));
    }

    EmotionObservation::unknown()
}

// ─── Shape probes ───────────────────────────────────────────────────────

/// `{"emotion": "happy", "confidence": 0.9}` or
/// `{"emotion": {"name": "happy", "score": 0.9}}`.
fn direct_label(value: &Value) -> Option<(String, Option<f64>)> {
    let object = value.as_object()?;
    for key in LABEL_KEYS {
        match object.get(*key) {
            Some(Value::String(label)) => {
                if let Some(label) = clean_label(label) {
                    return Some((label, confidence_of(value)));
                }
            }
            Some(inner @ Value::Object(_)) => {
                if let Some(label) = inner
                    .get("name")
                    .or_else(|| inner.get("label"))
                    .and_then(Value::as_str)
                    .and_then(clean_label)
                {
                    let confidence = confidence_of(inner).or_else(|| confidence_of(value));
                    return Some((label, confidence));
                }
            }
            _ => {}
        }
    }
    None
}

/// Candidate lists such as `face.predictions[0].emotions[{name, score}]`.
/// The highest-scoring candidate wins; the first one wins a tie.
fn scored_candidates(value: &Value) -> Option<(String, f64)> {
    let candidate_lists = [
        pointer(value, &["face", "predictions"]).and_then(|p| p.get(0)).and_then(|p| p.get("emotions")),
        pointer(value, &["data", "face", "predictions"])
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("emotions")),
        pointer(value, &["predictions"]).and_then(|p| p.get(0)).and_then(|p| p.get("emotions")),
        value.get("emotions"),
    ];

    candidate_lists
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .find_map(|list| best_candidate(list))
}

fn best_candidate(list: &[Value]) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for entry in list {
        let Some(label) = entry
            .get("name")
            .or_else(|| entry.get("label"))
            .and_then(Value::as_str)
            .and_then(clean_label)
        else {
            continue;
        };
        let Some(score) = entry.get("score").and_then(Value::as_f64) else {
            continue;
        };
        if score.is_nan() {
            continue;
        }
        if best.as_ref().is_none_or(|(_, top)| score > *top) {
            best = Some((label, score));
        }
    }
    best
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn pointer<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn confidence_of(value: &Value) -> Option<f64> {
    CONFIDENCE_KEYS
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_f64))
}

fn clean_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

fn clamp_confidence(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 1.0))
    }
}
