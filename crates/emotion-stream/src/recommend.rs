//! # Recommendations
//!
//! The gateway attaches outfit/food/music suggestions to each emotion update
//! through the [`Recommender`] trait. Real lookups (places search, wardrobe
//! storage) live outside this crate; [`StaticRecommender`] is the built-in
//! table used when nothing else is plugged in.

use serde::{Deserialize, Serialize};

/// Client-reported position, sent as a `location` control message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lng: f64,
}

impl GeoLocation {
    /// `None` unless both coordinates are finite and in range.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }
}

/// A nearby place suggested for the current mood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// Suggestions attached to an outbound emotion update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Recommendations {
    pub outfit: String,
    pub food: String,
    pub music: String,
    #[serde(alias = "delivery", skip_serializing_if = "Vec::is_empty")]
    pub nearby_restaurants: Vec<NearbyPlace>,
}

/// Source of recommendations for a label and optional location.
pub trait Recommender: Send + Sync {
    fn recommend(&self, label: &str, location: Option<&GeoLocation>) -> Option<Recommendations>;
}

/// Fixed lookup table keyed by emotion label.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRecommender;

impl StaticRecommender {
    fn outfit(label: &str) -> &'static str {
        match label {
            "happy" => "Bright casual outfit",
            "sad" => "Cozy sweater",
            "neutral" => "Smart casual",
            "angry" => "Dark tones",
            _ => "Comfort wear",
        }
    }

    fn music(label: &str) -> &'static str {
        match label {
            "happy" => "Upbeat pop",
            "sad" => "Soft jazz",
            "angry" => "Rock",
            "stress" => "Lo-fi chill",
            _ => "Ambient",
        }
    }

    fn food(label: &str) -> &'static str {
        match label {
            "happy" => "Fruit salad",
            "sad" => "Chocolate",
            "neutral" => "Sandwich",
            "angry" => "Spicy curry",
            "stress" => "Smoothie",
            _ => "Snack",
        }
    }
}

impl Recommender for StaticRecommender {
    fn recommend(&self, label: &str, _location: Option<&GeoLocation>) -> Option<Recommendations> {
        Some(Recommendations {
            outfit: Self::outfit(label).to_string(),
            food: Self::food(label).to_string(),
            music: Self::music(label).to_string(),
            nearby_restaurants: Vec::new(),
        })
    }
}

/// Recommender that never suggests anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecommendations;

impl Recommender for NoRecommendations {
    fn recommend(&self, _label: &str, _location: Option<&GeoLocation>) -> Option<Recommendations> {
        None
    }
}
