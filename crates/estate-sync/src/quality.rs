//! Completeness scoring for normalized listings.

use estate_core::ListingRecord;
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.40;

/// Titles shorter than this earn half the title weight.
pub const MIN_TITLE_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub title: f64,
    pub price: f64,
    pub location: f64,
    pub bedrooms: f64,
    pub bathrooms: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            title: 0.35,
            price: 0.35,
            location: 0.15,
            bedrooms: 0.075,
            bathrooms: 0.075,
        }
    }
}

impl QualityWeights {
    fn total(&self) -> f64 {
        self.title + self.price + self.location + self.bedrooms + self.bathrooms
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFilter {
    weights: QualityWeights,
    threshold: f64,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self::new(QualityWeights::default(), DEFAULT_QUALITY_THRESHOLD)
    }
}

impl QualityFilter {
    pub fn new(weights: QualityWeights, threshold: f64) -> Self {
        Self { weights, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Weighted presence score in `[0, 1]`. Land and plot listings get the
    /// bedroom/bathroom weights for free.
    pub fn score(&self, record: &ListingRecord) -> f64 {
        let w = &self.weights;
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }

        let title_chars = record
            .title
            .as_deref()
            .map(|t| t.trim().chars().count())
            .unwrap_or(0);
        let title = match title_chars {
            0 => 0.0,
            n if n < MIN_TITLE_CHARS => w.title * 0.5,
            _ => w.title,
        };
        let price = match record.price {
            Some(p) if p > 0.0 => w.price,
            _ => 0.0,
        };
        let location = match record.location.as_deref() {
            Some(l) if !l.trim().is_empty() => w.location,
            _ => 0.0,
        };
        let land = record.is_land();
        let bedrooms = if land || record.bedrooms.is_some() { w.bedrooms } else { 0.0 };
        let bathrooms = if land || record.bathrooms.is_some() { w.bathrooms } else { 0.0 };

        ((title + price + location + bedrooms + bathrooms) / total).clamp(0.0, 1.0)
    }

    pub fn accepts(&self, score: f64) -> bool {
        score >= self.threshold
    }
}
