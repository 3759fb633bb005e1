//! Duplicate detection against the current run and the cross-run history cache.
//!
//! Exact fingerprint matches are duplicates. Otherwise the title alone and a weighted
//! Jaro-Winkler score over normalized title and location must both clear
//! `similarity_threshold`, and the prices must agree within `price_tolerance`. The first record seen wins; later matches only refresh
//! its last-seen time.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use estate_core::{normalize_text, ListingRecord};
use estate_storage::{DedupHistory, HistoryEntry};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub price_tolerance: f64,
    pub title_weight: f64,
    pub location_weight: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            price_tolerance: 0.05,
            title_weight: 0.7,
            location_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    Duplicate {
        retained_fingerprint: String,
        similarity: f64,
        exact: bool,
    },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    fingerprint: String,
    title: String,
    location: String,
    price: Option<f64>,
}

impl Candidate {
    fn new(fingerprint: &str, title: Option<&str>, location: Option<&str>, price: Option<f64>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            title: DedupEngine::normalize_key_fragment(title.unwrap_or_default()),
            location: DedupEngine::normalize_key_fragment(location.unwrap_or_default()),
            price,
        }
    }
}

pub struct DedupEngine {
    config: DedupConfig,
    candidates: Vec<Candidate>,
    by_fingerprint: HashMap<String, usize>,
    history: DedupHistory,
    retained_this_run: usize,
}

impl DedupEngine {
    /// Seed the comparison set with every fingerprint in `history`.
    pub fn new(config: DedupConfig, history: DedupHistory) -> Self {
        let mut engine = Self {
            config,
            candidates: Vec::with_capacity(history.len()),
            by_fingerprint: HashMap::with_capacity(history.len()),
            history: DedupHistory::default(),
            retained_this_run: 0,
        };
        for entry in history.iter() {
            engine.remember(Candidate::new(
                &entry.fingerprint,
                entry.title.as_deref(),
                entry.location.as_deref(),
                entry.price,
            ));
        }
        engine.history = history;
        engine
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        normalize_text(input)
    }

    pub fn similarity(&self, title_a: &str, location_a: &str, title_b: &str, location_b: &str) -> f64 {
        let weight_sum = self.config.title_weight + self.config.location_weight;
        if weight_sum <= 0.0 {
            return 0.0;
        }
        let title_score = jaro_winkler(title_a, title_b);
        let location_score = jaro_winkler(location_a, location_b);
        (title_score * self.config.title_weight + location_score * self.config.location_weight) / weight_sum
    }

    /// Both missing counts as agreement; exactly one missing never does.
    pub fn prices_within_tolerance(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                let scale = a.abs().max(b.abs());
                scale == 0.0 || (a - b).abs() / scale <= tolerance
            }
            _ => false,
        }
    }

    /// Classify `record`. A unique record joins the comparison set; a duplicate refreshes
    /// the retained record's last-seen time.
    pub fn check(&mut self, record: &ListingRecord) -> DedupVerdict {
        if self.by_fingerprint.contains_key(&record.fingerprint) {
            self.history.touch(&record.fingerprint, record.last_seen_at);
            return DedupVerdict::Duplicate {
                retained_fingerprint: record.fingerprint.clone(),
                similarity: 1.0,
                exact: true,
            };
        }

        let incoming = Candidate::new(
            &record.fingerprint,
            record.title.as_deref(),
            record.location.as_deref(),
            record.price,
        );
        if let Some((fingerprint, similarity)) = self.best_fuzzy_match(&incoming) {
            self.history.touch(&fingerprint, record.last_seen_at);
            return DedupVerdict::Duplicate {
                retained_fingerprint: fingerprint,
                similarity,
                exact: false,
            };
        }

        self.remember(incoming);
        self.history.observe(HistoryEntry::from_record(record));
        self.retained_this_run += 1;
        DedupVerdict::Unique
    }

    fn best_fuzzy_match(&self, incoming: &Candidate) -> Option<(String, f64)> {
        self.candidates
            .iter()
            .filter(|c| Self::prices_within_tolerance(c.price, incoming.price, self.config.price_tolerance))
            .filter(|c| jaro_winkler(&incoming.title, &c.title) >= self.config.similarity_threshold)
            .map(|c| (c, self.similarity(&incoming.title, &incoming.location, &c.title, &c.location)))
            .filter(|(_, score)| *score >= self.config.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, score)| (c.fingerprint.clone(), score))
    }

    /// Drop fingerprints this run retained so a re-execution sees them as new again.
    /// Entries loaded from earlier runs are never forgotten.
    pub fn forget<'a>(&mut self, fingerprints: impl IntoIterator<Item = &'a str>) -> usize {
        let seeded = self.candidates.len() - self.retained_this_run;
        let doomed = fingerprints
            .into_iter()
            .filter(|fp| self.by_fingerprint.get(*fp).is_some_and(|&i| i >= seeded))
            .map(str::to_string)
            .collect::<HashSet<_>>();
        if doomed.is_empty() {
            return 0;
        }

        self.candidates.retain(|c| !doomed.contains(&c.fingerprint));
        self.by_fingerprint = self
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.fingerprint.clone(), i))
            .collect();
        for fingerprint in &doomed {
            self.history.remove(fingerprint);
        }
        self.retained_this_run -= doomed.len();
        doomed.len()
    }

    fn remember(&mut self, candidate: Candidate) {
        self.by_fingerprint
            .insert(candidate.fingerprint.clone(), self.candidates.len());
        self.candidates.push(candidate);
    }

    pub fn retained_this_run(&self) -> usize {
        self.retained_this_run
    }

    pub fn known_fingerprints(&self) -> usize {
        self.candidates.len()
    }

    pub fn last_seen(&self, fingerprint: &str) -> Option<DateTime<Utc>> {
        self.history.get(fingerprint).map(|e| e.last_seen_at)
    }

    pub fn history(&self) -> &DedupHistory {
        &self.history
    }
}
