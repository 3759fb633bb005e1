//! Partition the requested site set into ordered batches.

use std::collections::HashSet;

use estate_adapters::SiteRegistry;
use estate_core::Batch;
use serde::Serialize;
use tracing::warn;

use crate::PipelineError;

/// Batch width for a run over `site_count` sites.
pub fn batch_size_for(site_count: usize) -> usize {
    match site_count {
        0..=10 => site_count.max(1),
        11..=30 => 10,
        31..=50 => 15,
        _ => 20,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    /// Subset entries that were unknown or disabled.
    pub dropped: Vec<String>,
    /// The explicit subset resolved to nothing and every enabled site was used instead.
    pub fell_back_to_enabled: bool,
}

impl BatchPlan {
    pub fn site_count(&self) -> usize {
        self.batches.iter().map(|b| b.site_keys.len()).sum()
    }

    pub fn site_keys(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|b| b.site_keys.iter().cloned())
            .collect()
    }
}

pub struct BatchPlanner;

impl BatchPlanner {
    pub fn plan(registry: &SiteRegistry, explicit_subset: Option<&[String]>) -> Result<BatchPlan, PipelineError> {
        let enabled = registry
            .enabled_in_priority_order()
            .into_iter()
            .map(|s| s.site_key.clone())
            .collect::<Vec<_>>();

        let mut dropped = Vec::new();
        let mut fell_back_to_enabled = false;
        let selected = match explicit_subset {
            None => enabled,
            Some(subset) => {
                let mut wanted = HashSet::new();
                for key in subset {
                    let key = key.trim();
                    match registry.get(key) {
                        Some(site) if site.enabled => {
                            wanted.insert(key.to_string());
                        }
                        Some(_) => {
                            warn!(site_key = key, "requested site is disabled; dropping");
                            dropped.push(key.to_string());
                        }
                        None => {
                            warn!(site_key = key, "requested site is not in the registry; dropping");
                            dropped.push(key.to_string());
                        }
                    }
                }
                if wanted.is_empty() {
                    warn!("no valid sites in requested subset; falling back to all enabled sites");
                    fell_back_to_enabled = true;
                    enabled
                } else {
                    enabled.into_iter().filter(|k| wanted.contains(k)).collect()
                }
            }
        };

        if selected.is_empty() {
            return Err(PipelineError::Validation(
                "no enabled sites in the registry".to_string(),
            ));
        }

        Ok(BatchPlan {
            batches: Self::partition(selected),
            dropped,
            fell_back_to_enabled,
        })
    }

    /// Chunk already-ordered site keys using the size table.
    pub fn partition(site_keys: Vec<String>) -> Vec<Batch> {
        let size = batch_size_for(site_keys.len());
        site_keys
            .chunks(size)
            .enumerate()
            .map(|(index, chunk)| Batch::new(index, chunk.to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_adapters::SiteConfig;

    fn registry(n: usize) -> SiteRegistry {
        SiteRegistry::new((0..n).map(|i| SiteConfig::fixture(format!("site-{i:03}"))).collect())
            .expect("valid registry")
    }

    fn sizes(plan: &BatchPlan) -> Vec<usize> {
        plan.batches.iter().map(|b| b.site_keys.len()).collect()
    }

    #[test]
    fn size_table_matches_thresholds() {
        assert_eq!(batch_size_for(1), 1);
        assert_eq!(batch_size_for(10), 10);
        assert_eq!(batch_size_for(11), 10);
        assert_eq!(batch_size_for(30), 10);
        assert_eq!(batch_size_for(31), 15);
        assert_eq!(batch_size_for(50), 15);
        assert_eq!(batch_size_for(51), 20);
    }

    #[test]
    fn every_site_lands_in_exactly_one_batch() {
        for n in [1usize, 7, 10, 11, 29, 30, 31, 49, 50, 51, 120] {
            let plan = BatchPlanner::plan(&registry(n), None).expect("plan");
            let keys = plan.site_keys();
            let unique = keys.iter().collect::<HashSet<_>>();
            assert_eq!(keys.len(), n, "n={n}");
            assert_eq!(unique.len(), n, "n={n}");
            assert!(plan.batches.iter().all(|b| b.site_keys.len() <= batch_size_for(n)));
            assert!(plan.batches.iter().enumerate().all(|(i, b)| b.index == i));
        }
        assert_eq!(sizes(&BatchPlanner::plan(&registry(51), None).unwrap()), vec![20, 20, 11]);
        assert_eq!(sizes(&BatchPlanner::plan(&registry(45), None).unwrap()), vec![15, 15, 15]);
        assert_eq!(sizes(&BatchPlanner::plan(&registry(8), None).unwrap()), vec![8]);
    }

    #[test]
    fn subset_drops_invalid_entries_and_keeps_registry_order() {
        let mut sites = (0..5).map(|i| SiteConfig::fixture(format!("s{i}"))).collect::<Vec<_>>();
        sites[3].enabled = false;
        let registry = SiteRegistry::new(sites).unwrap();

        let subset = ["s4", "nope", "s1", "s3", "s1"].map(String::from);
        let plan = BatchPlanner::plan(&registry, Some(&subset[..])).expect("plan");
        assert_eq!(plan.site_keys(), vec!["s1", "s4"]);
        assert_eq!(plan.dropped, vec!["nope", "s3"]);
        assert!(!plan.fell_back_to_enabled);
    }

    #[test]
    fn empty_valid_subset_falls_back_to_enabled_sites() {
        let plan = BatchPlanner::plan(&registry(3), Some(&["ghost".to_string()][..])).expect("plan");
        assert!(plan.fell_back_to_enabled);
        assert_eq!(plan.site_count(), 3);
    }

    #[test]
    fn no_enabled_sites_is_a_validation_error() {
        let mut site = SiteConfig::fixture("only");
        site.enabled = false;
        let registry = SiteRegistry::new(vec![site]).unwrap();
        assert!(matches!(
            BatchPlanner::plan(&registry, None),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn planning_is_deterministic() {
        let registry = registry(37);
        assert_eq!(
            BatchPlanner::plan(&registry, None).unwrap(),
            BatchPlanner::plan(&registry, None).unwrap()
        );
    }
}
