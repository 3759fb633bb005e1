//! Site registry + page-fetch collaborators (fixture-first, HTML selectors over HTTP).

pub mod fixture;
pub mod html;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use estate_core::RawListing;
use estate_storage::FetchError;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fixture::FixtureFetcher;
pub use html::HtmlFetcher;

pub const CRATE_NAME: &str = "estate-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserType {
    Fixture,
    Html,
}

/// CSS selectors for one site. Field selectors may target an attribute with
/// `selector@attr`, e.g. `a.title@href`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub detail_link: Option<String>,
    #[serde(default)]
    pub detail_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitOverride {
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub parser_type: ParserType,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub selectors: SelectorSet,
    #[serde(default)]
    pub rate_limit: RateLimitOverride,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SiteConfig {
    /// Minimal enabled fixture-backed site, handy for tests and ad hoc registries.
    pub fn fixture(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            display_name: None,
            enabled: true,
            priority: 0,
            parser_type: ParserType::Fixture,
            listing_url: None,
            selectors: SelectorSet::default(),
            rate_limit: RateLimitOverride::default(),
            notes: None,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.site_key)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading site registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing site registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid site registry: {0}")]
    Invalid(String),
}

/// Read-only `site_key -> SiteConfig` mapping loaded from `sites.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRegistry {
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

impl SiteRegistry {
    pub fn new(sites: Vec<SiteConfig>) -> Result<Self, RegistryError> {
        let registry = Self { sites };
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for site in &self.sites {
            let key = site.site_key.trim();
            if key.is_empty() {
                return Err(RegistryError::Invalid("site with empty site_key".into()));
            }
            if key != site.site_key {
                return Err(RegistryError::Invalid(format!(
                    "site_key `{}` has surrounding whitespace",
                    site.site_key
                )));
            }
            if !seen.insert(key) {
                return Err(RegistryError::Invalid(format!("duplicate site_key `{key}`")));
            }
            if site.rate_limit.max_pages == Some(0) {
                return Err(RegistryError::Invalid(format!(
                    "site `{key}`: rate_limit.max_pages must be positive"
                )));
            }
            if site.parser_type == ParserType::Html {
                validate_html_site(site)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, site_key: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.site_key == site_key)
    }

    /// All sites ordered by ascending `priority`, ties kept in file order.
    pub fn in_priority_order(&self) -> Vec<&SiteConfig> {
        let mut ordered = self.sites.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|s| s.priority);
        ordered
    }

    pub fn enabled_in_priority_order(&self) -> Vec<&SiteConfig> {
        self.in_priority_order()
            .into_iter()
            .filter(|s| s.enabled)
            .collect()
    }
}

fn validate_html_site(site: &SiteConfig) -> Result<(), RegistryError> {
    let key = &site.site_key;
    if site.listing_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
        return Err(RegistryError::Invalid(format!(
            "html site `{key}` needs a listing_url"
        )));
    }
    let Some(item) = site.selectors.item.as_deref() else {
        return Err(RegistryError::Invalid(format!(
            "html site `{key}` needs selectors.item"
        )));
    };
    if site.selectors.fields.is_empty() {
        return Err(RegistryError::Invalid(format!(
            "html site `{key}` needs at least one field selector"
        )));
    }

    let all = std::iter::once(item)
        .chain(site.selectors.detail_link.as_deref())
        .chain(site.selectors.fields.values().map(String::as_str))
        .chain(site.selectors.detail_fields.values().map(String::as_str));
    for raw in all {
        let (css, _) = split_selector(raw);
        Selector::parse(css).map_err(|e| {
            RegistryError::Invalid(format!("site `{key}`: invalid selector `{raw}`: {e}"))
        })?;
    }
    Ok(())
}

/// Split `css@attr` into the CSS part and the optional attribute name.
pub(crate) fn split_selector(raw: &str) -> (&str, Option<&str>) {
    match raw.rsplit_once('@') {
        Some((css, attr)) if !attr.is_empty() && !attr.contains(|c: char| c.is_whitespace() || c == ']') => {
            (css.trim(), Some(attr.trim()))
        }
        _ => (raw.trim(), None),
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("site `{site_key}` has no {what} configured")]
    NotConfigured {
        site_key: String,
        what: &'static str,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The page-fetch collaborator driven by a site task.
///
/// Pages are numbered from 1. An empty page marks the end of the listing sequence.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, site: &SiteConfig, page: u32) -> Result<Vec<RawListing>, AdapterError>;

    /// Fields found on the item's detail page, to be overlaid on the listing fields.
    async fn fetch_detail(&self, site: &SiteConfig, item: &RawListing) -> Result<RawListing, AdapterError>;
}

/// Routes each site to the fetcher matching its `parser_type`.
#[derive(Clone)]
pub struct RegistryFetcher {
    fixture: FixtureFetcher,
    html: Option<Arc<HtmlFetcher>>,
}

impl RegistryFetcher {
    pub fn new(fixture: FixtureFetcher, html: Option<Arc<HtmlFetcher>>) -> Self {
        Self { fixture, html }
    }

    fn html_for(&self, site: &SiteConfig) -> Result<&HtmlFetcher, AdapterError> {
        self.html.as_deref().ok_or_else(|| AdapterError::NotConfigured {
            site_key: site.site_key.clone(),
            what: "http client",
        })
    }
}

#[async_trait]
impl PageFetcher for RegistryFetcher {
    async fn fetch_page(&self, site: &SiteConfig, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        match site.parser_type {
            ParserType::Fixture => self.fixture.fetch_page(site, page).await,
            ParserType::Html => self.html_for(site)?.fetch_page(site, page).await,
        }
    }

    async fn fetch_detail(&self, site: &SiteConfig, item: &RawListing) -> Result<RawListing, AdapterError> {
        match site.parser_type {
            ParserType::Fixture => self.fixture.fetch_detail(site, item).await,
            ParserType::Html => self.html_for(site)?.fetch_detail(site, item).await,
        }
    }
}
