//! Fixture-backed fetcher: `<root>/<site_key>/page_<n>.json` holds a JSON array of flat
//! listing objects, `<root>/<site_key>/details.json` maps detail URLs to extra fields.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use estate_core::RawListing;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::{AdapterError, PageFetcher, SiteConfig};

const DETAIL_URL_KEY: &str = "detail_url";

#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, site_key: &str, page: u32) -> PathBuf {
        self.root.join(site_key).join(format!("page_{page}.json"))
    }

    pub fn details_path(&self, site_key: &str) -> PathBuf {
        self.root.join(site_key).join("details.json")
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch_page(&self, site: &SiteConfig, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        let path = self.page_path(&site.site_key, page);
        let Some(value) = read_json_if_exists(&path)? else {
            debug!(site_key = %site.site_key, page, "no fixture page; end of listings");
            return Ok(Vec::new());
        };
        let items = value.as_array().ok_or_else(|| {
            AdapterError::Message(format!("{} must hold a JSON array", path.display()))
        })?;
        items
            .iter()
            .map(|item| {
                item.as_object().map(listing_from_object).ok_or_else(|| {
                    AdapterError::Message(format!("{}: listing entries must be objects", path.display()))
                })
            })
            .collect()
    }

    async fn fetch_detail(&self, site: &SiteConfig, item: &RawListing) -> Result<RawListing, AdapterError> {
        let Some(detail_url) = item.detail_url.as_deref() else {
            return Ok(RawListing::new());
        };
        let path = self.details_path(&site.site_key);
        let details = read_json_if_exists(&path)?.unwrap_or(JsonValue::Null);
        details
            .get(detail_url)
            .and_then(JsonValue::as_object)
            .map(listing_from_object)
            .ok_or_else(|| AdapterError::Message(format!("no detail fixture for {detail_url}")))
    }
}

fn read_json_if_exists(path: &Path) -> Result<Option<JsonValue>, AdapterError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context(format!("reading {}", path.display()))
                .into())
        }
    };
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

fn listing_from_object(object: &Map<String, JsonValue>) -> RawListing {
    let mut fields = BTreeMap::new();
    let mut detail_url = None;
    for (key, value) in object {
        let Some(text) = scalar_text(value) else {
            continue;
        };
        if key == DETAIL_URL_KEY {
            detail_url = Some(text);
        } else {
            fields.insert(key.clone(), text);
        }
    }
    RawListing { fields, detail_url }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: PathBuf, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn reads_pages_until_missing_file() {
        let dir = tempdir().expect("tempdir");
        let fetcher = FixtureFetcher::new(dir.path());
        write(
            fetcher.page_path("propertyhub", 1),
            r#"[{"title": "Terrace duplex", "price": 45000000, "bedrooms": 4, "detail_url": "https://p.example/1", "tags": ["new"]}]"#,
        );
        let site = SiteConfig::fixture("propertyhub");

        let first = fetcher.fetch_page(&site, 1).await.expect("page 1");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].get("price"), Some("45000000"));
        assert_eq!(first[0].get("bedrooms"), Some("4"));
        assert_eq!(first[0].get("tags"), None);
        assert_eq!(first[0].detail_url.as_deref(), Some("https://p.example/1"));

        assert!(fetcher.fetch_page(&site, 2).await.expect("page 2").is_empty());
    }

    #[tokio::test]
    async fn malformed_page_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let fetcher = FixtureFetcher::new(dir.path());
        write(fetcher.page_path("propertyhub", 1), r#"{"title": "not a list"}"#);
        let err = fetcher
            .fetch_page(&SiteConfig::fixture("propertyhub"), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("JSON array"));
    }

    #[tokio::test]
    async fn detail_lookup_by_url() {
        let dir = tempdir().expect("tempdir");
        let fetcher = FixtureFetcher::new(dir.path());
        write(
            fetcher.details_path("propertyhub"),
            r#"{"https://p.example/1": {"bathrooms": "3", "property_type": "Duplex"}}"#,
        );
        let site = SiteConfig::fixture("propertyhub");

        let known = RawListing::new().with_detail_url("https://p.example/1");
        let detail = fetcher.fetch_detail(&site, &known).await.expect("detail");
        assert_eq!(detail.get("bathrooms"), Some("3"));

        let unknown = RawListing::new().with_detail_url("https://p.example/404");
        assert!(fetcher.fetch_detail(&site, &unknown).await.is_err());

        let without_link = fetcher.fetch_detail(&site, &RawListing::new()).await.expect("no link");
        assert!(without_link.fields.is_empty());
    }
}
