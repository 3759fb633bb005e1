//! HTML fetcher: pulls `listing_url` over HTTP and applies the site's CSS selectors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use estate_core::RawListing;
use estate_storage::{HttpFetcher, Url};
use scraper::{ElementRef, Html, Selector};

use crate::{split_selector, AdapterError, PageFetcher, SiteConfig};

const PAGE_PLACEHOLDER: &str = "{page}";

pub struct HtmlFetcher {
    http: Arc<HttpFetcher>,
}

impl HtmlFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }

    async fn get_text(&self, site_key: &str, url: &str) -> Result<(String, String), AdapterError> {
        let resp = self.http.fetch_bytes(site_key, url).await?;
        Ok((String::from_utf8_lossy(&resp.body).into_owned(), resp.final_url))
    }
}

/// Listing URL for `page`. A URL without `{page}` has exactly one page.
pub fn page_url(site: &SiteConfig, page: u32) -> Result<Option<String>, AdapterError> {
    let template = site
        .listing_url
        .as_deref()
        .ok_or_else(|| AdapterError::NotConfigured {
            site_key: site.site_key.clone(),
            what: "listing_url",
        })?;
    if template.contains(PAGE_PLACEHOLDER) {
        Ok(Some(template.replace(PAGE_PLACEHOLDER, &page.to_string())))
    } else if page == 1 {
        Ok(Some(template.to_string()))
    } else {
        Ok(None)
    }
}

#[async_trait]
impl PageFetcher for HtmlFetcher {
    async fn fetch_page(&self, site: &SiteConfig, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        let Some(url) = page_url(site, page)? else {
            return Ok(Vec::new());
        };
        let (body, final_url) = self.get_text(&site.site_key, &url).await?;
        parse_listing_document(site, &body, &final_url)
    }

    async fn fetch_detail(&self, site: &SiteConfig, item: &RawListing) -> Result<RawListing, AdapterError> {
        let Some(detail_url) = item.detail_url.as_deref() else {
            return Ok(RawListing::new());
        };
        if site.selectors.detail_fields.is_empty() {
            return Ok(RawListing::new());
        }
        let (body, _) = self.get_text(&site.site_key, detail_url).await?;
        parse_detail_document(site, &body)
    }
}

fn compile(raw: &str) -> Result<(Selector, Option<String>), AdapterError> {
    let (css, attr) = split_selector(raw);
    let selector = Selector::parse(css)
        .map_err(|e| AdapterError::Message(format!("invalid selector `{raw}`: {e}")))?;
    Ok((selector, attr.map(ToString::to_string)))
}

fn compile_fields(fields: &BTreeMap<String, String>) -> Result<Vec<(String, Selector, Option<String>)>, AdapterError> {
    fields
        .iter()
        .map(|(name, raw)| {
            let (selector, attr) = compile(raw)?;
            Ok((name.clone(), selector, attr))
        })
        .collect()
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn extract(scope: ElementRef<'_>, selector: &Selector, attr: Option<&str>) -> Option<String> {
    let node = scope.select(selector).next()?;
    match attr {
        Some(attr) => node.value().attr(attr).and_then(text_or_none),
        None => text_or_none(&node.text().collect::<String>()),
    }
}

/// Parse one listing page. Detail links are resolved against `base_url`.
pub fn parse_listing_document(site: &SiteConfig, body: &str, base_url: &str) -> Result<Vec<RawListing>, AdapterError> {
    let item_selector = site
        .selectors
        .item
        .as_deref()
        .ok_or_else(|| AdapterError::NotConfigured {
            site_key: site.site_key.clone(),
            what: "selectors.item",
        })?;
    let (item, _) = compile(item_selector)?;
    let fields = compile_fields(&site.selectors.fields)?;
    let detail_link = site.selectors.detail_link.as_deref().map(compile).transpose()?;
    let base = Url::parse(base_url).ok();

    let document = Html::parse_document(body);
    let listings = document
        .select(&item)
        .map(|node| {
            let mut listing = RawListing::new();
            for (name, selector, attr) in &fields {
                if let Some(value) = extract(node, selector, attr.as_deref()) {
                    listing.fields.insert(name.clone(), value);
                }
            }
            if let Some((selector, attr)) = &detail_link {
                let href = extract(node, selector, Some(attr.as_deref().unwrap_or("href")));
                listing.detail_url = href.map(|h| resolve(base.as_ref(), &h));
            }
            listing
        })
        .filter(|listing| !listing.fields.is_empty())
        .collect();
    Ok(listings)
}

pub fn parse_detail_document(site: &SiteConfig, body: &str) -> Result<RawListing, AdapterError> {
    let fields = compile_fields(&site.selectors.detail_fields)?;
    let document = Html::parse_document(body);
    let root = document.root_element();
    let mut detail = RawListing::new();
    for (name, selector, attr) in &fields {
        if let Some(value) = extract(root, selector, attr.as_deref()) {
            detail.fields.insert(name.clone(), value);
        }
    }
    Ok(detail)
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ParserType, SelectorSet};

    fn site() -> SiteConfig {
        let mut site = SiteConfig::fixture("nigeria-homes");
        site.parser_type = ParserType::Html;
        site.listing_url = Some("https://homes.example/search?page={page}".into());
        site.selectors = SelectorSet {
            item: Some("div.listing".into()),
            fields: BTreeMap::from([
                ("title".to_string(), "h2.title".to_string()),
                ("price".to_string(), ".price".to_string()),
                ("location".to_string(), ".address".to_string()),
                ("image".to_string(), "img@src".to_string()),
            ]),
            detail_link: Some("a.more@href".into()),
            detail_fields: BTreeMap::from([("bathrooms".to_string(), "li.baths".to_string())]),
        };
        site
    }

    const PAGE: &str = r#"
<html><body>
  <div class="listing">
    <h2 class="title">  4 Bedroom   Detached Duplex </h2>
    <span class="price">₦ 120,000,000</span>
    <p class="address">Chevron, Lekki</p>
    <img src="/img/1.jpg">
    <a class="more" href="/p/4-bed-duplex">View</a>
  </div>
  <div class="listing">
    <h2 class="title">Serviced plot</h2>
  </div>
  <div class="listing"></div>
</body></html>"#;

    #[test]
    fn substitutes_page_numbers() {
        let site = site();
        assert_eq!(
            page_url(&site, 3).unwrap().as_deref(),
            Some("https://homes.example/search?page=3")
        );

        let mut single = site;
        single.listing_url = Some("https://homes.example/all".into());
        assert_eq!(page_url(&single, 1).unwrap().as_deref(), Some("https://homes.example/all"));
        assert_eq!(page_url(&single, 2).unwrap(), None);
    }

    #[test]
    fn extracts_items_with_text_attributes_and_links() {
        let listings =
            parse_listing_document(&site(), PAGE, "https://homes.example/search?page=1").expect("parse");
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.get("title"), Some("4 Bedroom Detached Duplex"));
        assert_eq!(first.get("price"), Some("₦ 120,000,000"));
        assert_eq!(first.get("image"), Some("/img/1.jpg"));
        assert_eq!(
            first.detail_url.as_deref(),
            Some("https://homes.example/p/4-bed-duplex")
        );

        assert_eq!(listings[1].get("title"), Some("Serviced plot"));
        assert_eq!(listings[1].detail_url, None);
    }

    #[test]
    fn detail_fields_come_from_whole_document() {
        let detail = parse_detail_document(
            &site(),
            "<ul><li class='beds'>4</li><li class='baths'>5 baths</li></ul>",
        )
        .expect("parse");
        assert_eq!(detail.get("bathrooms"), Some("5 baths"));
    }
}
