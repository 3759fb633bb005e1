use estate_adapters::{AdapterError, FixtureFetcher, PageFetcher, RegistryFetcher, SiteRegistry};
use tempfile::tempdir;

#[tokio::test]
async fn registry_file_drives_fetcher_dispatch() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(
        root.join("sites.yaml"),
        r#"
sites:
  - site_key: propertyhub
    parser_type: fixture
  - site_key: nigeria-homes
    parser_type: html
    listing_url: "https://homes.example/search?page={page}"
    selectors:
      item: "div.listing"
      fields: {title: "h2"}
"#,
    )
    .unwrap();
    std::fs::create_dir_all(root.join("fixtures/propertyhub")).unwrap();
    std::fs::write(
        root.join("fixtures/propertyhub/page_1.json"),
        r#"[{"title": "Mini flat", "price": "₦ 900k", "location": "Yaba"}]"#,
    )
    .unwrap();

    let registry = SiteRegistry::load(root.join("sites.yaml")).expect("registry");
    let fetcher = RegistryFetcher::new(FixtureFetcher::new(root.join("fixtures")), None);

    let fixture_site = registry.get("propertyhub").unwrap();
    let page = fetcher.fetch_page(fixture_site, 1).await.expect("fixture page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].get("location"), Some("Yaba"));

    let html_site = registry.get("nigeria-homes").unwrap();
    let err = fetcher.fetch_page(html_site, 1).await.unwrap_err();
    assert!(matches!(err, AdapterError::NotConfigured { what: "http client", .. }));
}

#[test]
fn missing_registry_file_reports_path() {
    let err = SiteRegistry::load("/definitely/not/here/sites.yaml").unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here/sites.yaml"));
}
