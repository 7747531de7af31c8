use crate::adapters::{self, AdapterKind};
use crate::archive;
use crate::browser::Browser;
use crate::config::RetailerConfig;
use crate::credentials::CredentialStore;
use crate::db::{save_price_rows, save_store_rows, PriceStore};
use crate::download::md5_hex;
use crate::xml;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-source crawl outcome: counters, accumulated errors and free-form
/// reason tags consumed by the run manifest.
#[derive(Debug, Clone)]
pub struct RetailerResult {
    pub retailer_id: String,
    pub source_url: String,
    pub adapter: String,
    pub links_found: usize,
    pub files_downloaded: usize,
    pub skipped_dupes: usize,
    pub xml: usize,
    pub gz: usize,
    pub zips: usize,
    pub subpath: Option<String>,
    pub errors: Vec<String>,
    pub reasons: Vec<String>,
}

impl RetailerResult {
    pub fn new(retailer_id: &str, source_url: &str, adapter: &str) -> Self {
        Self {
            retailer_id: retailer_id.to_string(),
            source_url: source_url.to_string(),
            adapter: adapter.to_string(),
            links_found: 0,
            files_downloaded: 0,
            skipped_dupes: 0,
            xml: 0,
            gz: 0,
            zips: 0,
            subpath: None,
            errors: Vec::new(),
            reasons: Vec::new(),
        }
    }
}

/// The two per-retailer dedup sets. A file is accepted only when both
/// its content hash and its normalized name are unseen.
#[derive(Debug, Default)]
pub struct SeenFiles {
    hashes: HashSet<String>,
    names: HashSet<String>,
}

impl SeenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and records the file when both keys are new.
    pub fn check_and_insert(&mut self, md5: &str, normalized_name: &str) -> bool {
        if self.hashes.contains(md5) || self.names.contains(normalized_name) {
            return false;
        }
        self.hashes.insert(md5.to_string());
        self.names.insert(normalized_name.to_string());
        true
    }
}

/// Everything an adapter needs besides the page and the source.
pub struct CrawlContext<'a> {
    pub store: &'a dyn PriceStore,
    pub retailer_slug: &'a str,
    pub retailer_name: &'a str,
    pub run_id: &'a str,
    pub today: time::Date,
}

/// Push one downloaded blob through hashing, dedup, extraction, parsing
/// and persistence. Returns whether the blob was actually ingested.
pub async fn process_file(
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
    result: &mut RetailerResult,
    data: &[u8],
    filename: &str,
) -> bool {
    let kind = archive::sniff_kind(data);
    let md5 = md5_hex(data);
    log::info!(
        "file.downloaded retailer={} file={} kind={} bytes={}",
        ctx.retailer_slug,
        filename,
        kind.as_str(),
        data.len()
    );

    let normalized_name = format!("{}/{}", ctx.retailer_slug, filename.to_lowercase());
    if !seen.check_and_insert(&md5, &normalized_name) {
        log::debug!(
            "skip_duplicate retailer={} file={} hash={}",
            ctx.retailer_slug,
            filename,
            &md5[..8.min(md5.len())]
        );
        result.skipped_dupes += 1;
        return false;
    }

    match kind {
        archive::Kind::Zip => result.zips += 1,
        archive::Kind::Gzip => result.gz += 1,
        archive::Kind::Raw => {}
    }

    let store_file = xml::is_store_file(filename);
    let store_hint = if store_file {
        None
    } else {
        xml::extract_store_id(filename)
    };

    let mut entries = 0usize;
    for (inner_name, xml_bytes) in archive::iter_xml_entries(data, filename) {
        entries += 1;
        if store_file {
            let rows = xml::parse_stores(&xml_bytes);
            if !rows.is_empty() {
                if let Err(err) =
                    save_store_rows(ctx.store, ctx.retailer_slug, ctx.retailer_name, &rows).await
                {
                    log::warn!(
                        "xml.persist_failed retailer={} file={} inner={} err={err}",
                        ctx.retailer_slug,
                        filename,
                        inner_name
                    );
                }
            }
        } else {
            let (rows, meta) = xml::parse_prices(&xml_bytes, store_hint.as_deref());
            if !rows.is_empty() {
                if let Err(err) = save_price_rows(
                    ctx.store,
                    ctx.retailer_slug,
                    ctx.retailer_name,
                    &rows,
                    &meta,
                )
                .await
                {
                    log::warn!(
                        "xml.persist_failed retailer={} file={} inner={} err={err}",
                        ctx.retailer_slug,
                        filename,
                        inner_name
                    );
                }
            }
        }
    }
    result.xml += entries;
    log::info!(
        "file.processed retailer={} file={} xml_entries={entries}",
        ctx.retailer_slug,
        filename
    );
    result.files_downloaded += 1;
    true
}

/// Crawl one retailer: sources in descending priority order, one browser
/// context for the whole worker, short-circuit after the first source
/// that downloads anything.
pub async fn crawl_retailer(
    browser: &dyn Browser,
    store: &dyn PriceStore,
    creds: &CredentialStore,
    retailer: &RetailerConfig,
    run_id: &str,
    token: &CancellationToken,
) -> Vec<RetailerResult> {
    let slug = retailer.id.as_str();
    let mut sources = retailer.sources.clone();
    if sources.is_empty() {
        log::warn!("no sources for retailer {slug}");
        return Vec::new();
    }
    sources.sort_by_key(|s| std::cmp::Reverse(s.priority));

    let mut seen = SeenFiles::new();
    let mut results = Vec::new();

    let mut page = match browser.new_page().await {
        Ok(page) => page,
        Err(err) => {
            let mut result = RetailerResult::new(slug, "", "unknown");
            result.errors.push(format!("fatal:context:{err}"));
            return vec![result];
        }
    };

    let ctx = CrawlContext {
        store,
        retailer_slug: slug,
        retailer_name: &retailer.name,
        run_id,
        today: crate::dates::today(),
    };

    for source in &sources {
        if token.is_cancelled() {
            log::info!("retailer.cancelled id={slug}");
            break;
        }
        if source.url.is_empty() {
            continue;
        }
        let kind = adapters::resolve(source, retailer);
        let result = match kind {
            AdapterKind::PublishedPrices => {
                let creds_key = source
                    .creds_key
                    .clone()
                    .or_else(|| retailer.tenant_key.clone());
                let resolved = creds_key.as_deref().and_then(|key| creds.lookup(key));
                match resolved {
                    Some((canonical, credentials)) => {
                        if Some(canonical) != creds_key.as_deref() {
                            log::info!(
                                "credentials.case_match retailer={slug} requested={:?} matched={canonical}",
                                creds_key
                            );
                        }
                        adapters::publishedprices::crawl(
                            page.as_mut(),
                            source,
                            retailer,
                            credentials,
                            &ctx,
                            &mut seen,
                        )
                        .await
                    }
                    None => {
                        log::error!(
                            "credentials.missing retailer={slug} creds_key={:?}",
                            creds_key
                        );
                        let mut result =
                            RetailerResult::new(slug, &source.url, kind.as_str());
                        result
                            .errors
                            .push(format!("no_credentials_mapped for key {creds_key:?}"));
                        result.reasons.push("credentials_missing".to_string());
                        result
                    }
                }
            }
            AdapterKind::Bina => {
                adapters::bina::crawl(page.as_mut(), source, &ctx, &mut seen).await
            }
            AdapterKind::DateIndex => {
                adapters::dateindex::crawl(page.as_mut(), source, &ctx, &mut seen).await
            }
            AdapterKind::Generic => {
                adapters::generic::crawl(page.as_mut(), source, &ctx, &mut seen).await
            }
        };

        log::info!(
            "retailer={slug} source={} adapter={} links={} downloaded={} skipped_dupe={}",
            source.url,
            result.adapter,
            result.links_found,
            result.files_downloaded,
            result.skipped_dupes
        );

        let downloaded = result.files_downloaded;
        results.push(result);

        if downloaded > 0 {
            log::info!(
                "source.chosen retailer={slug} url={} downloaded={downloaded}",
                source.url
            );
            break;
        }
        log::info!(
            "source.skipped retailer={slug} url={} reason=no_downloads",
            source.url
        );
    }

    // Context release; the page owns the only handle to it.
    drop(page);
    results
}

/// Aggregate outcome of one run across all retailers.
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub results: Vec<RetailerResult>,
    pub failed_retailers: Vec<String>,
    pub timed_out: bool,
}

fn new_run_id() -> String {
    let format = format_description!("[year][month][day]T[hour][minute][second]Z");
    let stamp = OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "run".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

/// A retailer counts as failed when no source downloaded anything and at
/// least one source ended with errors.
fn retailer_failed(results: &[RetailerResult]) -> bool {
    !results.is_empty()
        && results.iter().all(|r| r.files_downloaded == 0)
        && results.iter().any(|r| !r.errors.is_empty())
}

/// Run every retailer through a bounded worker pool.
///
/// At most `concurrency` workers (and browser contexts) exist at once.
/// The deadline and external cancellation share one token: on either,
/// pending workers stop before starting and the gather loop drains what
/// already finished, so a timed-out run still reports partial results.
pub async fn run_all(
    browser: Arc<dyn Browser>,
    store: Arc<dyn PriceStore>,
    creds: Arc<CredentialStore>,
    retailers: Vec<RetailerConfig>,
    concurrency: usize,
    deadline: Duration,
    token: CancellationToken,
) -> RunOutcome {
    let run_id = new_run_id();
    let started_at = OffsetDateTime::now_utc();
    log::info!(
        "run.start run_id={run_id} retailers={} concurrency_limit={concurrency}",
        retailers.len()
    );

    let timed_out = Arc::new(AtomicBool::new(false));
    {
        let token = token.clone();
        let timed_out = timed_out.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    log::warn!("run.deadline reached after {deadline:?}, finishing with partial results");
                    timed_out.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = FuturesUnordered::new();
    for retailer in retailers {
        let browser = browser.clone();
        let store = store.clone();
        let creds = creds.clone();
        let semaphore = semaphore.clone();
        let token = token.clone();
        let run_id = run_id.clone();
        tasks.push(tokio::spawn(async move {
            let slug = retailer.id.clone();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (slug, Vec::new()),
            };
            if token.is_cancelled() {
                return (slug, Vec::new());
            }
            log::debug!("retailer.start id={slug}");
            let results = crawl_retailer(
                browser.as_ref(),
                store.as_ref(),
                creds.as_ref(),
                &retailer,
                &run_id,
                &token,
            )
            .await;
            log::debug!("retailer.done id={slug}");
            (slug, results)
        }));
    }

    let mut results = Vec::new();
    let mut failed_retailers = Vec::new();
    loop {
        tokio::select! {
            next = tasks.next() => match next {
                Some(Ok((slug, retailer_results))) => {
                    if retailer_failed(&retailer_results) {
                        failed_retailers.push(slug);
                    }
                    results.extend(retailer_results);
                }
                Some(Err(err)) => {
                    log::error!("retailer task panicked: {err}");
                    failed_retailers.push("unknown".to_string());
                }
                None => break,
            },
            _ = token.cancelled() => {
                // Drain whatever still completes quickly, then stop.
                while let Some(finished) = tasks.next().now_or_never().flatten() {
                    if let Ok((slug, retailer_results)) = finished {
                        if retailer_failed(&retailer_results) {
                            failed_retailers.push(slug);
                        }
                        results.extend(retailer_results);
                    }
                }
                break;
            }
        }
    }

    let finished_at = OffsetDateTime::now_utc();
    log::info!(
        "run.done run_id={run_id} results={} failed={} timed_out={}",
        results.len(),
        failed_retailers.len(),
        timed_out.load(Ordering::SeqCst)
    );
    RunOutcome {
        run_id,
        started_at,
        finished_at,
        results,
        failed_retailers,
        timed_out: timed_out.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testing::{gzip_bytes, zip_bytes};
    use crate::browser::testing::{SpyBrowser, SpyResponse};
    use crate::credentials::CredentialStore;
    use crate::db::testing::MemoryStore;
    use std::collections::HashMap;
    use time::macros::format_description;

    fn iso(date: time::Date) -> String {
        date.format(format_description!("[year]-[month]-[day]"))
            .expect("format")
    }

    fn dmy(date: time::Date) -> String {
        date.format(format_description!("[day]/[month]/[year]"))
            .expect("format")
    }

    fn mdy(date: time::Date) -> String {
        date.format(format_description!("[month]/[day]/[year]"))
            .expect("format")
    }

    fn price_xml(barcode: &str, name: &str, price: &str) -> Vec<u8> {
        format!(
            "<Root><Items><Item>\
                <ItemCode>{barcode}</ItemCode>\
                <ItemName>{name}</ItemName>\
                <ItemPrice>{price}</ItemPrice>\
            </Item></Items></Root>"
        )
        .into_bytes()
    }

    fn retailer(value: serde_json::Value) -> crate::config::RetailerConfig {
        serde_json::from_value(value).expect("retailer config")
    }

    async fn crawl(
        browser: &SpyBrowser,
        store: &MemoryStore,
        creds: &CredentialStore,
        cfg: &crate::config::RetailerConfig,
    ) -> Vec<RetailerResult> {
        crawl_retailer(browser, store, creds, cfg, "test-run", &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn flat_link_happy_path() {
        let today = crate::dates::today();
        let yesterday = today.previous_day().expect("yesterday");
        let listing = format!(
            r#"<html><body>
                <a href="prices-{today}.gz">today</a>
                <a href="prices-{yesterday}.gz">yesterday</a>
            </body></html>"#,
            today = iso(today),
            yesterday = iso(yesterday),
        );
        let mut routes = HashMap::new();
        routes.insert(
            "https://shuk.example/prices/".to_string(),
            SpyResponse::Html(listing),
        );
        routes.insert(
            format!("https://shuk.example/prices/prices-{}.gz", iso(today)),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000001", "Milk", "5.90")),
                content_disposition: None,
            },
        );
        routes.insert(
            format!("https://shuk.example/prices/prices-{}.gz", iso(yesterday)),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000009", "Stale", "1.00")),
                content_disposition: None,
            },
        );
        let browser = SpyBrowser::new(routes);
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "shuk",
            "name": "Shuk",
            "sources": [{"url": "https://shuk.example/prices/", "priority": 10}],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(1, results.len());
        assert_eq!(1, results[0].links_found);
        assert_eq!(1, results[0].files_downloaded);
        assert_eq!(1, store.snapshot_count());
        let snapshot = store.snapshots.lock().expect("lock")[0].clone();
        assert_eq!(5.90, snapshot.price);
        assert!(!snapshot.is_on_sale);
        let product = store.product_by_barcode("7290000000001").expect("product");
        assert_eq!(Some("Milk"), product.name.as_deref());
        let yesterday_url = format!("https://shuk.example/prices/prices-{}.gz", iso(yesterday));
        assert!(
            !browser.visited().contains(&yesterday_url),
            "yesterday's file must not be fetched"
        );
    }

    #[tokio::test]
    async fn download_buttons_respect_today_filter() {
        let today = crate::dates::today();
        let yesterday = today.previous_day().expect("yesterday");
        let table = format!(
            r#"<table>
                <tr><td>{t}</td><td><button onclick="Download('PriceFull-001.gz')">dl</button></td></tr>
                <tr><td>{t}</td><td><button onclick="Download('Promo-001.gz')">dl</button></td></tr>
                <tr><td>{y}</td><td><button onclick="Download('PriceFull-old.gz')">dl</button></td></tr>
            </table>"#,
            t = dmy(today),
            y = dmy(yesterday),
        );
        let mut routes = HashMap::new();
        routes.insert(
            "https://kingstore.binaprojects.com/Main.aspx".to_string(),
            SpyResponse::Html(table),
        );
        routes.insert(
            "download_button:PriceFull-001.gz".to_string(),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000011", "Bread", "8.20")),
                content_disposition: None,
            },
        );
        routes.insert(
            "download_button:Promo-001.gz".to_string(),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000012", "Cheese", "21.50")),
                content_disposition: None,
            },
        );
        let browser = SpyBrowser::new(routes);
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "king",
            "name": "King Store",
            "sources": [{"url": "https://kingstore.binaprojects.com/Main.aspx", "adapter": "bina"}],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(2, results[0].files_downloaded);
        assert_eq!(2, store.snapshot_count());
        let clicked = browser.clicked();
        assert_eq!(
            vec!["PriceFull-001.gz".to_string(), "Promo-001.gz".to_string()],
            clicked,
            "yesterday's button is never clicked"
        );
        assert!(results[0]
            .reasons
            .iter()
            .any(|r| r == "found_download_buttons"));
    }

    #[tokio::test]
    async fn authenticated_login_and_folder() {
        let today = crate::dates::today();
        let login_page = r#"<html><body>
            <form action="/login/user" method="post">
                <input type="hidden" name="csrftoken" value="t0k3n">
                <input name="username" type="text">
                <input name="password" type="password">
                <button type="submit">Login</button>
            </form>
        </body></html>"#;
        let folder_listing = format!(
            r#"<table>
                <tr><td><a href="PriceFull7290-001-202501.gz">PriceFull7290-001-202501.gz</a></td>
                    <td>{}</td></tr>
            </table>"#,
            mdy(today),
        );
        let mut routes = HashMap::new();
        routes.insert(
            "https://url.publishedprices.co.il/login".to_string(),
            SpyResponse::Html(login_page.to_string()),
        );
        routes.insert(
            "POST https://url.publishedprices.co.il/login/user".to_string(),
            SpyResponse::Html("<div id=\"filemanager\"><table></table></div>".to_string()),
        );
        routes.insert(
            "REDIRECT https://url.publishedprices.co.il/login/user".to_string(),
            SpyResponse::Html("https://url.publishedprices.co.il/file".to_string()),
        );
        routes.insert(
            "https://url.publishedprices.co.il/file/cdup/Yuda/".to_string(),
            SpyResponse::Html(folder_listing),
        );
        routes.insert(
            "https://url.publishedprices.co.il/file/cdup/Yuda/PriceFull7290-001-202501.gz"
                .to_string(),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000021", "Hummus", "12.90")),
                content_disposition: None,
            },
        );
        let browser = SpyBrowser::new(routes);
        let store = MemoryStore::new();
        let mut tenants = HashMap::new();
        tenants.insert(
            "yuda_ho".to_string(),
            crate::credentials::Credentials {
                username: "yuda_ho".to_string(),
                password: Some("Yud@147".to_string()),
            },
        );
        let creds = CredentialStore::from_map(tenants);
        let cfg = retailer(serde_json::json!({
            "id": "super-yuda",
            "name": "Super Yuda",
            "tenantKey": "yuda_ho",
            "folder": "Yuda",
            "sources": [{
                "url": "https://url.publishedprices.co.il/login",
                "adapter": "publishedprices",
                "priority": 10,
            }],
        }));

        let results = crawl(&browser, &store, &creds, &cfg).await;

        assert_eq!(1, results.len());
        assert!(results[0].errors.is_empty(), "errors: {:?}", results[0].errors);
        assert_eq!(Some("Yuda"), results[0].subpath.as_deref());
        assert_eq!(1, results[0].files_downloaded);
        assert_eq!(1, store.snapshot_count());
        let posts = browser
            .visited()
            .iter()
            .filter(|v| v.starts_with("POST "))
            .count();
        assert_eq!(1, posts, "login succeeds on the first attempt");
        assert!(browser
            .visited()
            .contains(&"https://url.publishedprices.co.il/file/cdup/Yuda/".to_string()));
    }

    #[tokio::test]
    async fn credentials_missing_skips_source() {
        let browser = SpyBrowser::new(HashMap::new());
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "locked",
            "name": "Locked Chain",
            "tenantKey": "nosuch",
            "sources": [{
                "url": "https://url.publishedprices.co.il/login",
                "adapter": "publishedprices",
            }],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(1, results.len());
        assert!(results[0].reasons.contains(&"credentials_missing".to_string()));
        assert_eq!(0, results[0].files_downloaded);
        assert!(browser.visited().is_empty(), "portal is never touched");
    }

    #[tokio::test]
    async fn mislabeled_zip_parses_promotion() {
        let xml = b"<Root><Promotions><Promotion>\
            <DiscountedPrice>3.50</DiscountedPrice>\
            <PromotionUpdateDate>2025-01-01 00:00:00</PromotionUpdateDate>\
            <Items><Item><ItemCode>7290000000002</ItemCode></Item></Items>\
        </Promotion></Promotions></Root>";
        let blob = zip_bytes(&[("prices.xml", xml.as_slice())]);
        let store = MemoryStore::new();
        let ctx = CrawlContext {
            store: &store,
            retailer_slug: "shuk",
            retailer_name: "Shuk",
            run_id: "test-run",
            today: crate::dates::today(),
        };
        let mut seen = SeenFiles::new();
        let mut result = RetailerResult::new("shuk", "https://shuk.example/", "generic");

        // Advertised as .gz, actually zip magic.
        let ingested = process_file(&ctx, &mut seen, &mut result, &blob, "prices.gz").await;

        assert!(ingested);
        assert_eq!(1, result.zips, "counted by sniffed kind, not extension");
        assert_eq!(0, result.gz);
        assert_eq!(1, result.xml);
        assert_eq!(1, store.snapshot_count());
        let snapshot = store.snapshots.lock().expect("lock")[0].clone();
        assert_eq!(3.50, snapshot.price);
        assert!(snapshot.is_on_sale);
        assert_eq!(2025, snapshot.timestamp.year());
    }

    #[tokio::test]
    async fn duplicate_blob_is_skipped_once_ingested() {
        let blob = gzip_bytes(&price_xml("7290000000031", "Yogurt", "4.10"));
        let store = MemoryStore::new();
        let ctx = CrawlContext {
            store: &store,
            retailer_slug: "shuk",
            retailer_name: "Shuk",
            run_id: "test-run",
            today: crate::dates::today(),
        };
        let mut seen = SeenFiles::new();
        let mut result = RetailerResult::new("shuk", "https://shuk.example/", "generic");

        assert!(process_file(&ctx, &mut seen, &mut result, &blob, "a.gz").await);
        assert!(!process_file(&ctx, &mut seen, &mut result, &blob, "b.gz").await);
        // Same name, different content: the name key alone rejects it.
        let other = gzip_bytes(&price_xml("7290000000032", "Other", "9.99"));
        assert!(!process_file(&ctx, &mut seen, &mut result, &other, "A.GZ").await);

        assert_eq!(1, result.files_downloaded);
        assert_eq!(2, result.skipped_dupes);
        assert_eq!(1, store.snapshot_count());
    }

    #[tokio::test]
    async fn short_circuit_skips_lower_priority_sources() {
        let today = crate::dates::today();
        let listing_a = format!(
            r#"<a href="F-{}.gz">today</a>"#,
            iso(today)
        );
        let mut routes = HashMap::new();
        routes.insert(
            "https://primary.example/".to_string(),
            SpyResponse::Html(listing_a),
        );
        routes.insert(
            format!("https://primary.example/F-{}.gz", iso(today)),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000041", "Eggs", "13.90")),
                content_disposition: None,
            },
        );
        routes.insert(
            "https://mirror.example/".to_string(),
            SpyResponse::Html("<p>mirror</p>".to_string()),
        );
        let browser = SpyBrowser::new(routes);
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "shuk",
            "name": "Shuk",
            "sources": [
                {"url": "https://primary.example/", "priority": 10},
                {"url": "https://mirror.example/", "priority": 5},
            ],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(1, results.len(), "second source never runs");
        assert_eq!(1, store.snapshot_count());
        assert!(
            !browser.visited().contains(&"https://mirror.example/".to_string()),
            "mirror must not be visited after short-circuit"
        );
    }

    #[tokio::test]
    async fn sources_without_downloads_keep_iterating() {
        let today = crate::dates::today();
        let mut routes = HashMap::new();
        routes.insert(
            "https://empty.example/".to_string(),
            SpyResponse::Html("<p>nothing here</p>".to_string()),
        );
        routes.insert(
            "https://backup.example/".to_string(),
            SpyResponse::Html(format!(r#"<a href="F-{}.gz">f</a>"#, iso(today))),
        );
        routes.insert(
            format!("https://backup.example/F-{}.gz", iso(today)),
            SpyResponse::File {
                bytes: gzip_bytes(&price_xml("7290000000051", "Salt", "2.30")),
                content_disposition: None,
            },
        );
        let browser = SpyBrowser::new(routes);
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "shuk",
            "name": "Shuk",
            "sources": [
                {"url": "https://empty.example/", "priority": 10},
                {"url": "https://backup.example/", "priority": 5},
            ],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(2, results.len());
        assert!(results[0].reasons.contains(&"no_dom_links".to_string()));
        assert_eq!(1, results[1].files_downloaded);
        assert_eq!(1, store.snapshot_count());
    }

    #[tokio::test]
    async fn concurrency_bound_holds_across_retailers() {
        let mut routes = HashMap::new();
        for i in 0..7 {
            // One dead link per listing keeps each worker busy without
            // triggering the empty-listing rescan wait.
            routes.insert(
                format!("https://retailer-{i}.example/"),
                SpyResponse::Html(r#"<a href="files/prices.gz">prices</a>"#.to_string()),
            );
        }
        let browser = Arc::new(
            SpyBrowser::new(routes).with_page_delay(Duration::from_millis(30)),
        );
        let store = Arc::new(MemoryStore::new());
        let retailers: Vec<_> = (0..7)
            .map(|i| {
                retailer(serde_json::json!({
                    "id": format!("retailer-{i}"),
                    "name": format!("Retailer {i}"),
                    "sources": [{
                        "url": format!("https://retailer-{i}.example/"),
                        "filter_today": false,
                    }],
                }))
            })
            .collect();
        let max_open = browser.max_open_contexts.clone();
        let open = browser.open_contexts.clone();
        let browser_dyn: Arc<dyn Browser> = browser.clone();
        let store_dyn: Arc<dyn PriceStore> = store.clone();

        let outcome = run_all(
            browser_dyn,
            store_dyn,
            Arc::new(CredentialStore::default()),
            retailers,
            3,
            Duration::from_secs(300),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(7, outcome.results.len(), "all retailers complete");
        assert!(outcome.failed_retailers.is_empty());
        assert!(
            max_open.load(Ordering::SeqCst) <= 3,
            "never more than 3 contexts open, saw {}",
            max_open.load(Ordering::SeqCst)
        );
        assert_eq!(0, open.load(Ordering::SeqCst), "every context released");
    }

    #[tokio::test]
    async fn context_released_even_when_source_fails() {
        let browser = SpyBrowser::new(HashMap::new());
        let store = MemoryStore::new();
        let cfg = retailer(serde_json::json!({
            "id": "shuk",
            "name": "Shuk",
            "sources": [{"url": "https://unrouted.example/"}],
        }));

        let results = crawl(&browser, &store, &CredentialStore::default(), &cfg).await;

        assert_eq!(1, results.len());
        assert!(!results[0].errors.is_empty());
        assert_eq!(
            0,
            browser.open_contexts.load(std::sync::atomic::Ordering::SeqCst)
        );
    }
}
