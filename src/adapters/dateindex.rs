use crate::browser::{resolve_url, Page};
use crate::config::SourceConfig;
use crate::core::{process_file, CrawlContext, RetailerResult, SeenFiles};
use crate::download::fetch_url;
use lazy_regex::regex;
use std::collections::BTreeSet;

/// Default cap on files pulled from one day's listing.
const DEFAULT_MAX_FILES: usize = 80;

/// How many of the newest dates to probe before giving up. The newest
/// directory is sometimes still empty while the publisher uploads.
const DATES_TO_TRY: usize = 3;

/// ISO dates advertised on the index page, newest first.
fn discover_dates(body: &str) -> Vec<String> {
    let dates: BTreeSet<String> = regex!(r"\d{4}-\d{2}-\d{2}")
        .find_iter(body)
        .map(|m| m.as_str().to_string())
        .collect();
    dates.into_iter().rev().collect()
}

/// `.gz` hrefs in one day's listing, absolutized and capped.
fn collect_gz_links(body: &str, base_url: &str, max_files: usize) -> Vec<String> {
    let mut links = Vec::new();
    for caps in regex!(r#"href="([^"]*\.gz)""#i).captures_iter(body) {
        if links.len() >= max_files {
            break;
        }
        if let Some(href) = caps.get(1) {
            if let Ok(absolute) = resolve_url(base_url, href.as_str()) {
                if !links.contains(&absolute) {
                    links.push(absolute);
                }
            }
        }
    }
    links
}

/// Date-index variant: the portal lists one sub-page per ISO date. Pick
/// the newest date that actually contains `.gz` files (probing up to
/// three in case the newest is still empty) and download its listing.
pub async fn crawl(
    page: &mut dyn Page,
    source: &SourceConfig,
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
) -> RetailerResult {
    let mut result = RetailerResult::new(ctx.retailer_slug, &source.url, "dateindex");
    let max_files = source.max_files.unwrap_or(DEFAULT_MAX_FILES);

    if let Err(err) = page.goto(&source.url).await {
        result.errors.push(format!("fatal:{err}"));
        return result;
    }
    let dates = discover_dates(page.body());
    if dates.is_empty() {
        log::info!("dateindex.no_dates slug={} url={}", ctx.retailer_slug, source.url);
        result.reasons.push("no_dates".to_string());
        return result;
    }
    log::info!(
        "dateindex.dates_found slug={} count={} newest={}",
        ctx.retailer_slug,
        dates.len(),
        dates[0]
    );

    let mut selected = None;
    let mut links = Vec::new();
    for (i, date) in dates.iter().take(DATES_TO_TRY).enumerate() {
        let listing_url = match resolve_url(&source.url, &format!("{date}/")) {
            Ok(url) => url,
            Err(err) => {
                result.errors.push(format!("bad_date_url:{date}:{err}"));
                continue;
            }
        };
        if let Err(err) = page.goto(&listing_url).await {
            log::warn!(
                "dateindex.date_failed slug={} date={date} err={err}",
                ctx.retailer_slug
            );
            continue;
        }
        links = collect_gz_links(page.body(), page.url(), max_files);
        if !links.is_empty() {
            if i > 0 {
                log::info!("dateindex.fallback slug={} selected={date}", ctx.retailer_slug);
            }
            selected = Some(date.clone());
            break;
        }
    }

    let selected = match selected {
        Some(date) => date,
        None => {
            log::info!(
                "dateindex.no_files slug={} dates_tried={}",
                ctx.retailer_slug,
                dates.len().min(DATES_TO_TRY)
            );
            result.reasons.push("no_files".to_string());
            return result;
        }
    };

    result.links_found = links.len();
    log::info!(
        "links.discovered slug={} adapter=dateindex date={selected} count={}",
        ctx.retailer_slug,
        links.len()
    );

    for link in &links {
        match fetch_url(page, link).await {
            Ok(Some((data, filename))) => {
                process_file(ctx, seen, &mut result, &data, &filename).await;
            }
            Ok(None) => continue,
            Err(err) => {
                result.errors.push(format!("download_error:{link}:{err}"));
                log::error!(
                    "download.failed retailer={} link={link} err={err}",
                    ctx.retailer_slug
                );
            }
        }
    }

    result
}
