use crate::adapters::{looks_like_price_file, DEFAULT_DOWNLOAD_SUFFIXES};
use crate::browser::{FrameDoc, Page};
use crate::config::SourceConfig;
use crate::core::{process_file, CrawlContext, RetailerResult, SeenFiles};
use crate::dates::{extract_date_from_link, is_today, DateOrder};
use crate::download::fetch_url;
use scraper::Html;
use std::collections::BTreeSet;
use std::time::Duration;

const RETRY_WAIT: Duration = Duration::from_millis(800);

mod selectors {
    #![allow(clippy::unwrap_used)]
    use once_cell::sync::Lazy;
    use scraper::Selector;

    pub static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
}

/// Collect download links from the main document and every child frame.
///
/// Matching is done in code rather than per-suffix selectors so that the
/// retailer-supplied patterns and the hardened keyword match share one
/// path. Dates normalize to ISO before the today comparison; undateable
/// links are skipped while the filter is on.
pub fn collect_links(
    frames: &[FrameDoc],
    patterns: &[String],
    filter_today: bool,
    today: time::Date,
) -> Vec<String> {
    let suffixes: Vec<String> = if patterns.is_empty() {
        DEFAULT_DOWNLOAD_SUFFIXES.iter().map(|s| s.to_string()).collect()
    } else {
        patterns.iter().map(|p| p.to_lowercase()).collect()
    };

    let mut links = BTreeSet::new();
    for frame in frames {
        let document = Html::parse_document(&frame.body);
        for anchor in document.select(&selectors::ANCHOR) {
            let href = match anchor.value().attr("href") {
                Some(href) => href,
                None => continue,
            };
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let absolute = match crate::browser::resolve_url(&frame.url, href) {
                Ok(absolute) => absolute,
                Err(_) => continue,
            };
            let lower = absolute.to_lowercase();
            if !(looks_like_price_file(&lower)
                || suffixes.iter().any(|s| lower.ends_with(s.as_str())))
            {
                continue;
            }
            if filter_today {
                let text = anchor.text().collect::<Vec<_>>().join(" ");
                let date = extract_date_from_link(&absolute, &text, DateOrder::DayFirst);
                if !is_today(date, today) {
                    log::debug!("generic.skip url={absolute} date={date:?}");
                    continue;
                }
            }
            links.insert(absolute);
        }
    }
    links.into_iter().collect()
}

/// Flat-link adapter for public directory-style listings.
pub async fn crawl(
    page: &mut dyn Page,
    source: &SourceConfig,
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
) -> RetailerResult {
    let mut result = RetailerResult::new(ctx.retailer_slug, &source.url, "generic");

    if let Err(err) = page.goto(&source.url).await {
        result.errors.push(format!("fatal:{err}"));
        return result;
    }

    let mut links = match page.frames().await {
        Ok(frames) => collect_links(&frames, &source.download_patterns, source.filter_today, ctx.today),
        Err(err) => {
            result.errors.push(format!("fatal:{err}"));
            return result;
        }
    };

    // Slow listings render late; wait out the network lull and rescan
    // once before giving up.
    if links.is_empty() {
        tokio::time::sleep(RETRY_WAIT).await;
        if page.goto(&source.url).await.is_ok() {
            if let Ok(frames) = page.frames().await {
                links = collect_links(
                    &frames,
                    &source.download_patterns,
                    source.filter_today,
                    ctx.today,
                );
            }
        }
    }

    result.links_found = links.len();
    if links.is_empty() {
        result.reasons.push("no_dom_links".to_string());
        log::warn!(
            "generic.no_links retailer={} url={}",
            ctx.retailer_slug,
            page.url()
        );
    }
    log::info!(
        "links.discovered slug={} adapter=generic count={} filter_today={}",
        ctx.retailer_slug,
        links.len(),
        source.filter_today
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

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn frames(body: &str) -> Vec<FrameDoc> {
        vec![FrameDoc {
            url: "https://prices.example/list/".to_string(),
            body: body.to_string(),
        }]
    }

    #[test]
    fn filters_to_todays_links() {
        let today = date!(2025 - 01 - 14);
        let body = r#"
            <a href="prices-2025-01-14.gz">today</a>
            <a href="prices-2025-01-13.gz">yesterday</a>
            <a href="prices-undated.gz">undated</a>
            <a href="about.html">about</a>
        "#;
        let links = collect_links(&frames(body), &[], true, today);
        assert_eq!(
            vec!["https://prices.example/list/prices-2025-01-14.gz".to_string()],
            links
        );
    }

    #[test]
    fn unfiltered_sources_keep_undated_links() {
        let links = collect_links(
            &frames(r#"<a href="archive.zip">all</a>"#),
            &[],
            false,
            date!(2025 - 01 - 14),
        );
        assert_eq!(1, links.len());
    }

    #[test]
    fn date_in_link_text_counts() {
        let today = date!(2025 - 01 - 14);
        let body = r#"<a href="files/88.gz">מחירון 14/01/2025</a>"#;
        let links = collect_links(&frames(body), &[], true, today);
        assert_eq!(1, links.len());
    }

    #[test]
    fn retailer_patterns_extend_the_selector_set() {
        let body = r#"<a href="export-2025-01-14.dat">data</a>"#;
        let today = date!(2025 - 01 - 14);
        assert!(collect_links(&frames(body), &[], true, today).is_empty());
        let links = collect_links(&frames(body), &[".dat".to_string()], true, today);
        assert_eq!(1, links.len());
    }

    #[test]
    fn scans_child_frames_too() {
        let today = date!(2025 - 01 - 14);
        let frames = vec![
            FrameDoc {
                url: "https://prices.example/".to_string(),
                body: "<p>shell page</p>".to_string(),
            },
            FrameDoc {
                url: "https://prices.example/inner/".to_string(),
                body: r#"<a href="p-2025-01-14.gz">inner</a>"#.to_string(),
            },
        ];
        let links = collect_links(&frames, &[], true, today);
        assert_eq!(vec!["https://prices.example/inner/p-2025-01-14.gz".to_string()], links);
    }

    #[test]
    fn fragment_links_are_dropped() {
        let links = collect_links(
            &frames(r##"<a href="#sort">sort</a>"##),
            &[],
            false,
            date!(2025 - 01 - 14),
        );
        assert!(links.is_empty());
    }
}
