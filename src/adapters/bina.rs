use crate::adapters::DOWNLOAD_BUTTON_PREFIX;
use crate::browser::{resolve_url, FrameDoc, Page};
use crate::config::SourceConfig;
use crate::core::{process_file, CrawlContext, RetailerResult, SeenFiles};
use crate::dates::{extract_date, is_today, DateOrder};
use crate::download::{fetch_url, pick_filename};
use lazy_regex::regex;
use scraper::Html;
use std::collections::BTreeSet;
use std::time::Duration;

const CLICK_THROTTLE: Duration = Duration::from_millis(200);

/// Tab labels that reveal the price tables on portals which hide the
/// download buttons behind a filter.
const TAB_CANDIDATES: &[&str] = &["PriceFull", "מחיר מלא", "Price Full", "Promo", "Stores", "חנויות"];

mod selectors {
    #![allow(clippy::unwrap_used)]
    use once_cell::sync::Lazy;
    use scraper::Selector;

    pub static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("table tr, tbody tr").unwrap());
    pub static DOWNLOAD_BUTTON: Lazy<Selector> = Lazy::new(|| {
        Selector::parse("button[onclick*='Download'], button[onclick*='download']").unwrap()
    });
    pub static ARCHIVE_ANCHOR: Lazy<Selector> =
        Lazy::new(|| Selector::parse("a[href*='.gz'], a[href*='.zip']").unwrap());
    pub static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
}

/// One `onclick="Download('file.gz')"` table row.
#[derive(Debug, Clone, PartialEq)]
pub struct ButtonRow {
    pub filename: String,
    pub onclick: String,
    pub date: Option<String>,
}

/// Scan every frame's tables for Download() buttons, keeping the row
/// date (DD/MM/YYYY on these portals). With `filter_today` only rows
/// dated today survive; rows with no date are dropped outright.
fn collect_download_buttons(
    frames: &[FrameDoc],
    today: time::Date,
    filter_today: bool,
) -> Vec<ButtonRow> {
    let mut buttons = Vec::new();
    for frame in frames {
        let document = Html::parse_document(&frame.body);
        for row in document.select(&selectors::ROW) {
            let button = match row.select(&selectors::DOWNLOAD_BUTTON).next() {
                Some(button) => button,
                None => continue,
            };
            let onclick = button.value().attr("onclick").unwrap_or("");
            let filename = match regex!(r#"Download\(['"]([^'"]+)['"]"#i)
                .captures(onclick)
                .and_then(|caps| caps.get(1))
            {
                Some(m) => m.as_str().to_string(),
                None => continue,
            };
            let lower = filename.to_lowercase();
            if !lower.ends_with(".gz") && !lower.ends_with(".zip") {
                continue;
            }
            let row_text = row.text().collect::<Vec<_>>().join(" ");
            let date = regex!(r"(\d{1,2}/\d{1,2}/\d{4})")
                .captures(&row_text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            if filter_today {
                match &date {
                    None => {
                        log::debug!("bina.skip_no_date filename={filename}");
                        continue;
                    }
                    Some(date_str) => {
                        if !is_today(extract_date(date_str, DateOrder::DayFirst), today) {
                            log::debug!("bina.skip_not_today filename={filename} date={date_str}");
                            continue;
                        }
                    }
                }
            }
            buttons.push(ButtonRow {
                filename,
                onclick: onclick.to_string(),
                date,
            });
        }
    }
    buttons
}

/// Direct `.gz`/`.zip` anchors across all frames, as absolute URLs.
fn collect_archive_anchors(frames: &[FrameDoc]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for frame in frames {
        let document = Html::parse_document(&frame.body);
        for anchor in document.select(&selectors::ARCHIVE_ANCHOR) {
            let href = match anchor.value().attr("href") {
                Some(href) => href,
                None => continue,
            };
            if let Ok(absolute) = resolve_url(&frame.url, href) {
                if seen.insert(absolute.clone()) {
                    out.push(absolute);
                }
            }
        }
    }
    out
}

/// Last resort: harvest archive-looking absolute URLs out of the raw
/// page source (scripts included), standing in for a browser's network
/// capture.
fn harvest_archive_urls(frames: &[FrameDoc]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for frame in frames {
        for m in regex!(r#"https?://[^\s"'<>\\]+"#).find_iter(&frame.body) {
            let url = m.as_str();
            let lower = url.to_lowercase();
            if [".zip", ".gz", "pricefull", "promo", "stores", "download"]
                .iter()
                .any(|p| lower.contains(p))
            {
                seen.insert(url.to_string());
            }
        }
    }
    seen.into_iter().collect()
}

/// Anchor href for a tab label, searched across frames.
fn find_tab_href(frames: &[FrameDoc], label: &str) -> Option<String> {
    for frame in frames {
        let document = Html::parse_document(&frame.body);
        for anchor in document.select(&selectors::ANCHOR) {
            if anchor.text().any(|t| t.contains(label)) {
                if let Some(href) = anchor.value().attr("href") {
                    if !href.starts_with('#') {
                        return resolve_url(&frame.url, href).ok();
                    }
                }
            }
        }
    }
    None
}

/// Pseudo-links for the orchestration seam: the sentinel prefix tells
/// the download path these are click targets, not fetchable URLs.
fn pseudo_links(buttons: &[ButtonRow]) -> Vec<String> {
    buttons
        .iter()
        .map(|b| format!("{DOWNLOAD_BUTTON_PREFIX}{}", b.filename))
        .collect()
}

/// Click-download each selected pseudo-link, throttled between clicks.
/// Returns how many blobs were ingested after dedup.
async fn click_downloads(
    page: &mut dyn Page,
    links: &[String],
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
    result: &mut RetailerResult,
) -> usize {
    let mut got = 0usize;
    for (i, link) in links.iter().enumerate() {
        let filename = link.strip_prefix(DOWNLOAD_BUTTON_PREFIX).unwrap_or(link);
        match page.click_download(filename).await {
            Ok(file) => {
                let name = pick_filename(file.content_disposition.as_deref(), filename);
                if process_file(ctx, seen, result, &file.bytes, &name).await {
                    got += 1;
                }
            }
            Err(err) => {
                log::warn!(
                    "click_download.failed retailer={} filename={filename} err={err}",
                    ctx.retailer_slug
                );
                result
                    .errors
                    .push(format!("click_download_error:{filename}:{err}"));
            }
        }
        if i + 1 < links.len() {
            tokio::time::sleep(CLICK_THROTTLE).await;
        }
    }
    log::info!(
        "discovery retailer={} adapter=bina path=click downloads={got}",
        ctx.retailer_slug
    );
    got
}

async fn fetch_links(
    page: &mut dyn Page,
    links: &[String],
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
    result: &mut RetailerResult,
) {
    for link in links {
        match fetch_url(page, link).await {
            Ok(Some((data, filename))) => {
                process_file(ctx, seen, result, &data, &filename).await;
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
}

/// Download()-button adapter. Primary path scans table rows for buttons
/// and click-downloads today's files; fallbacks walk tabs, direct
/// archive anchors and URLs harvested from the raw source.
pub async fn crawl(
    page: &mut dyn Page,
    source: &SourceConfig,
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
) -> RetailerResult {
    let mut result = RetailerResult::new(ctx.retailer_slug, &source.url, "bina");

    if let Err(err) = page.goto(&source.url).await {
        result.errors.push(format!("fatal:{err}"));
        return result;
    }
    let frames = match page.frames().await {
        Ok(frames) => frames,
        Err(err) => {
            result.errors.push(format!("fatal:{err}"));
            return result;
        }
    };
    log::info!(
        "bina.page_loaded retailer={} url={} frames={}",
        ctx.retailer_slug,
        page.url(),
        frames.len()
    );

    let links = pseudo_links(&collect_download_buttons(&frames, ctx.today, source.filter_today));
    if !links.is_empty() {
        result.links_found = links.len();
        result.reasons.push("found_download_buttons".to_string());
        log::info!(
            "links.discovered slug={} adapter=bina count={} (today only)",
            ctx.retailer_slug,
            links.len()
        );
        let got = click_downloads(page, &links, ctx, seen, &mut result).await;
        if got > 0 {
            result.reasons.push("used_click_fallback".to_string());
        }
        return result;
    }

    // No buttons dated today: one unfiltered pass catches portals whose
    // table shows stale dates for fresh files.
    if source.filter_today {
        let unfiltered = pseudo_links(&collect_download_buttons(&frames, ctx.today, false));
        if !unfiltered.is_empty() {
            result.links_found = unfiltered.len();
            result.reasons.push("found_download_buttons".to_string());
            log::info!(
                "links.discovered slug={} adapter=bina count={} (no_date_filter)",
                ctx.retailer_slug,
                unfiltered.len()
            );
            let got = click_downloads(page, &unfiltered, ctx, seen, &mut result).await;
            if got > 0 {
                result.reasons.push("used_click_fallback".to_string());
            }
            return result;
        }
    }

    // Tab walk: reveal the table behind a PriceFull-style filter.
    for label in TAB_CANDIDATES {
        let href = match find_tab_href(&frames, label) {
            Some(href) => href,
            None => continue,
        };
        if page.goto(&href).await.is_err() {
            continue;
        }
        let tab_frames = match page.frames().await {
            Ok(frames) => frames,
            Err(_) => continue,
        };
        let tab_links =
            pseudo_links(&collect_download_buttons(&tab_frames, ctx.today, source.filter_today));
        if tab_links.is_empty() {
            continue;
        }
        log::info!(
            "bina.download_buttons_after_tab retailer={} tab={label} count={}",
            ctx.retailer_slug,
            tab_links.len()
        );
        result.links_found = tab_links.len();
        result.reasons.push("found_download_buttons".to_string());
        let got = click_downloads(page, &tab_links, ctx, seen, &mut result).await;
        if got > 0 {
            result.reasons.push("used_click_fallback".to_string());
            return result;
        }
    }

    // Direct archive anchors across frames.
    let anchors = collect_archive_anchors(&frames);
    if !anchors.is_empty() {
        result.links_found = anchors.len();
        log::info!(
            "links.discovered slug={} adapter=bina count={} (dom_links)",
            ctx.retailer_slug,
            anchors.len()
        );
        fetch_links(page, &anchors, ctx, seen, &mut result).await;
        return result;
    }

    // Network-capture equivalent: anything archive-shaped in the source.
    let harvested = harvest_archive_urls(&frames);
    if !harvested.is_empty() {
        result.links_found = harvested.len();
        log::info!(
            "links.discovered slug={} adapter=bina count={} (harvested)",
            ctx.retailer_slug,
            harvested.len()
        );
        fetch_links(page, &harvested, ctx, seen, &mut result).await;
        return result;
    }

    result.reasons.push("no_dom_links".to_string());
    log::warn!(
        "bina.no_links retailer={} url={} frames={}",
        ctx.retailer_slug,
        page.url(),
        frames.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn frame(body: &str) -> Vec<FrameDoc> {
        vec![FrameDoc {
            url: "https://kingstore.binaprojects.com/Main.aspx".to_string(),
            body: body.to_string(),
        }]
    }

    #[test]
    fn extracts_buttons_with_row_dates() {
        let body = r#"<table>
            <tr><td>PriceFull1.gz</td><td>14/01/2025 01:24</td>
                <td><button onclick="Download('PriceFull1.gz')">הורדה</button></td></tr>
            <tr><td>Promo2.gz</td><td>13/01/2025 22:00</td>
                <td><button onclick="Download('Promo2.gz')">הורדה</button></td></tr>
        </table>"#;
        let buttons = collect_download_buttons(&frame(body), date!(2025 - 01 - 14), true);
        assert_eq!(1, buttons.len());
        assert_eq!("PriceFull1.gz", buttons[0].filename);
        assert_eq!(Some("14/01/2025"), buttons[0].date.as_deref());
    }

    #[test]
    fn row_dates_are_day_first() {
        // 03/04/2025 on a bina table is April 3rd.
        let body = r#"<table><tr><td>03/04/2025</td>
            <td><button onclick="Download('x.gz')">dl</button></td></tr></table>"#;
        assert_eq!(
            1,
            collect_download_buttons(&frame(body), date!(2025 - 04 - 03), true).len()
        );
        assert!(collect_download_buttons(&frame(body), date!(2025 - 03 - 04), true).is_empty());
    }

    #[test]
    fn undated_rows_are_dropped_only_under_filter() {
        let body = r#"<table><tr>
            <td><button onclick="Download('x.gz')">dl</button></td></tr></table>"#;
        assert!(collect_download_buttons(&frame(body), date!(2025 - 01 - 14), true).is_empty());
        assert_eq!(
            1,
            collect_download_buttons(&frame(body), date!(2025 - 01 - 14), false).len()
        );
    }

    #[test]
    fn non_archive_filenames_are_ignored() {
        let body = r#"<table><tr><td>14/01/2025</td>
            <td><button onclick="Download('report.pdf')">dl</button></td></tr></table>"#;
        assert!(collect_download_buttons(&frame(body), date!(2025 - 01 - 14), true).is_empty());
    }

    #[test]
    fn pseudo_links_carry_the_sentinel() {
        let buttons = vec![ButtonRow {
            filename: "PriceFull1.gz".to_string(),
            onclick: "Download('PriceFull1.gz')".to_string(),
            date: None,
        }];
        assert_eq!(
            vec!["download_button:PriceFull1.gz".to_string()],
            pseudo_links(&buttons)
        );
    }

    #[test]
    fn collects_archive_anchors_across_frames() {
        let frames = vec![
            FrameDoc {
                url: "https://host.example/main".to_string(),
                body: r#"<a href="files/a.gz">a</a><a href="page.html">x</a>"#.to_string(),
            },
            FrameDoc {
                url: "https://host.example/frame/".to_string(),
                body: r#"<a href="b.zip">b</a><a href="files/a.gz">dupe</a>"#.to_string(),
            },
        ];
        let links = collect_archive_anchors(&frames);
        assert_eq!(
            vec![
                "https://host.example/files/a.gz".to_string(),
                "https://host.example/frame/b.zip".to_string(),
            ],
            links
        );
    }

    #[test]
    fn harvests_urls_from_scripts() {
        let frames = frame(
            r#"<script>var files = ["https://cdn.example/PriceFull7290-001.gz"];
               var other = "https://cdn.example/logo.png";</script>"#,
        );
        let urls = harvest_archive_urls(&frames);
        assert_eq!(vec!["https://cdn.example/PriceFull7290-001.gz".to_string()], urls);
    }

    #[test]
    fn finds_tab_anchors_by_label() {
        let frames = frame(r#"<ul><li><a href="Main.aspx?cat=1">מחיר מלא</a></li></ul>"#);
        assert_eq!(
            Some("https://kingstore.binaprojects.com/Main.aspx?cat=1".to_string()),
            find_tab_href(&frames, "מחיר מלא")
        );
        assert_eq!(None, find_tab_href(&frames, "Promo"));
    }
}
