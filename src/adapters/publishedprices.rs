use crate::adapters::looks_like_price_file;
use crate::browser::{resolve_url, Page};
use crate::config::{RetailerConfig, SourceConfig};
use crate::core::{process_file, CrawlContext, RetailerResult, SeenFiles};
use crate::credentials::Credentials;
use crate::dates::{extract_date, is_today, DateOrder};
use crate::download::fetch_url;
use scraper::{ElementRef, Html};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::timeout;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(20);
const LOGIN_ATTEMPTS: u32 = 3;

mod selectors {
    #![allow(clippy::unwrap_used)]
    use once_cell::sync::Lazy;
    use scraper::Selector;

    pub static FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());
    pub static HIDDEN: Lazy<Selector> =
        Lazy::new(|| Selector::parse("input[type='hidden'][name]").unwrap());
    pub static FILE_MANAGER: Lazy<Selector> =
        Lazy::new(|| Selector::parse("table, div#filemanager, div.dataTables_wrapper").unwrap());
    pub static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("table tr, tbody tr").unwrap());
    pub static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

    /// Selector families tried in order for the login controls; the
    /// portal has shipped several different login form variants.
    pub static USERNAME: Lazy<Vec<Selector>> = Lazy::new(|| {
        [
            "input[name='username']",
            "#username",
            "input[name='Email']",
            "input[type='email']",
        ]
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
    });
    pub static PASSWORD: Lazy<Vec<Selector>> = Lazy::new(|| {
        ["input[name='password']", "#password", "input[type='password']"]
            .iter()
            .map(|s| Selector::parse(s).unwrap())
            .collect()
    });
}

struct LoginForm {
    action: String,
    username_field: String,
    password_field: Option<String>,
    hidden: Vec<(String, String)>,
}

fn field_name(element: ElementRef<'_>) -> Option<String> {
    element
        .value()
        .attr("name")
        .or_else(|| element.value().attr("id"))
        .map(ToString::to_string)
}

fn find_login_form(body: &str) -> Option<LoginForm> {
    let document = Html::parse_document(body);
    for form in document.select(&selectors::FORM) {
        let username_field = selectors::USERNAME
            .iter()
            .filter_map(|sel| form.select(sel).next())
            .find_map(field_name);
        let username_field = match username_field {
            Some(field) => field,
            None => continue,
        };
        let password_field = selectors::PASSWORD
            .iter()
            .filter_map(|sel| form.select(sel).next())
            .find_map(field_name);
        let hidden = form
            .select(&selectors::HIDDEN)
            .filter_map(|input| {
                Some((
                    input.value().attr("name")?.to_string(),
                    input.value().attr("value").unwrap_or_default().to_string(),
                ))
            })
            .collect();
        let action = form.value().attr("action").unwrap_or("").to_string();
        return Some(LoginForm {
            action,
            username_field,
            password_field,
            hidden,
        });
    }
    None
}

fn has_file_manager(body: &str) -> bool {
    Html::parse_document(body)
        .select(&selectors::FILE_MANAGER)
        .next()
        .is_some()
}

fn portal_origin(source_url: &str) -> Result<String, anyhow::Error> {
    let parsed = url::Url::parse(source_url)?;
    Ok(parsed.origin().ascii_serialization())
}

async fn login_once(
    page: &mut dyn Page,
    origin: &str,
    source_url: &str,
    credentials: &Credentials,
) -> Result<(), anyhow::Error> {
    let login_url = if source_url.contains("/login") {
        source_url.to_string()
    } else {
        format!("{origin}/login")
    };
    page.goto(&login_url).await?;

    let form = find_login_form(page.body())
        .ok_or_else(|| anyhow::anyhow!("login form not found at {login_url}"))?;
    let mut fields = form.hidden.clone();
    fields.push((form.username_field.clone(), credentials.username.clone()));
    if let (Some(field), Some(password)) = (&form.password_field, &credentials.password) {
        fields.push((field.clone(), password.clone()));
    }
    timeout(LOGIN_TIMEOUT, page.submit_form(&form.action, &fields))
        .await
        .map_err(|_| anyhow::anyhow!("login timed out"))??;

    // Success is a /file… URL or a rendered file-manager table.
    if page.url().contains("/file") {
        return Ok(());
    }
    page.goto(&format!("{origin}/file")).await?;
    if has_file_manager(page.body()) {
        return Ok(());
    }
    anyhow::bail!("login verification failed, no file manager after submit")
}

/// Log in with retries and exponential backoff. Failure is fatal to the
/// source, not the retailer.
async fn login(
    page: &mut dyn Page,
    origin: &str,
    source_url: &str,
    credentials: &Credentials,
) -> Result<(), anyhow::Error> {
    log::info!("login.start retailer=publishedprices user={}", credentials.username);
    let mut last_err = None;
    for attempt in 1..=LOGIN_ATTEMPTS {
        match login_once(page, origin, source_url, credentials).await {
            Ok(()) => {
                log::info!("login.success retailer=publishedprices attempt={attempt}");
                return Ok(());
            }
            Err(err) => {
                log::warn!("login.failed attempt={attempt} err={err}");
                last_err = Some(err);
                if attempt < LOGIN_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("login failed")))
}

/// File rows whose date cell matches today, as sorted absolute URLs.
/// The portal renders dates in US month-first order.
fn collect_file_links(
    body: &str,
    base_url: &str,
    patterns: &[String],
    today: time::Date,
) -> Vec<String> {
    let document = Html::parse_document(body);
    let suffixes: Vec<String> = if patterns.is_empty() {
        crate::adapters::DEFAULT_DOWNLOAD_SUFFIXES
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        patterns.iter().map(|p| p.to_lowercase()).collect()
    };

    let mut links = BTreeSet::new();
    for row in document.select(&selectors::ROW) {
        let anchor = match row.select(&selectors::ANCHOR).next() {
            Some(anchor) => anchor,
            None => continue,
        };
        let href = anchor.value().attr("href").unwrap_or("");
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let row_text = row.text().collect::<Vec<_>>().join(" ");
        let date = extract_date(&row_text, DateOrder::MonthFirst)
            .or_else(|| extract_date(href, DateOrder::MonthFirst));
        if !is_today(date, today) {
            continue;
        }
        let lower = href.to_lowercase();
        let matches = looks_like_price_file(&lower)
            || suffixes.iter().any(|s| lower.ends_with(s.as_str()))
            || lower.contains("download");
        if !matches {
            continue;
        }
        if let Ok(absolute) = resolve_url(base_url, href) {
            links.insert(absolute);
        }
    }
    links.into_iter().collect()
}

/// Navigate into the tenant's subfolder: direct URL first, verified by a
/// non-empty listing, then one retried click-through on the folder row.
async fn navigate_to_folder(
    page: &mut dyn Page,
    origin: &str,
    folder: &str,
    patterns: &[String],
    today: time::Date,
) -> Result<(), anyhow::Error> {
    log::info!("folder.navigate retailer=publishedprices folder={folder}");
    let direct = format!("{origin}/file/cdup/{}/", folder.trim_matches('/'));
    if page.goto(&direct).await.is_ok()
        && !collect_file_links(page.body(), page.url(), patterns, today).is_empty()
    {
        log::info!("folder.navigate.success folder={folder} method=direct");
        return Ok(());
    }

    for attempt in 1..=2u32 {
        page.goto(&format!("{origin}/file")).await?;
        let folder_href = {
            let document = Html::parse_document(page.body());
            document
                .select(&selectors::ANCHOR)
                .find(|a| a.text().any(|t| t.contains(folder)))
                .and_then(|a| a.value().attr("href").map(ToString::to_string))
        };
        if let Some(href) = folder_href {
            let target = resolve_url(page.url(), &href)?;
            page.goto(&target).await?;
            if !collect_file_links(page.body(), page.url(), patterns, today).is_empty() {
                log::info!("folder.navigate.success folder={folder} method=click attempt={attempt}");
                return Ok(());
            }
        }
        if attempt == 1 {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
    anyhow::bail!("folder not found: {folder}")
}

/// Authenticated file-manager adapter: login, optional folder, today's
/// file rows, plain fetch per link.
pub async fn crawl(
    page: &mut dyn Page,
    source: &SourceConfig,
    retailer: &RetailerConfig,
    credentials: &Credentials,
    ctx: &CrawlContext<'_>,
    seen: &mut SeenFiles,
) -> RetailerResult {
    let mut result = RetailerResult::new(ctx.retailer_slug, &source.url, "publishedprices");
    let origin = match portal_origin(&source.url) {
        Ok(origin) => origin,
        Err(err) => {
            result.errors.push(format!("fatal:bad_source_url:{err}"));
            return result;
        }
    };

    if let Err(err) = login(page, &origin, &source.url, credentials).await {
        result.errors.push(format!("login_failed:{err}"));
        result.reasons.push("login_failed".to_string());
        return result;
    }

    let patterns = if source.download_patterns.is_empty() {
        &retailer.download_patterns
    } else {
        &source.download_patterns
    };

    if let Some(folder) = &retailer.folder {
        match navigate_to_folder(page, &origin, folder, patterns, ctx.today).await {
            Ok(()) => result.subpath = Some(folder.clone()),
            Err(err) => {
                log::error!("folder.not_found retailer={} folder={folder}", ctx.retailer_slug);
                result.errors.push(format!("folder_not_found:{err}"));
            }
        }
    }

    let links = collect_file_links(page.body(), page.url(), patterns, ctx.today);
    result.links_found = links.len();
    log::info!(
        "links.discovered slug={} adapter=publishedprices count={}",
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
