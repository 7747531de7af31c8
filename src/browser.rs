use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use scraper::Html;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
const FRAME_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Bytes fetched from a portal together with the response metadata the
/// download layer needs for naming.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub content_disposition: Option<String>,
    pub url: String,
}

/// One rendered document: the main page or a child frame.
#[derive(Debug, Clone)]
pub struct FrameDoc {
    pub url: String,
    pub body: String,
}

/// The portal interaction surface adapters are written against.
///
/// A page belongs to exactly one browser context (cookie jar); navigation
/// state is the current URL plus its body. HTML inspection happens on the
/// caller's side with `scraper` so implementations stay transport-only.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&mut self, url: &str) -> Result<(), anyhow::Error>;

    fn url(&self) -> &str;

    fn body(&self) -> &str;

    /// Current document followed by every reachable child frame.
    async fn frames(&mut self) -> Result<Vec<FrameDoc>, anyhow::Error>;

    /// Submit a form and land on the response like a real navigation.
    async fn submit_form(
        &mut self,
        action: &str,
        fields: &[(String, String)],
    ) -> Result<(), anyhow::Error>;

    /// GET raw bytes through the page's request context. `Ok(None)` means
    /// the link is broken (404/403) and should be soft-skipped.
    async fn fetch(&self, url: &str) -> Result<Option<FetchedFile>, anyhow::Error>;

    /// Trigger a portal `Download('file')` control and collect the bytes
    /// it would hand to the browser.
    async fn click_download(&mut self, filename: &str) -> Result<FetchedFile, anyhow::Error>;
}

/// Factory for browser contexts. Each worker opens one context and keeps
/// it for its whole run; dropping the page releases the context.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Page>, anyhow::Error>;
}

/// Resolve a possibly-relative href against a base URL.
pub fn resolve_url(base: &str, href: &str) -> Result<String, anyhow::Error> {
    let base = url::Url::parse(base).with_context(|| format!("bad base url {base}"))?;
    Ok(base
        .join(href)
        .with_context(|| format!("bad href {href}"))?
        .to_string())
}

pub struct HttpBrowser;

impl HttpBrowser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>, anyhow::Error> {
        // A fresh cookie jar per page is what isolates one retailer's
        // session from another's.
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .timeout(REQUEST_TIMEOUT)
            .cookie_provider(Arc::new(Jar::default()))
            .use_rustls_tls()
            .build()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Box::new(HttpPage {
            client,
            url: String::new(),
            body: String::new(),
        }))
    }
}

pub struct HttpPage {
    client: ClientWithMiddleware,
    url: String,
    body: String,
}

mod selectors {
    #![allow(clippy::unwrap_used)]
    use once_cell::sync::Lazy;
    use scraper::Selector;

    pub static FRAME_SRC: Lazy<Selector> =
        Lazy::new(|| Selector::parse("iframe[src], frame[src]").unwrap());
}

fn frame_sources(body: &str, base: &str) -> Vec<String> {
    let document = Html::parse_document(body);
    document
        .select(&selectors::FRAME_SRC)
        .filter_map(|e| e.value().attr("src"))
        .filter_map(|src| resolve_url(base, src).ok())
        .collect()
}

#[async_trait]
impl Page for HttpPage {
    async fn goto(&mut self, url: &str) -> Result<(), anyhow::Error> {
        let response = timeout(NAVIGATION_TIMEOUT, self.client.get(url).send())
            .await
            .map_err(|_| anyhow!("navigation_timeout url={url}"))??;
        self.url = response.url().to_string();
        self.body = response.text().await?;
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn body(&self) -> &str {
        &self.body
    }

    async fn frames(&mut self) -> Result<Vec<FrameDoc>, anyhow::Error> {
        let mut docs = vec![FrameDoc {
            url: self.url.clone(),
            body: self.body.clone(),
        }];
        for src in frame_sources(&self.body, &self.url) {
            let fetched = timeout(FRAME_TIMEOUT, self.client.get(&src).send()).await;
            match fetched {
                Ok(Ok(response)) => match response.text().await {
                    Ok(body) => docs.push(FrameDoc { url: src, body }),
                    Err(err) => log::debug!("frame body failed url={src} err={err}"),
                },
                Ok(Err(err)) => log::debug!("frame fetch failed url={src} err={err}"),
                Err(_) => log::debug!("frame fetch timed out url={src}"),
            }
        }
        Ok(docs)
    }

    async fn submit_form(
        &mut self,
        action: &str,
        fields: &[(String, String)],
    ) -> Result<(), anyhow::Error> {
        let action = resolve_url(&self.url, action)?;
        let response = timeout(
            NAVIGATION_TIMEOUT,
            self.client.post(&action).form(fields).send(),
        )
        .await
        .map_err(|_| anyhow!("form_timeout url={action}"))??;
        self.url = response.url().to_string();
        self.body = response.text().await?;
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<Option<FetchedFile>, anyhow::Error> {
        let response = timeout(REQUEST_TIMEOUT, self.client.get(url).send())
            .await
            .map_err(|_| anyhow!("request_timeout url={url}"))??;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            log::warn!("skipping broken link: {url} status={status}");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("download_failed status={status} url={url}"));
        }
        let content_disposition = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let final_url = response.url().to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok(Some(FetchedFile {
            bytes,
            content_disposition,
            url: final_url,
        }))
    }

    async fn click_download(&mut self, filename: &str) -> Result<FetchedFile, anyhow::Error> {
        // The portals' Download() handler serves files from a Download/
        // path next to the listing page; fall back to the bare filename.
        let primary = resolve_url(&self.url, &format!("Download/{filename}"))?;
        if let Some(file) = self.fetch(&primary).await? {
            return Ok(file);
        }
        let secondary = resolve_url(&self.url, filename)?;
        if let Some(file) = self.fetch(&secondary).await? {
            return Ok(file);
        }
        Err(anyhow!("click_download_failed file={filename}"))
    }
}
