use crate::browser::Page;
use lazy_regex::regex;
use md5::{Digest, Md5};

/// Lowercase hex MD5 of a blob; the content half of the dedup key.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Pick a filename out of a Content-Disposition header.
///
/// Both `filename="x"` and the RFC 5987 `filename*=UTF-8''x` form are
/// supported; the starred form wins when both are present.
pub fn pick_filename(content_disposition: Option<&str>, fallback: &str) -> String {
    let cd = match content_disposition {
        Some(cd) => cd,
        None => return fallback.to_string(),
    };
    if let Some(caps) = regex!(r#"filename\*=(?:UTF-8'')?"?([^";]+)"?"#i).captures(cd) {
        if let Some(m) = caps.get(1) {
            return m.as_str().to_string();
        }
    }
    if let Some(caps) = regex!(r#"filename=(?:UTF-8'')?"?([^";]+)"?"#i).captures(cd) {
        if let Some(m) = caps.get(1) {
            return m.as_str().to_string();
        }
    }
    fallback.to_string()
}

fn last_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(ToString::to_string)
}

/// Download a URL through the page's request context.
///
/// Returns `Ok(None)` for broken links (404/403); other non-OK statuses
/// error out to the caller's per-link error list. The filename honors
/// Content-Disposition, then the final URL's last path segment, then
/// `"download"`.
pub async fn fetch_url(
    page: &dyn Page,
    url: &str,
) -> Result<Option<(Vec<u8>, String)>, anyhow::Error> {
    let fetched = match page.fetch(url).await? {
        Some(fetched) => fetched,
        None => return Ok(None),
    };
    let fallback = last_path_segment(&fetched.url)
        .or_else(|| last_path_segment(url))
        .unwrap_or_else(|| "download".to_string());
    let filename = pick_filename(fetched.content_disposition.as_deref(), &fallback);
    Ok(Some((fetched.bytes, filename)))
}
