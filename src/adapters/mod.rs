pub mod bina;
pub mod dateindex;
pub mod generic;
pub mod publishedprices;

use crate::config::{RetailerConfig, SourceConfig};

pub const PUBLISHED_HOST: &str = "url.publishedprices.co.il";
pub const DEFAULT_DOWNLOAD_SUFFIXES: &[&str] = &[".xml", ".gz", ".zip"];

/// Sentinel prefix marking a filename that must be click-downloaded
/// through the portal's Download() handler instead of fetched as a URL.
pub const DOWNLOAD_BUTTON_PREFIX: &str = "download_button:";

/// Hardened price-file detection: extension match plus the well-known
/// transparency keywords, catching mislabeled links.
pub fn looks_like_price_file(url: &str) -> bool {
    let lower = url.to_lowercase();
    if DEFAULT_DOWNLOAD_SUFFIXES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower.contains("pricefull")
        || lower.contains("promo")
        || lower.contains("stores")
        || lower.contains("price")
}

/// The three portal families plus the date-index special case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    PublishedPrices,
    Bina,
    DateIndex,
    Generic,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterKind::PublishedPrices => "publishedprices",
            AdapterKind::Bina => "bina",
            AdapterKind::DateIndex => "dateindex",
            AdapterKind::Generic => "generic",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "publishedprices" => Some(AdapterKind::PublishedPrices),
            "bina" => Some(AdapterKind::Bina),
            "dateindex" | "wolt_dateindex" => Some(AdapterKind::DateIndex),
            "generic" => Some(AdapterKind::Generic),
            _ => None,
        }
    }
}

/// Pick the adapter for a source: explicit tag on the source, then on
/// the retailer, then the host heuristic.
pub fn resolve(source: &SourceConfig, retailer: &RetailerConfig) -> AdapterKind {
    if let Some(kind) = source
        .adapter
        .as_deref()
        .or(retailer.adapter.as_deref())
        .and_then(AdapterKind::from_tag)
    {
        return kind;
    }
    let host = source.effective_host();
    if host.contains(PUBLISHED_HOST) || host.contains("publishedprices") {
        AdapterKind::PublishedPrices
    } else if host.contains("binaprojects") {
        AdapterKind::Bina
    } else {
        AdapterKind::Generic
    }
}
