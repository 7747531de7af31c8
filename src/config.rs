use crate::credentials::Credentials;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Top-level retailers configuration file (`data/retailers.json`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub retailers: Vec<RetailerConfig>,
    #[serde(default, rename = "authProfiles")]
    pub auth_profiles: HashMap<String, AuthProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthProfile {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub tenants: HashMap<String, Credentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetailerConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default, rename = "tenantKey")]
    pub tenant_key: Option<String>,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub download_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub creds_key: Option<String>,
    #[serde(default)]
    pub download_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub filter_today: bool,
    #[serde(default)]
    pub max_files: Option<usize>,
}

impl SourceConfig {
    /// Host used by the adapter heuristic: explicit `host` field, else
    /// the URL's authority.
    pub fn effective_host(&self) -> String {
        if let Some(host) = &self.host {
            if !host.is_empty() {
                return host.to_lowercase();
            }
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_default()
    }
}

impl RetailerConfig {
    /// Whether crawling this retailer needs portal credentials.
    pub fn requires_credentials(&self) -> bool {
        if self.tenant_key.is_some() {
            return true;
        }
        if self.adapter.as_deref() == Some("publishedprices") {
            return true;
        }
        self.sources.iter().any(|s| {
            s.creds_key.is_some()
                || s.adapter.as_deref() == Some("publishedprices")
                || s.effective_host().contains("publishedprices")
        })
    }
}

/// Load the retailers file. Tried in order: `RETAILERS_CONFIG` env
/// override, `data/retailers.json`, `retailers.json`. A missing or
/// malformed file is fatal at startup.
pub fn load_retailers_config() -> Result<CrawlerConfig, anyhow::Error> {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(path) = std::env::var("RETAILERS_CONFIG") {
        if !path.is_empty() {
            candidates.push(path);
        }
    }
    candidates.push("data/retailers.json".to_string());
    candidates.push("retailers.json".to_string());

    for candidate in &candidates {
        let path = Path::new(candidate);
        log::info!("config: trying config_path={}", path.display());
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        let cfg: CrawlerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("malformed retailers config {}", path.display()))?;
        log::info!(
            "config: loaded path={} retailers={}",
            path.display(),
            cfg.retailers.len()
        );
        return Ok(cfg);
    }
    anyhow::bail!("retailers config not found (tried {})", candidates.join(", "))
}

/// Which retailers a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetailerSelector {
    All,
    PublicOnly,
    CredentialedOnly,
    Single(String),
}

impl RetailerSelector {
    pub fn select(&self, cfg: &CrawlerConfig) -> Vec<RetailerConfig> {
        cfg.retailers
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| match self {
                RetailerSelector::All => true,
                RetailerSelector::PublicOnly => !r.requires_credentials(),
                RetailerSelector::CredentialedOnly => r.requires_credentials(),
                RetailerSelector::Single(slug) => &r.id == slug,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CrawlerConfig {
        serde_json::from_str(
            r#"{
            "retailers": [
                {
                    "id": "shuk-ha-ir",
                    "name": "Shuk Ha'Ir",
                    "sources": [
                        {"url": "https://shuk.example/prices/", "priority": 10},
                        {"url": "https://mirror.example/prices/", "priority": 5, "filter_today": false}
                    ]
                },
                {
                    "id": "super-yuda",
                    "name": "Super Yuda",
                    "tenantKey": "yuda_ho",
                    "folder": "Yuda",
                    "sources": [
                        {"url": "https://url.publishedprices.co.il/login", "priority": 10, "adapter": "publishedprices"}
                    ]
                },
                {
                    "id": "closed-chain",
                    "name": "Closed Chain",
                    "enabled": false,
                    "sources": [{"url": "https://closed.example/"}]
                }
            ],
            "authProfiles": {
                "published": {
                    "type": "publishedprices",
                    "tenants": {"yuda_ho": {"username": "yuda_ho", "password": "secret"}}
                }
            }
        }"#,
        )
        .expect("sample config parses")
    }

    #[test]
    fn defaults_apply() {
        let cfg = sample_config();
        let shuk = &cfg.retailers[0];
        assert!(shuk.enabled);
        assert!(shuk.sources[0].filter_today);
        assert!(!shuk.sources[1].filter_today);
        assert_eq!(0, cfg.retailers[2].sources[0].priority);
    }

    #[test]
    fn derives_credential_requirement() {
        let cfg = sample_config();
        assert!(!cfg.retailers[0].requires_credentials());
        assert!(cfg.retailers[1].requires_credentials());
    }

    #[test]
    fn selector_filters_by_kind() {
        let cfg = sample_config();
        let all = RetailerSelector::All.select(&cfg);
        assert_eq!(2, all.len(), "disabled retailers are excluded");
        let public = RetailerSelector::PublicOnly.select(&cfg);
        assert_eq!(vec!["shuk-ha-ir"], public.iter().map(|r| r.id.as_str()).collect::<Vec<_>>());
        let auth = RetailerSelector::CredentialedOnly.select(&cfg);
        assert_eq!(vec!["super-yuda"], auth.iter().map(|r| r.id.as_str()).collect::<Vec<_>>());
        let single = RetailerSelector::Single("super-yuda".to_string()).select(&cfg);
        assert_eq!(1, single.len());
    }

    #[test]
    fn effective_host_falls_back_to_url() {
        let cfg = sample_config();
        assert_eq!("shuk.example", cfg.retailers[0].sources[0].effective_host());
        assert_eq!(
            "url.publishedprices.co.il",
            cfg.retailers[1].sources[0].effective_host()
        );
    }
}
