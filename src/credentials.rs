use crate::config::CrawlerConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;

/// Login material for one portal tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// Tenant key → credentials, read-only after startup.
///
/// Seeded from the config file's `authProfiles` (publishedprices-type
/// profiles only) and merged with the `RETAILER_CREDS_JSON` environment
/// variable, which wins on key collisions.
#[derive(Debug, Default)]
pub struct CredentialStore {
    tenants: HashMap<String, Credentials>,
}

impl CredentialStore {
    pub fn load(cfg: &CrawlerConfig) -> Result<Self, anyhow::Error> {
        let mut tenants: HashMap<String, Credentials> = HashMap::new();
        for profile in cfg.auth_profiles.values() {
            if profile.kind == "publishedprices" {
                tenants.extend(profile.tenants.clone());
            }
        }
        if let Ok(raw) = std::env::var("RETAILER_CREDS_JSON") {
            if !raw.trim().is_empty() {
                let env_creds: HashMap<String, Credentials> =
                    serde_json::from_str(&raw).context("invalid RETAILER_CREDS_JSON")?;
                tenants.extend(env_creds);
            }
        }
        log::info!("credentials: loaded tenants={}", tenants.len());
        Ok(Self { tenants })
    }

    pub fn from_map(tenants: HashMap<String, Credentials>) -> Self {
        Self { tenants }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Look up a tenant key, falling back to a case-insensitive scan.
    /// Returns the original-cased key so callers keep using the canonical
    /// spelling; the remap is logged.
    pub fn lookup(&self, key: &str) -> Option<(&str, &Credentials)> {
        if let Some((canonical, creds)) = self.tenants.get_key_value(key) {
            return Some((canonical.as_str(), creds));
        }
        let folded = key.to_lowercase();
        for (canonical, creds) in &self.tenants {
            if canonical.to_lowercase() == folded {
                log::debug!("credentials: case_match requested={key} matched={canonical}");
                return Some((canonical.as_str(), creds));
            }
        }
        None
    }
}
