use crate::core::{RetailerResult, RunOutcome};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

const WRITE_ATTEMPTS: u32 = 3;

/// One source's line in the run manifest, the shape downstream alerting
/// reads.
#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub slug: String,
    pub adapter: String,
    pub source: String,
    pub links: usize,
    pub downloads: usize,
    pub skipped_dupes: usize,
    pub reasons: Vec<String>,
    pub errors: Vec<String>,
}

impl From<&RetailerResult> for ManifestEntry {
    fn from(result: &RetailerResult) -> Self {
        Self {
            slug: result.retailer_id.clone(),
            adapter: result.adapter.clone(),
            source: result.source_url.clone(),
            links: result.links_found,
            downloads: result.files_downloaded,
            skipped_dupes: result.skipped_dupes,
            reasons: result.reasons.clone(),
            errors: result.errors.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub timed_out: bool,
    pub retailers: Vec<ManifestEntry>,
}

fn rfc3339(ts: time::OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

impl From<&RunOutcome> for RunManifest {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            run_id: outcome.run_id.clone(),
            started_at: rfc3339(outcome.started_at),
            finished_at: rfc3339(outcome.finished_at),
            timed_out: outcome.timed_out,
            retailers: outcome.results.iter().map(ManifestEntry::from).collect(),
        }
    }
}

/// Spool the manifest to disk, retried with backoff. A final failure is
/// logged but never fails the run.
pub async fn write_manifest(manifest: &RunManifest, dir: &Path) -> Option<PathBuf> {
    let path = dir.join(format!("{}.json", manifest.run_id));
    for attempt in 1..=WRITE_ATTEMPTS {
        match try_write(manifest, dir, &path) {
            Ok(()) => {
                log::info!(
                    "manifest.written run_id={} files={} path={}",
                    manifest.run_id,
                    manifest.retailers.len(),
                    path.display()
                );
                return Some(path);
            }
            Err(err) => {
                log::warn!("manifest.write_failed attempt={attempt} err={err}");
                if attempt < WRITE_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }
    log::error!("manifest.failed run_id={}", manifest.run_id);
    None
}

fn try_write(manifest: &RunManifest, dir: &Path, path: &Path) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(dir).context("unable to create manifest dir")?;
    let body = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, body).context("unable to write manifest")?;
    Ok(())
}
