//! Download of the boundary layer.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

/// Fetches `url` into `path` unless the file is already there.
///
/// Returns `true` when a download happened. The body is written to a temp
/// file and renamed, so an interrupted download leaves nothing behind.
#[tracing::instrument(skip(client), fields(path = %path.display()))]
pub async fn download_if_missing<C: HttpClient>(client: &C, url: &str, path: &Path) -> Result<bool> {
    if path.exists() {
        info!("Boundary layer already present, skipping download");
        return Ok(false);
    }

    info!(url, "Downloading boundary layer");
    let bytes = fetch_bytes(client, url)
        .await
        .with_context(|| format!("Failed to download {url}"))?;

    crate::output::write_atomically(path, |mut out| {
        std::io::Write::write_all(&mut out, &bytes)?;
        std::io::Write::flush(&mut out)?;
        Ok(())
    })
    .with_context(|| format!("Failed to write {}", path.display()))?;

    info!(bytes = bytes.len(), "Download complete");
    Ok(true)
}
