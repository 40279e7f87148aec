use anyhow::{bail, Context, Result};
use url::Url;

/// Fetched page content, clipped so a single block cannot flood the
/// output cache.
const MAX_BODY_CHARS: usize = 100_000;

#[derive(Debug)]
pub struct FetchedPage {
    pub body: String,
    pub status_code: u16,
}

pub async fn fetch_url(http: &reqwest::Client, raw_url: &str) -> Result<FetchedPage> {
    let url = Url::parse(raw_url.trim()).context("invalid URL")?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("unsupported URL scheme '{}'", url.scheme());
    }

    let response = http
        .get(url)
        .send()
        .await
        .context("failed to fetch URL")?;
    let status_code = response.status().as_u16();
    let mut body = response.text().await.context("failed to read response body")?;

    if let Some((byte_idx, _)) = body.char_indices().nth(MAX_BODY_CHARS) {
        body.truncate(byte_idx);
    }

    Ok(FetchedPage { body, status_code })
}
