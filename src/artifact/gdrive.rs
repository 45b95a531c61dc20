use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header, Client, Response};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info};

use super::ArtifactFetcher;

const PROGRESS_STEP_BYTES: u64 = 64 * 1024 * 1024;

static FILE_PATH_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(?:file/)?d/([0-9A-Za-z_-]{10,})").expect("valid regex"));
static QUERY_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]id=([0-9A-Za-z_-]{10,})").expect("valid regex"));
static FORM_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<form[^>]*id="download-form"[^>]*action="([^"]+)""#).expect("valid regex")
});
static HIDDEN_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<input type="hidden" name="([^"]+)" value="([^"]*)""#).expect("valid regex")
});
static CONFIRM_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="(/uc\?export=download[^"]+)""#).expect("valid regex"));

/// Downloads shared files from Google Drive.
pub struct DriveFetcher {
    client: Client,
    base_url: String,
}

impl DriveFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(3600))
            .user_agent(concat!("examsathi/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn request(&self, url: &str, query: &[(String, String)]) -> Result<Response> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {status} from {url}"));
        }
        Ok(response)
    }
}

#[async_trait]
impl ArtifactFetcher for DriveFetcher {
    async fn fetch(&self, file_id: &str, dest: &Path) -> Result<u64> {
        let id = normalize_file_id(file_id);
        info!(file_id = %id, "downloading model archive from Google Drive");

        let query = vec![
            ("id".to_string(), id.clone()),
            ("export".to_string(), "download".to_string()),
        ];
        let mut response = self.request(&self.base_url, &query).await?;

        // Large files get an interstitial "can't scan for viruses" page first.
        if is_html(&response) {
            let page = response.text().await?;
            let (url, query) = confirmation_request(&page, &self.base_url).ok_or_else(|| {
                anyhow!(
                    "Google Drive returned a page without a download link \
                     (is the file shared publicly?)"
                )
            })?;
            response = self.request(&url, &query).await?;
            if is_html(&response) {
                return Err(anyhow!(
                    "Google Drive refused the download (quota exceeded or file not shared)"
                ));
            }
        }

        write_body(response, dest).await
    }
}

async fn write_body(response: Response, dest: &Path) -> Result<u64> {
    let total = response.content_length();
    let mut file = File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    let mut next_report = PROGRESS_STEP_BYTES;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download interrupted")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        written += chunk.len() as u64;

        if written >= next_report {
            info!(
                mb = written / (1024 * 1024),
                total_mb = total.map(|t| t / (1024 * 1024)),
                "download progress"
            );
            next_report += PROGRESS_STEP_BYTES;
        }
    }
    file.flush().await?;

    info!(bytes = written, dest = %dest.display(), "download finished");
    Ok(written)
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false)
}

/// Accepts a bare id or any Drive share/download link.
pub fn normalize_file_id(raw: &str) -> String {
    let raw = raw.trim();
    FILE_PATH_ID
        .captures(raw)
        .or_else(|| QUERY_ID.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Follow-up request hidden in the large-file warning page, either the
/// current `download-form` or the older `confirm=` link.
pub fn confirmation_request(page: &str, base_url: &str) -> Option<(String, Vec<(String, String)>)> {
    if let Some(action) = FORM_ACTION.captures(page).and_then(|c| c.get(1)) {
        let query = HIDDEN_INPUT
            .captures_iter(page)
            .map(|c| (c[1].to_string(), unescape(&c[2])))
            .collect::<Vec<_>>();
        return Some((unescape(action.as_str()), query));
    }

    let href = CONFIRM_HREF.captures(page)?.get(1)?.as_str();
    let href = unescape(href);
    let (_, query) = href.split_once('?')?;
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Some((base_url.to_string(), query))
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&")
}
