use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::traits::{ProgressCallback, RemoteFetcher};

/// HTTP transport that streams responses to disk and resumes partial files.
pub struct HttpFetcher {
    client: Client,
    headers: HashMap<String, String>,
    slots: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(max_tasks: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            headers: HashMap::new(),
            slots: Arc::new(Semaphore::new(max_tasks.max(1))),
        })
    }

    /// Headers sent with every request; per-request headers take precedence.
    pub fn with_default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Build a GET request with default and per-request headers and an optional Range header.
    fn build_request(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range_header: Option<&str>,
    ) -> RequestBuilder {
        let mut req = self.client.get(url);
        for (k, v) in self.headers.iter().filter(|(k, _)| !headers.contains_key(*k)) {
            req = req.header(k.as_str(), v.as_str());
        }
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = range_header {
            req = req.header("Range", range);
        }
        req
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        headers: &HashMap<String, String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|e| anyhow!("download slots closed: {}", e))?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        // A file left behind by an earlier failed attempt is resumed rather than restarted.
        let resume_from = match fs::metadata(destination).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };
        let range = (resume_from > 0).then(|| format!("bytes={}-", resume_from));

        let mut resp = self
            .build_request(url, headers, range.as_deref())
            .send()
            .await
            .map_err(|e| anyhow!("download failed: {}, status: 0({})", url, e))?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && resume_from > 0 {
            debug!("http fetch {} already complete at {} bytes", url, resume_from);
            return Ok(destination.to_path_buf());
        }
        if !status.is_success() {
            warn!("http fetch failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!(
                "download failed: {}, status: {}",
                url,
                status.as_u16()
            ));
        }

        let append = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut loaded = if append { resume_from } else { 0 };
        let total = resp.content_length().map(|len| len + loaded);
        debug!(
            "http fetch status={} url={} resume_from={} total={:?}",
            status.as_u16(),
            url,
            loaded,
            total
        );

        let mut file = if append {
            OpenOptions::new().append(true).open(destination).await?
        } else {
            fs::File::create(destination).await?
        };

        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| anyhow!("download failed: {}, status: {}({})", url, status.as_u16(), e))?
        {
            file.write_all(&chunk).await?;
            loaded += chunk.len() as u64;
            if let (Some(cb), Some(total)) = (&on_progress, total) {
                cb(loaded, total);
            }
        }
        file.flush().await?;

        Ok(destination.to_path_buf())
    }
}
