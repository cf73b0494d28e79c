//! Anonymous S3 access over plain HTTPS
//!
//! Listings use `ListObjectsV2` (XML, decoded with quick-xml) and follow
//! continuation tokens; downloads stream the body straight to disk.

use crate::remote::{RemoteError, RemoteObjectKey, RemoteStore};
use async_trait::async_trait;
use ctp_common::config::RemoteConfig;
use ctp_common::TimeBucket;
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const USER_AGENT: &str = concat!("ctp-ingest/", env!("CARGO_PKG_VERSION"));

/// Upper bound on continuation pages for one prefix
const MAX_LIST_PAGES: usize = 100;

/// One page of a `ListObjectsV2` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    #[serde(default)]
    size: u64,
}

/// Decoded listing page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<RemoteObjectKey>,
    pub next_token: Option<String>,
}

/// Parse a `ListObjectsV2` XML body
///
/// Zero-byte placeholder objects ("directory markers") are dropped.
pub fn parse_list_response(xml: &str) -> Result<ListPage, RemoteError> {
    let result: ListBucketResult =
        quick_xml::de::from_str(xml).map_err(|e| RemoteError::Parse(e.to_string()))?;

    let keys = result
        .contents
        .into_iter()
        .filter(|entry| !(entry.size == 0 && entry.key.ends_with('/')))
        .map(|entry| RemoteObjectKey::new(entry.key))
        .collect();

    let next_token = if result.is_truncated {
        result.next_continuation_token
    } else {
        None
    };

    Ok(ListPage { keys, next_token })
}

/// `RemoteStore` backed by a public S3 bucket
pub struct S3HttpStore {
    client: reqwest::Client,
    base_url: String,
    product: String,
}

impl S3HttpStore {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            product: config.product.clone(),
        })
    }

    /// Public URL of an object
    pub fn object_url(&self, key: &RemoteObjectKey) -> String {
        format!("{}/{}", self.base_url, key.as_str().trim_start_matches('/'))
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: Option<u32>,
    ) -> Result<ListPage, RemoteError> {
        let mut query: Vec<(&str, String)> = vec![("list-type", "2".to_string())];
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(token) = token {
            query.push(("continuation-token", token.to_string()));
        }
        if let Some(max) = max_keys {
            query.push(("max-keys", max.to_string()));
        }

        let url = format!("{}/", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.text().await.map_err(transport)?;
        parse_list_response(&body)
    }
}

#[async_trait]
impl RemoteStore for S3HttpStore {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.list_page("", None, Some(1)).await.map(|_| ())
    }

    async fn list(&self, bucket: &TimeBucket) -> Result<Vec<RemoteObjectKey>, RemoteError> {
        let prefix = bucket.remote_prefix(&self.product);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let page = self.list_page(&prefix, token.as_deref(), None).await?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(prefix = %prefix, count = keys.len(), "Listed remote prefix");
        Ok(keys)
    }

    async fn fetch(&self, key: &RemoteObjectKey, dest: &Path) -> Result<u64, RemoteError> {
        let url = self.object_url(key);
        let response = self.client.get(&url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}
