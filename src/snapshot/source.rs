//! Still image sources

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CACHE_CONTROL;
use std::sync::Arc;

use crate::config::CameraConfig;
use crate::error::{AppError, Result};

/// Where snapshots come from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Bytes>;
}

/// Fetches the configured snapshot URL, or the poster when none is set
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// `None` when the config names no image URL at all
    pub fn from_config(client: reqwest::Client, config: &CameraConfig) -> Option<Self> {
        config
            .snapshot_url
            .as_deref()
            .or(config.poster.as_deref())
            .filter(|u| !u.is_empty())
            .map(|url| Self::new(client, url))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<Bytes> {
        let response = self
            .client
            .get(&self.url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Snapshot(format!(
                "Fetch image failed with status {}",
                response.status().as_u16()
            )));
        }

        Ok(response.bytes().await?)
    }
}

/// Picks the snapshot source of a new session
pub trait SnapshotSourceFactory: Send + Sync {
    fn create(&self, config: &CameraConfig) -> Option<Arc<dyn SnapshotSource>>;
}

/// Factory producing [`HttpSnapshotSource`]s sharing one client
#[derive(Clone, Default)]
pub struct HttpSnapshotSourceFactory {
    client: reqwest::Client,
}

impl HttpSnapshotSourceFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl SnapshotSourceFactory for HttpSnapshotSourceFactory {
    fn create(&self, config: &CameraConfig) -> Option<Arc<dyn SnapshotSource>> {
        HttpSnapshotSource::from_config(self.client.clone(), config)
            .map(|source| Arc::new(source) as Arc<dyn SnapshotSource>)
    }
}
