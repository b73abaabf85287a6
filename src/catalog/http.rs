// src/catalog/http.rs
//! HTTP implementations of the catalog and manifest source ports

use super::{Catalog, ManifestSource, TitleMetadata};
use crate::error::{Error, Result};
use crate::model::{TitleId, manifest_file_name};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Default timeout for catalog and manifest requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("depotkeep/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))
}

/// Catalog client speaking `GET {base}/titles/{id}`
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn get_title_metadata(&self, title_id: &TitleId) -> Result<Option<TitleMetadata>> {
        let url = format!("{}/titles/{}", self.base_url, title_id);
        debug!("Fetching catalog metadata: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CatalogServiceUnavailable(format!("{url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::CatalogServiceUnavailable(format!("{url}: HTTP {status}")));
            }
            _ => {}
        }

        let metadata = response
            .json::<TitleMetadata>()
            .await
            .map_err(|e| Error::ParseError(format!("Invalid catalog response for {title_id}: {e}")))?;
        Ok(Some(metadata))
    }
}

/// Manifest source fetching `{base}/{depot}_{revision}.manifest`
pub struct HttpManifestSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpManifestSource {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, depot_id: &str, revision_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, manifest_file_name(depot_id, revision_id));
        debug!("Fetching manifest: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {url}: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFoundError(format!(
                "Manifest {depot_id}_{revision_id} not available"
            )));
        }
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "Failed to fetch {url}: HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to read {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}
