//! ModelCatalog - the index of installable translation models.
//!
//! The index is a JSON document served over HTTP(S) or read from a local file:
//!
//! ```json
//! {"models": [{"from": "es", "to": "en", "version": "1.9", "size_bytes": 92000000,
//!              "url": "https://…/es-en-1.9.model", "sha256": "…"}]}
//! ```
//!
//! Fetched indexes are cached for a TTL and saved next to the models so a
//! restart without network access still knows what is installable.

use crate::error::CatalogError;
use crate::http::create_client;
use crate::language::LanguagePair;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CACHE_KEY: &str = "model_index";

/// An installable model. Immutable once read from the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub pair: LanguagePair,
    pub version: String,
    pub size_bytes: u64,
    /// Download location: http(s) URL, `file://` URL or plain path.
    pub source: String,
    /// Lowercase hex SHA-256 of the model file.
    pub sha256: String,
}

impl ModelDescriptor {
    /// File name of this model inside the models directory.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.model", self.pair.source, self.pair.target, self.version)
    }
}

#[derive(Deserialize)]
struct ModelIndex {
    models: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct IndexEntry {
    from: String,
    to: String,
    version: String,
    #[serde(default)]
    size_bytes: u64,
    url: String,
    sha256: String,
}

/// Versions become part of the model file name, so they may not name
/// another directory.
fn is_safe_version(version: &str) -> bool {
    !version.trim().is_empty()
        && !version.contains('/')
        && !version.contains('\\')
        && !version.contains("..")
}

/// Compare dotted version strings numerically ("1.10" > "1.9").
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split(['.', '-'])
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Source of installable model descriptors.
#[derive(Clone)]
pub struct ModelCatalog {
    client: Client,
    index_url: String,
    saved_index: Option<PathBuf>,
    fixed: Option<Arc<Vec<ModelDescriptor>>>,
    cache: Cache<String, Arc<Vec<ModelDescriptor>>>,
}

impl ModelCatalog {
    pub fn new(index_url: &str) -> Result<Self, CatalogError> {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(3600)) // 1 hour - model indexes rarely change
            .build();

        Ok(Self {
            client: create_client().map_err(|e| CatalogError::Fetch(e.to_string()))?,
            index_url: index_url.to_string(),
            saved_index: None,
            fixed: None,
            cache,
        })
    }

    /// A catalog with a fixed set of descriptors and no index to fetch.
    pub fn from_descriptors(mut descriptors: Vec<ModelDescriptor>) -> Self {
        descriptors.sort_by(|a, b| a.pair.cmp(&b.pair));
        Self {
            client: Client::new(),
            index_url: String::new(),
            saved_index: None,
            fixed: Some(Arc::new(descriptors)),
            cache: Cache::builder().build(),
        }
    }

    /// Save fetched indexes to `path` and fall back to it when fetching fails.
    pub fn with_saved_index(mut self, path: PathBuf) -> Self {
        self.saved_index = Some(path);
        self
    }

    pub fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache = Cache::builder()
            .time_to_live(Duration::from_secs(secs))
            .build();
        self
    }

    /// Parse an index document. Entries with unknown languages or with a
    /// version that is not a plain file name component are skipped; when a
    /// pair is listed more than once the highest version wins.
    pub fn parse_index(json: &str) -> Result<Vec<ModelDescriptor>, CatalogError> {
        let index: ModelIndex = serde_json::from_str(json)?;
        let mut descriptors: Vec<ModelDescriptor> = Vec::new();

        for entry in index.models {
            let pair = match LanguagePair::parse(&entry.from, &entry.to) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("skipping index entry {}->{}: {}", entry.from, entry.to, e);
                    continue;
                }
            };
            if !is_safe_version(&entry.version) {
                warn!(%pair, version = %entry.version, "skipping index entry with unsafe version");
                continue;
            }
            let descriptor = ModelDescriptor {
                pair,
                version: entry.version,
                size_bytes: entry.size_bytes,
                source: entry.url,
                sha256: entry.sha256.to_ascii_lowercase(),
            };

            match descriptors.iter_mut().find(|d| d.pair == pair) {
                Some(existing) => {
                    if compare_versions(&descriptor.version, &existing.version) == Ordering::Greater {
                        *existing = descriptor;
                    }
                }
                None => descriptors.push(descriptor),
            }
        }

        descriptors.sort_by(|a, b| a.pair.cmp(&b.pair));
        Ok(descriptors)
    }

    fn is_remote(&self) -> bool {
        self.index_url.starts_with("http://") || self.index_url.starts_with("https://")
    }

    async fn read_index(&self) -> Result<String, CatalogError> {
        if self.is_remote() {
            let response = self
                .client
                .get(&self.index_url)
                .send()
                .await
                .map_err(|e| CatalogError::Fetch(e.to_string()))?;
            if !response.status().is_success() {
                return Err(CatalogError::Fetch(format!(
                    "{} returned {}",
                    self.index_url,
                    response.status()
                )));
            }
            response
                .text()
                .await
                .map_err(|e| CatalogError::Fetch(e.to_string()))
        } else {
            let path = self.index_url.trim_start_matches("file://");
            Ok(tokio::fs::read_to_string(path).await?)
        }
    }

    /// Fetch and parse the index, bypassing the cache.
    pub async fn fetch(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
        let fetched = match self.read_index().await {
            Ok(body) => Self::parse_index(&body).map(|descriptors| (descriptors, body)),
            Err(e) => Err(e),
        };

        match fetched {
            Ok((descriptors, body)) => {
                if let Some(path) = &self.saved_index {
                    if let Err(e) = tokio::fs::write(path, &body).await {
                        warn!("could not save model index to {}: {}", path.display(), e);
                    }
                }
                Ok(descriptors)
            }
            Err(e) => {
                let Some(path) = &self.saved_index else {
                    return Err(e);
                };
                match tokio::fs::read_to_string(path).await {
                    Ok(saved) => {
                        warn!("model index unavailable ({}), using saved copy", e);
                        Self::parse_index(&saved)
                    }
                    Err(_) => Err(e),
                }
            }
        }
    }

    /// All installable models, sorted by pair (cached).
    pub async fn descriptors(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<Vec<ModelDescriptor>>, CatalogError> {
        if let Some(fixed) = &self.fixed {
            return Ok(Arc::clone(fixed));
        }

        if !force_refresh {
            if let Some(cached) = self.cache.get(CACHE_KEY).await {
                return Ok(cached);
            }
        }

        let descriptors = Arc::new(self.fetch().await?);
        self.cache
            .insert(CACHE_KEY.to_string(), Arc::clone(&descriptors))
            .await;
        Ok(descriptors)
    }

    /// Descriptor for one pair, if the catalog lists it.
    pub async fn find(&self, pair: LanguagePair) -> Result<Option<ModelDescriptor>, CatalogError> {
        Ok(self
            .descriptors(false)
            .await?
            .iter()
            .find(|d| d.pair == pair)
            .cloned())
    }
}
