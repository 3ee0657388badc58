//! ModelRegistry - installable, installed and loaded translation models.
//!
//! - installable: whatever the [`ModelCatalog`] lists
//! - installed: `{from}-{to}-{version}.model` files in the models directory
//! - loaded: models resident in a backend, at most one per pair
//!
//! Lookups (`is_loaded`, `lease`) only take the read side of the table lock.
//! Install, load and unload are serialized by a separate async mutex so a
//! slow download or drain never blocks translation traffic.

use crate::catalog::{compare_versions, ModelCatalog, ModelDescriptor};
use crate::error::{InferenceError, RegistryError};
use crate::http::{create_client_with_timeout, DOWNLOAD_TIMEOUT};
use crate::inference::{ModelLoader, Translator};
use crate::language::{LanguageCode, LanguagePair};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Registry behaviour taken from the `[models]` config section.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub models_dir: PathBuf,
    /// Only pairs with both codes listed are installed. `None` allows all.
    pub allowlist: Option<Vec<LanguageCode>>,
    /// Replace installed models older than the catalog version.
    pub update_models: bool,
    /// Upper bound on the summed size of loaded models.
    pub memory_budget_bytes: Option<u64>,
    /// How long `unload` waits for in-flight translations.
    pub drain_timeout: Duration,
}

impl RegistryOptions {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            allowlist: None,
            update_models: false,
            memory_budget_bytes: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a successful `install` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
    /// Pair is outside the allowlist; nothing was downloaded.
    Skipped,
}

/// A model file found in the models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledModel {
    pub pair: LanguagePair,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Catalog entry plus its local state, as reported by `/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub pair: LanguagePair,
    pub version: String,
    pub size_bytes: u64,
    pub installed_version: Option<String>,
    pub loaded: bool,
    pub in_flight: usize,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// A model resident in a backend.
pub struct LoadedModel {
    descriptor: ModelDescriptor,
    translator: Arc<dyn Translator>,
    loaded_at: DateTime<Utc>,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    drained: Notify,
}

impl LoadedModel {
    fn new(descriptor: ModelDescriptor, translator: Arc<dyn Translator>) -> Self {
        Self {
            descriptor,
            translator,
            loaded_at: Utc::now(),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(AtomicOrdering::SeqCst)
    }

    async fn wait_drained(&self) {
        loop {
            // Register before checking so a drop between the two is not missed.
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a loaded model from being released while a translation uses it.
pub struct ModelLease {
    model: Arc<LoadedModel>,
}

impl ModelLease {
    fn acquire(model: Arc<LoadedModel>) -> Option<Self> {
        model.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
        let lease = Self { model };
        if lease.model.draining.load(AtomicOrdering::SeqCst) {
            return None;
        }
        Some(lease)
    }

    pub fn pair(&self) -> LanguagePair {
        self.model.descriptor.pair
    }

    pub fn translator(&self) -> &dyn Translator {
        self.model.translator.as_ref()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if self.model.in_flight.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            self.model.drained.notify_waiters();
        }
    }
}

/// A failure collected during `boot`.
#[derive(Debug, Clone, Serialize)]
pub struct BootFailure {
    pub pair: Option<LanguagePair>,
    pub kind: &'static str,
    pub message: String,
}

/// Outcome of bringing every catalog model up at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub installed: Vec<LanguagePair>,
    pub skipped: Vec<LanguagePair>,
    pub loaded: Vec<LanguagePair>,
    pub failures: Vec<BootFailure>,
}

impl BootReport {
    fn fail(&mut self, pair: Option<LanguagePair>, err: &RegistryError) {
        warn!(
            pair = %pair.map(|p| p.to_string()).unwrap_or_default(),
            kind = err.kind(),
            "{}",
            err
        );
        self.failures.push(BootFailure {
            pair,
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

pub struct ModelRegistry {
    catalog: ModelCatalog,
    loader: Arc<dyn ModelLoader>,
    options: RegistryOptions,
    client: Client,
    loaded: RwLock<HashMap<LanguagePair, Arc<LoadedModel>>>,
    lifecycle: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(
        catalog: ModelCatalog,
        loader: Arc<dyn ModelLoader>,
        options: RegistryOptions,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            catalog,
            loader,
            options,
            client: create_client_with_timeout(DOWNLOAD_TIMEOUT)?,
            loaded: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn allowed(&self, pair: LanguagePair) -> bool {
        self.options
            .allowlist
            .as_ref()
            .map_or(true, |allowlist| pair.within(allowlist))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every model the catalog offers.
    pub async fn list_installable(&self) -> Result<Vec<ModelDescriptor>, RegistryError> {
        Ok(self.catalog.descriptors(false).await?.as_ref().clone())
    }

    /// Catalog entries with their installed and loaded state.
    pub async fn list_models(&self) -> Result<Vec<ModelStatus>, RegistryError> {
        let descriptors = self.catalog.descriptors(false).await?;
        let installed = self.installed_models().await?;
        let loaded = self.loaded_snapshot();

        Ok(descriptors
            .iter()
            .map(|d| {
                let model = loaded.get(&d.pair);
                ModelStatus {
                    pair: d.pair,
                    version: d.version.clone(),
                    size_bytes: d.size_bytes,
                    installed_version: installed
                        .iter()
                        .find(|m| m.pair == d.pair)
                        .map(|m| m.version.clone()),
                    loaded: model.is_some(),
                    in_flight: model.map_or(0, |m| m.in_flight()),
                    loaded_at: model.map(|m| m.loaded_at()),
                }
            })
            .collect())
    }

    /// Model files present on disk, newest version per pair, sorted by pair.
    pub async fn installed_models(&self) -> Result<Vec<InstalledModel>, RegistryError> {
        let mut entries = match tokio::fs::read_dir(&self.options.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found: HashMap<LanguagePair, InstalledModel> = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some((pair, version)) = parse_model_file_name(&path) else {
                continue;
            };
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let candidate = InstalledModel {
                pair,
                version,
                path,
                size_bytes,
            };
            match found.get(&pair) {
                Some(existing)
                    if compare_versions(&existing.version, &candidate.version)
                        != Ordering::Less => {}
                _ => {
                    found.insert(pair, candidate);
                }
            }
        }

        let mut models: Vec<_> = found.into_values().collect();
        models.sort_by(|a, b| a.pair.cmp(&b.pair));
        Ok(models)
    }

    async fn installed(&self, pair: LanguagePair) -> Result<Option<InstalledModel>, RegistryError> {
        Ok(self
            .installed_models()
            .await?
            .into_iter()
            .find(|m| m.pair == pair))
    }

    fn loaded_snapshot(&self) -> HashMap<LanguagePair, Arc<LoadedModel>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self, pair: LanguagePair) -> bool {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pair)
    }

    /// Loaded pairs in sorted order.
    pub fn loaded_pairs(&self) -> Vec<LanguagePair> {
        let mut pairs: Vec<_> = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        pairs.sort();
        pairs
    }

    /// Pin a loaded model for one translation. `None` when the pair is not
    /// loaded or is being unloaded.
    pub fn lease(&self, pair: LanguagePair) -> Option<ModelLease> {
        let table = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
        let model = table.get(&pair)?;
        ModelLease::acquire(Arc::clone(model))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Download and verify a model. Idempotent.
    pub async fn install(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<InstallOutcome, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        self.install_locked(descriptor).await
    }

    /// Install the catalog's model for `pair`.
    pub async fn install_pair(&self, pair: LanguagePair) -> Result<InstallOutcome, RegistryError> {
        let descriptor = self
            .catalog
            .find(pair)
            .await?
            .ok_or(RegistryError::UnknownModel(pair))?;
        self.install(&descriptor).await
    }

    async fn install_locked(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<InstallOutcome, RegistryError> {
        let pair = descriptor.pair;
        if !self.allowed(pair) {
            debug!(%pair, "outside allowlist, not installing");
            return Ok(InstallOutcome::Skipped);
        }

        let existing = self.installed(pair).await?;
        if let Some(existing) = &existing {
            let outdated =
                compare_versions(&existing.version, &descriptor.version) == Ordering::Less;
            if !(outdated && self.options.update_models) {
                return Ok(InstallOutcome::AlreadyInstalled);
            }
        }

        tokio::fs::create_dir_all(&self.options.models_dir)
            .await
            .map_err(|e| storage_error(pair, e))?;
        let dest = self.options.models_dir.join(descriptor.file_name());
        info!(%pair, version = %descriptor.version, "downloading model");
        self.download(descriptor, &dest).await?;

        if let Some(old) = existing {
            if old.path != dest {
                if let Err(e) = tokio::fs::remove_file(&old.path).await {
                    warn!(%pair, "could not remove replaced model {}: {}", old.path.display(), e);
                }
            }
        }

        info!(%pair, version = %descriptor.version, "model installed");
        Ok(InstallOutcome::Installed)
    }

    async fn download(&self, descriptor: &ModelDescriptor, dest: &Path) -> Result<(), RegistryError> {
        let pair = descriptor.pair;
        let part = dest.with_extension("model.part");

        let verified = match self.fetch_to(descriptor, &part).await {
            Ok(actual) if actual.eq_ignore_ascii_case(&descriptor.sha256) => Ok(()),
            Ok(actual) => Err(RegistryError::ChecksumMismatch {
                pair,
                expected: descriptor.sha256.clone(),
                actual,
            }),
            Err(e) => Err(e),
        };

        match verified {
            Ok(()) => tokio::fs::rename(&part, dest)
                .await
                .map_err(|e| storage_error(pair, e)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    /// Copy the model source into `part`, returning the SHA-256 of the bytes.
    async fn fetch_to(&self, descriptor: &ModelDescriptor, part: &Path) -> Result<String, RegistryError> {
        let pair = descriptor.pair;
        let download_error = |message: String| RegistryError::Download { pair, message };

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| storage_error(pair, e))?;
        let mut hasher = Sha256::new();
        let source = descriptor.source.as_str();

        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self
                .client
                .get(source)
                .send()
                .await
                .map_err(|e| download_error(e.to_string()))?;
            if !response.status().is_success() {
                return Err(download_error(format!("{} returned {}", source, response.status())));
            }
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
                hasher.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|e| storage_error(pair, e))?;
            }
        } else {
            let path = source.trim_start_matches("file://");
            let mut input = tokio::fs::File::open(path)
                .await
                .map_err(|e| download_error(format!("{}: {}", path, e)))?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = input
                    .read(&mut buf)
                    .await
                    .map_err(|e| download_error(e.to_string()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| storage_error(pair, e))?;
            }
        }

        file.sync_all().await.map_err(|e| storage_error(pair, e))?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Bring an installed model into memory. Idempotent.
    pub async fn load(&self, pair: LanguagePair) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;
        self.load_locked(pair).await
    }

    async fn load_locked(&self, pair: LanguagePair) -> Result<(), RegistryError> {
        if self.is_loaded(pair) {
            return Ok(());
        }

        let installed = self
            .installed(pair)
            .await?
            .ok_or(RegistryError::NotInstalled(pair))?;
        let descriptor = self.descriptor_for(&installed).await;

        if let Some(budget) = self.options.memory_budget_bytes {
            let resident: u64 = self
                .loaded_snapshot()
                .values()
                .map(|m| m.descriptor.size_bytes)
                .sum();
            if resident.saturating_add(descriptor.size_bytes) > budget {
                return Err(RegistryError::OutOfMemory {
                    pair,
                    message: format!(
                        "{} bytes resident, {} more would exceed the {} byte budget",
                        resident, descriptor.size_bytes, budget
                    ),
                });
            }
        }

        let translator = self
            .loader
            .load(&descriptor, &installed.path)
            .await
            .map_err(|e| match e {
                InferenceError::OutOfMemory(message) => RegistryError::OutOfMemory { pair, message },
                other => RegistryError::Backend {
                    pair,
                    message: other.to_string(),
                },
            })?;

        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair, Arc::new(LoadedModel::new(descriptor, translator)));
        info!(%pair, version = %installed.version, "model loaded");
        Ok(())
    }

    /// The catalog descriptor matching an installed file, or one built from
    /// the file itself when the catalog is unreachable or has moved on.
    async fn descriptor_for(&self, installed: &InstalledModel) -> ModelDescriptor {
        match self.catalog.find(installed.pair).await {
            Ok(Some(d)) if d.version == installed.version => d,
            _ => ModelDescriptor {
                pair: installed.pair,
                version: installed.version.clone(),
                size_bytes: installed.size_bytes,
                source: installed.path.display().to_string(),
                sha256: String::new(),
            },
        }
    }

    /// Remove a model from service, wait for in-flight translations and
    /// release its backend resources.
    pub async fn unload(&self, pair: LanguagePair) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;

        let model = self
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pair)
            .ok_or(RegistryError::NotLoaded(pair))?;
        model.draining.store(true, AtomicOrdering::SeqCst);

        let in_flight = model.in_flight();
        if in_flight > 0 {
            debug!(%pair, in_flight, "draining model");
        }
        if tokio::time::timeout(self.options.drain_timeout, model.wait_drained())
            .await
            .is_err()
        {
            warn!(
                %pair,
                in_flight = model.in_flight(),
                "drain timeout elapsed, releasing model anyway"
            );
        }

        model.translator.release().await;
        info!(%pair, "model unloaded");
        Ok(())
    }

    /// Unload everything. Used on shutdown.
    pub async fn unload_all(&self) {
        for pair in self.loaded_pairs() {
            if let Err(e) = self.unload(pair).await {
                debug!(%pair, "{}", e);
            }
        }
    }

    /// Install and load every catalog model the allowlist admits, then load
    /// any other installed model. Failures are collected, never fatal here.
    pub async fn boot(&self) -> BootReport {
        let _guard = self.lifecycle.lock().await;
        let mut report = BootReport::default();

        match self.catalog.descriptors(false).await {
            Ok(descriptors) => {
                for descriptor in descriptors.iter() {
                    match self.install_locked(descriptor).await {
                        Ok(InstallOutcome::Installed) => report.installed.push(descriptor.pair),
                        Ok(InstallOutcome::Skipped) => report.skipped.push(descriptor.pair),
                        Ok(InstallOutcome::AlreadyInstalled) => {}
                        Err(e) => report.fail(Some(descriptor.pair), &e),
                    }
                }
            }
            Err(e) => report.fail(None, &RegistryError::Catalog(e)),
        }

        let installed = match self.installed_models().await {
            Ok(installed) => installed,
            Err(e) => {
                report.fail(None, &e);
                Vec::new()
            }
        };
        for model in installed.into_iter().filter(|m| self.allowed(m.pair)) {
            match self.load_locked(model.pair).await {
                Ok(()) => report.loaded.push(model.pair),
                Err(e) => report.fail(Some(model.pair), &e),
            }
        }

        info!(
            loaded = report.loaded.len(),
            installed = report.installed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "model boot finished"
        );
        report
    }
}

fn storage_error(pair: LanguagePair, err: std::io::Error) -> RegistryError {
    if err.kind() == ErrorKind::StorageFull {
        RegistryError::DiskFull(pair)
    } else {
        RegistryError::Io(err)
    }
}

/// Parse `{from}-{to}-{version}.model`.
fn parse_model_file_name(path: &Path) -> Option<(LanguagePair, String)> {
    if path.extension()? != "model" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.splitn(3, '-');
    let (from, to, version) = (parts.next()?, parts.next()?, parts.next()?);
    let pair = LanguagePair::parse(from, to).ok()?;
    Some((pair, version.to_string()))
}
