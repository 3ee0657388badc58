//! In-process backends and fixtures shared by unit tests.

use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::error::InferenceError;
use crate::inference::{Detection, LanguageDetector, ModelLoader, Translator};
use crate::language::{LanguageCode, LanguagePair};
use crate::registry::{ModelRegistry, RegistryOptions};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn code(raw: &str) -> LanguageCode {
    LanguageCode::parse(raw).unwrap()
}

pub fn pair(from: &str, to: &str) -> LanguagePair {
    LanguagePair::parse(from, to).unwrap()
}

/// How a scripted model behaves.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer from a small phrase table, else `"{target}:{text}"`.
    Phrasebook,
    Fail(String),
    Slow(Duration),
}

const PHRASES: &[(&str, &str, &str, &str)] = &[
    ("es", "en", "Hola", "Hello"),
    ("en", "fr", "Hello", "Bonjour"),
    ("en", "es", "Hello", "Hola"),
    ("en", "de", "Hello", "Hallo"),
];

pub struct ScriptedTranslator {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Phrasebook => Ok(PHRASES
                .iter()
                .find(|(s, t, input, _)| {
                    *s == source.as_str() && *t == target.as_str() && *input == text
                })
                .map(|(_, _, _, output)| output.to_string())
                .unwrap_or_else(|| format!("{}:{}", target, text))),
            Behavior::Fail(message) => Err(InferenceError::Failed(message.clone())),
            Behavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(format!("{}:{}", target, text))
            }
        }
    }

    /// The best answer, a repeat of it, then `!`/`?` variants with one repeat.
    async fn hypotheses(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        count: usize,
    ) -> Result<Vec<String>, InferenceError> {
        let best = self.translate(text, source, target).await?;
        let candidates = [
            best.clone(),
            best.clone(),
            format!("{}!", best),
            format!("{}?", best),
            format!("{}!", best),
        ];
        Ok(candidates.into_iter().take(count.max(1)).collect())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader whose models behave per pair as scripted.
#[derive(Default)]
pub struct ScriptedLoader {
    behaviors: Mutex<HashMap<LanguagePair, Behavior>>,
    out_of_memory: Mutex<Vec<LanguagePair>>,
    pub loads: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn set(&self, pair: LanguagePair, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(pair, behavior);
    }

    pub fn refuse_memory(&self, pair: LanguagePair) {
        self.out_of_memory.lock().unwrap().push(pair);
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        _path: &Path,
    ) -> Result<Arc<dyn Translator>, InferenceError> {
        if self.out_of_memory.lock().unwrap().contains(&descriptor.pair) {
            return Err(InferenceError::OutOfMemory("scripted".to_string()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&descriptor.pair)
            .cloned()
            .unwrap_or(Behavior::Phrasebook);
        Ok(Arc::new(ScriptedTranslator {
            behavior,
            calls: Arc::clone(&self.calls),
            releases: Arc::clone(&self.releases),
        }))
    }
}

/// Detector that always answers with the same language.
pub struct FixedDetector(pub LanguageCode);

#[async_trait]
impl LanguageDetector for FixedDetector {
    async fn detect(&self, _text: &str) -> Result<Detection, InferenceError> {
        Ok(Detection {
            language: self.0,
            confidence: 90.0,
        })
    }
}

/// Write a model source file and return a descriptor pointing at it.
pub fn model_source(dir: &Path, pair: LanguagePair, version: &str, body: &[u8]) -> ModelDescriptor {
    let sources = dir.join("sources");
    std::fs::create_dir_all(&sources).unwrap();
    let path = sources.join(format!("{}-{}-{}.bin", pair.source, pair.target, version));
    std::fs::write(&path, body).unwrap();
    ModelDescriptor {
        pair,
        version: version.to_string(),
        size_bytes: body.len() as u64,
        source: format!("file://{}", path.display()),
        sha256: hex::encode(Sha256::digest(body)),
    }
}

/// A registry over a temp directory with every given pair installed and loaded.
pub struct Fixture {
    pub dir: TempDir,
    pub registry: Arc<ModelRegistry>,
    pub loader: Arc<ScriptedLoader>,
}

impl Fixture {
    pub async fn with_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::build(pairs, |_| {}).await
    }

    pub async fn build(
        pairs: &[(&str, &str)],
        configure: impl FnOnce(&mut RegistryOptions),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let descriptors: Vec<_> = pairs
            .iter()
            .map(|(from, to)| model_source(dir.path(), pair(from, to), "1.0", b"weights"))
            .collect();

        let mut options = RegistryOptions::new(dir.path().join("models"));
        options.drain_timeout = Duration::from_secs(5);
        configure(&mut options);

        let loader = Arc::new(ScriptedLoader::default());
        let registry = Arc::new(
            ModelRegistry::new(
                ModelCatalog::from_descriptors(descriptors.clone()),
                Arc::clone(&loader) as Arc<dyn ModelLoader>,
                options,
            )
            .unwrap(),
        );
        for descriptor in &descriptors {
            registry.install(descriptor).await.unwrap();
            registry.load(descriptor.pair).await.unwrap();
        }

        Self {
            dir,
            registry,
            loader,
        }
    }
}
