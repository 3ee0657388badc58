//! Inference backend seam.
//!
//! The router only sees [`Translator`]; a [`ModelLoader`] turns an installed
//! model file into one. Each backend family provides both. The bundled
//! family talks to an inference worker process over HTTP:
//!
//! - `POST /load {pair, path}` -> `{handle}` (507 when out of memory)
//! - `POST /translate {handle, text, source, target, alternatives?}` ->
//!   `{translatedText, alternatives?}`
//! - `POST /unload {handle}`
//! - `POST /detect {text}` -> `{language, confidence}`

use crate::catalog::ModelDescriptor;
use crate::error::InferenceError;
use crate::http::{create_client_with_timeout, WORKER_TIMEOUT};
use crate::language::LanguageCode;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// A model resident in memory that can translate one language pair.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
    ) -> Result<String, InferenceError>;

    /// Up to `count` candidate translations, best first. Backends without
    /// n-best decoding return only the best one.
    async fn hypotheses(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        _count: usize,
    ) -> Result<Vec<String>, InferenceError> {
        Ok(vec![self.translate(text, source, target).await?])
    }

    /// Free backend resources. Called once, after in-flight calls drained.
    async fn release(&self) {}
}

/// Best-effort language identification.
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Detection, InferenceError>;
}

/// Brings installed model files into memory.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        path: &Path,
    ) -> Result<Arc<dyn Translator>, InferenceError>;
}

/// A detected language with confidence in percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub language: LanguageCode,
    pub confidence: f32,
}

/// Inference worker reachable over HTTP.
#[derive(Clone)]
pub struct RemoteWorker {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct LoadResponse {
    handle: String,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
    #[serde(default)]
    alternatives: Vec<String>,
}

#[derive(Deserialize)]
struct DetectResponse {
    language: String,
    #[serde(default)]
    confidence: f32,
}

impl RemoteWorker {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        Ok(Self {
            client: create_client_with_timeout(WORKER_TIMEOUT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let snippet: String = text.chars().take(300).collect();
    format!("worker returned {}: {}", status, snippet)
}

#[async_trait]
impl ModelLoader for RemoteWorker {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        path: &Path,
    ) -> Result<Arc<dyn Translator>, InferenceError> {
        let response = self
            .client
            .post(self.url("/load"))
            .json(&json!({
                "pair": descriptor.pair,
                "version": descriptor.version,
                "path": path,
            }))
            .send()
            .await
            .map_err(|e| InferenceError::Failed(format!("worker unreachable: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                let body: LoadResponse = response
                    .json()
                    .await
                    .map_err(|e| InferenceError::Failed(format!("bad load response: {}", e)))?;
                debug!(pair = %descriptor.pair, handle = %body.handle, "worker loaded model");
                Ok(Arc::new(RemoteModel {
                    client: self.client.clone(),
                    base_url: self.base_url.clone(),
                    handle: body.handle,
                }))
            }
            StatusCode::INSUFFICIENT_STORAGE => {
                Err(InferenceError::OutOfMemory(error_body(response).await))
            }
            _ => Err(InferenceError::Failed(error_body(response).await)),
        }
    }
}

#[async_trait]
impl LanguageDetector for RemoteWorker {
    async fn detect(&self, text: &str) -> Result<Detection, InferenceError> {
        let response = self
            .client
            .post(self.url("/detect"))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| InferenceError::Detection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InferenceError::Detection(error_body(response).await));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Detection(e.to_string()))?;
        let language = LanguageCode::parse(&body.language)
            .map_err(|e| InferenceError::Detection(e.to_string()))?;

        Ok(Detection {
            language,
            confidence: body.confidence.clamp(0.0, 100.0),
        })
    }
}

/// A model held by the inference worker, addressed by its handle.
pub struct RemoteModel {
    client: Client,
    base_url: String,
    handle: String,
}

impl RemoteModel {
    async fn request(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        alternatives: usize,
    ) -> Result<TranslateResponse, InferenceError> {
        let mut body = json!({
            "handle": self.handle,
            "text": text,
            "source": source,
            "target": target,
        });
        if alternatives > 0 {
            body["alternatives"] = json!(alternatives);
        }

        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InferenceError::Failed(error_body(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| InferenceError::Failed(format!("bad translate response: {}", e)))
    }
}

#[async_trait]
impl Translator for RemoteModel {
    async fn translate(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
    ) -> Result<String, InferenceError> {
        Ok(self.request(text, source, target, 0).await?.translated_text)
    }

    async fn hypotheses(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        count: usize,
    ) -> Result<Vec<String>, InferenceError> {
        let body = self
            .request(text, source, target, count.saturating_sub(1))
            .await?;
        Ok(std::iter::once(body.translated_text)
            .chain(body.alternatives)
            .take(count.max(1))
            .collect())
    }

    async fn release(&self) {
        let result = self
            .client
            .post(format!("{}/unload", self.base_url))
            .json(&json!({ "handle": self.handle }))
            .send()
            .await;
        if let Err(e) = result.and_then(|r| r.error_for_status()) {
            warn!(handle = %self.handle, "worker failed to unload model: {}", e);
        }
    }
}
