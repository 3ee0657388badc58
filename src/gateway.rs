//! Gateway - the fixed request pipeline and the health probe.
//!
//! validation -> authentication -> admission -> detection -> routing
//!
//! A single translation is a batch of one text and one target.
//!
//! Each stage short-circuits. Quota is only consumed once validation and
//! authentication have both passed.

use crate::auth::Authenticator;
use crate::error::GatewayError;
use crate::inference::{Detection, LanguageDetector};
use crate::language::{is_translatable, LanguageCode, LanguagePair, SourceLanguage};
use crate::limiter::{Admission, RateLimiter};
use crate::registry::ModelRegistry;
use crate::router::TranslationRouter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tunables for the request pipeline.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Largest text accepted in one request, in characters. For a batch this
    /// is the sum over its texts.
    pub char_limit: Option<usize>,
    /// Most texts accepted in one batch.
    pub batch_limit: Option<usize>,
    /// Deadline applied when a request does not carry its own.
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_text: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            char_limit: None,
            batch_limit: None,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_text: "Hello".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranslationRequest {
    pub text: String,
    /// Language code or `auto`.
    pub source: String,
    pub target: String,
    pub api_key: Option<String>,
    pub client_address: String,
    pub deadline: Option<Duration>,
    /// Extra hypotheses wanted besides the best translation.
    pub alternatives: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    pub text: String,
    pub alternatives: Vec<String>,
    /// Set when the source was auto-detected.
    pub detected: Option<Detection>,
    pub path: Vec<LanguagePair>,
}

/// Several texts translated into one or more targets, charged as one request.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub texts: Vec<String>,
    /// Language code or `auto`.
    pub source: String,
    pub targets: Vec<String>,
    pub api_key: Option<String>,
    pub client_address: String,
    /// Deadline for the whole batch.
    pub deadline: Option<Duration>,
    pub alternatives: usize,
}

/// One translated text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationItem {
    pub text: String,
    pub alternatives: Vec<String>,
    pub path: Vec<LanguagePair>,
}

impl TranslationItem {
    fn passthrough(text: &str) -> Self {
        Self {
            text: text.to_string(),
            alternatives: Vec::new(),
            path: Vec::new(),
        }
    }
}

/// Every text of a batch translated into one target, in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetTranslations {
    pub target: LanguageCode,
    pub items: Vec<TranslationItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    /// Set when the source was auto-detected.
    pub detected: Option<Detection>,
    /// One entry per distinct target, in request order.
    pub translations: Vec<TargetTranslations>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Health {
    Healthy { loaded_models: usize },
    Unhealthy { reason: String },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy { .. })
    }
}

/// A loaded source language and where it can be translated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageInfo {
    pub code: LanguageCode,
    pub targets: Vec<LanguageCode>,
}

pub struct Gateway {
    auth: Arc<Authenticator>,
    limiter: Arc<RateLimiter>,
    router: Arc<TranslationRouter>,
    registry: Arc<ModelRegistry>,
    detector: Arc<dyn LanguageDetector>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        auth: Arc<Authenticator>,
        limiter: Arc<RateLimiter>,
        router: Arc<TranslationRouter>,
        registry: Arc<ModelRegistry>,
        detector: Arc<dyn LanguageDetector>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            auth,
            limiter,
            router,
            registry,
            detector,
            settings,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    /// Total character count of `texts`, rejecting empty or oversized input.
    fn validate_texts<S: AsRef<str>>(&self, texts: &[S]) -> Result<u64, GatewayError> {
        if texts.is_empty() || texts.iter().any(|t| t.as_ref().is_empty()) {
            return Err(GatewayError::InvalidInput("missing q parameter".to_string()));
        }
        if let Some(limit) = self.settings.batch_limit {
            if texts.len() > limit {
                return Err(GatewayError::InvalidInput(format!(
                    "too many texts ({}), batch limit is {}",
                    texts.len(),
                    limit
                )));
            }
        }
        let chars: usize = texts.iter().map(|t| t.as_ref().chars().count()).sum();
        if let Some(limit) = self.settings.char_limit {
            if chars > limit {
                return Err(GatewayError::InvalidInput(format!(
                    "request ({}) exceeds text limit ({})",
                    chars, limit
                )));
            }
        }
        Ok(chars as u64)
    }

    async fn admit(
        &self,
        api_key: Option<&str>,
        address: &str,
        chars: u64,
    ) -> Result<Admission, GatewayError> {
        let principal = self.auth.authenticate(api_key, address).await?;
        let admission = self
            .limiter
            .admit(&principal.identity, &principal.tier, chars)
            .inspect_err(|rejection| {
                debug!(identity = %principal.identity, ?rejection, "quota exceeded");
            })?;
        Ok(admission)
    }

    pub async fn handle(
        &self,
        request: TranslationRequest,
    ) -> Result<TranslationResult, GatewayError> {
        let batch = self
            .handle_batch(BatchRequest {
                texts: vec![request.text],
                source: request.source,
                targets: vec![request.target],
                api_key: request.api_key,
                client_address: request.client_address,
                deadline: request.deadline,
                alternatives: request.alternatives,
            })
            .await?;

        let item = batch
            .translations
            .into_iter()
            .next()
            .and_then(|t| t.items.into_iter().next())
            .ok_or_else(|| GatewayError::Internal("empty translation batch".to_string()))?;
        Ok(TranslationResult {
            text: item.text,
            alternatives: item.alternatives,
            detected: batch.detected,
            path: item.path,
        })
    }

    /// Translate every text into every target. Quota is charged once, for
    /// the total character count; the deadline covers the whole batch.
    pub async fn handle_batch(&self, request: BatchRequest) -> Result<BatchResult, GatewayError> {
        let chars = self.validate_texts(&request.texts)?;
        let source = SourceLanguage::parse(&request.source)?;
        let targets = parse_targets(&request.targets)?;

        self.admit(request.api_key.as_deref(), &request.client_address, chars)
            .await?;

        let translatable: Vec<&str> = request
            .texts
            .iter()
            .map(String::as_str)
            .filter(|t| is_translatable(t))
            .collect();
        let (source, detected) = match source {
            SourceLanguage::Code(code) => (Some(code), None),
            SourceLanguage::Auto if translatable.is_empty() => (None, None),
            SourceLanguage::Auto => {
                let detection = self.detector.detect(&translatable.join("\n")).await?;
                debug!(language = %detection.language, confidence = detection.confidence, "detected source language");
                (Some(detection.language), Some(detection))
            }
        };

        let budget = request
            .deadline
            .map_or(self.settings.request_timeout, |d| d.min(self.settings.request_timeout));
        let started = Instant::now();

        let mut translations = Vec::with_capacity(targets.len());
        for target in targets {
            let mut items = Vec::with_capacity(request.texts.len());
            for text in &request.texts {
                let item = match source {
                    Some(source) if is_translatable(text) => {
                        let remaining = budget.saturating_sub(started.elapsed());
                        let routed = self
                            .router
                            .translate_with_alternatives(
                                text,
                                source,
                                target,
                                remaining,
                                request.alternatives,
                            )
                            .await?;
                        TranslationItem {
                            text: routed.text,
                            alternatives: routed.alternatives,
                            path: routed.path,
                        }
                    }
                    _ => TranslationItem::passthrough(text),
                };
                items.push(item);
            }
            translations.push(TargetTranslations { target, items });
        }

        Ok(BatchResult {
            detected,
            translations,
        })
    }

    /// Identify the language of `text`. Charged like a translation.
    pub async fn detect(
        &self,
        text: &str,
        api_key: Option<&str>,
        address: &str,
    ) -> Result<Vec<Detection>, GatewayError> {
        let chars = self.validate_texts(&[text])?;
        self.admit(api_key, address, chars).await?;
        let detection = self.detector.detect(text).await?;
        Ok(vec![detection])
    }

    /// Healthy when a model is loaded and answers a probe in time.
    pub async fn health_check(&self) -> Health {
        let pairs = self.registry.loaded_pairs();
        let Some(&probe_pair) = pairs.first() else {
            return Health::Unhealthy {
                reason: "no models loaded".to_string(),
            };
        };

        let Some(lease) = self.registry.lease(probe_pair) else {
            return Health::Unhealthy {
                reason: format!("model {} was unloaded during probe", probe_pair),
            };
        };
        let probe = lease.translator().translate(
            &self.settings.probe_text,
            probe_pair.source,
            probe_pair.target,
        );

        match tokio::time::timeout(self.settings.probe_timeout, probe).await {
            Ok(Ok(_)) => Health::Healthy {
                loaded_models: pairs.len(),
            },
            Ok(Err(e)) => Health::Unhealthy {
                reason: format!("probe through {} failed: {}", probe_pair, e),
            },
            Err(_) => Health::Unhealthy {
                reason: format!(
                    "probe through {} exceeded {:?}",
                    probe_pair, self.settings.probe_timeout
                ),
            },
        }
    }

    /// Loaded languages and their reachable targets, sorted.
    pub fn languages(&self) -> Vec<LanguageInfo> {
        self.router
            .reachable_targets()
            .into_iter()
            .map(|(code, targets)| LanguageInfo {
                code,
                targets: targets.into_iter().collect(),
            })
            .collect()
    }
}

/// Parse target codes, dropping repeats but keeping request order.
fn parse_targets(raw: &[String]) -> Result<Vec<LanguageCode>, GatewayError> {
    if raw.is_empty() {
        return Err(GatewayError::InvalidInput("missing target parameter".to_string()));
    }
    let mut targets = Vec::with_capacity(raw.len());
    for code in raw {
        let code = LanguageCode::parse(code)?;
        if !targets.contains(&code) {
            targets.push(code);
        }
    }
    Ok(targets)
}
