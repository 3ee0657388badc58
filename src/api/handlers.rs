//! HTTP handlers for the translation API.

use super::types::*;
use super::AppState;
use crate::error::GatewayError;
use crate::gateway::{BatchRequest, BatchResult, Health, LanguageInfo};
use crate::inference::Detection;
use crate::language::LanguagePair;
use crate::limiter::Identity;
use crate::logger::{log_record, RequestRecord};
use crate::registry::ModelStatus;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// ============================================================================
// Extractors
// ============================================================================

/// Caller address: first `X-Forwarded-For` entry when the proxy is trusted,
/// else the socket peer.
pub struct ClientAddress(pub String);

impl FromRequestParts<Arc<AppState>> for ClientAddress {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .filter(|_| state.trust_forwarded_for)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let address = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok(Self(address))
    }
}

/// Proof that the caller presented the admin token.
pub struct AdminAccess;

impl FromRequestParts<Arc<AppState>> for AdminAccess {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Err(GatewayError::NotFound("admin API is disabled".to_string()));
        };
        let presented = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            return Err(GatewayError::Unauthorized("Invalid admin token".to_string()));
        }
        Ok(AdminAccess)
    }
}

/// The `api_key` body field, else an `Authorization: Bearer` token.
fn api_key(body_key: Option<String>, headers: &HeaderMap) -> Option<String> {
    body_key.filter(|k| !k.trim().is_empty()).or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|k| k.trim().to_string())
    })
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| GatewayError::InvalidInput(rejection.body_text()))
}

fn record(
    path: &str,
    started: Instant,
    key: Option<&str>,
    address: &str,
    characters: usize,
) -> RequestRecord {
    let identity = match key {
        Some(key) => Identity::Key(key.to_string()),
        None => Identity::Address(address.to_string()),
    };
    RequestRecord {
        method: "POST".to_string(),
        path: path.to_string(),
        status: 200,
        elapsed_ms: started.elapsed().as_millis() as u64,
        identity: Some(identity.to_string()),
        route: Vec::new(),
        characters: Some(characters as u64),
        error_type: None,
    }
}

fn with_error(mut record: RequestRecord, err: &GatewayError) -> RequestRecord {
    record.status = err.status_code().as_u16();
    record.error_type = Some(err.error_type());
    record
}

// ============================================================================
// Translation handlers
// ============================================================================

pub async fn translate(
    State(state): State<Arc<AppState>>,
    ClientAddress(address): ClientAddress,
    headers: HeaderMap,
    payload: Result<Json<TranslateRequest>, JsonRejection>,
) -> Result<Json<TranslateResponse>, GatewayError> {
    let started = Instant::now();
    let request = body(payload)?;
    let alternatives = request.alternatives();
    let key = api_key(request.api_key, &headers);
    let (many_texts, many_targets) = (request.q.is_many(), request.target.is_many());
    let texts = request.q.into_vec();
    let characters = texts.iter().map(|t| t.chars().count()).sum();

    let result = state
        .gateway
        .handle_batch(BatchRequest {
            texts,
            source: request.source,
            targets: request.target.into_vec(),
            api_key: key.clone(),
            client_address: address.clone(),
            deadline: None,
            alternatives,
        })
        .await
        .and_then(|batch| {
            let route = batch
                .translations
                .first()
                .and_then(|t| t.items.first())
                .map(|item| item.path.clone())
                .unwrap_or_default();
            translate_response(batch, many_texts, many_targets, alternatives > 0)
                .map(|response| (route, response))
        });

    let mut entry = record("/translate", started, key.as_deref(), &address, characters);
    match result {
        Ok((route, response)) => {
            entry.route = route;
            log_record(&entry, &state.verbosity);
            Ok(Json(response))
        }
        Err(err) => {
            log_record(&with_error(entry, &err), &state.verbosity);
            Err(err)
        }
    }
}

/// Lay a batch result out in the shape the request used.
fn translate_response(
    batch: BatchResult,
    many_texts: bool,
    many_targets: bool,
    with_alternatives: bool,
) -> Result<TranslateResponse, GatewayError> {
    let mut texts = Vec::with_capacity(batch.translations.len());
    let mut alternatives = Vec::with_capacity(batch.translations.len());
    let mut paths = Vec::with_capacity(batch.translations.len());
    for translations in batch.translations {
        let target = translations.target.to_string();
        let mut target_texts = Vec::with_capacity(translations.items.len());
        let mut target_alternatives = Vec::with_capacity(translations.items.len());
        let mut target_paths = Vec::with_capacity(translations.items.len());
        for item in translations.items {
            target_texts.push(item.text);
            target_alternatives.push(item.alternatives);
            target_paths.push(item.path);
        }
        texts.push((target.clone(), target_texts));
        alternatives.push((target.clone(), target_alternatives));
        paths.push((target, target_paths));
    }

    let empty = || GatewayError::Internal("empty translation batch".to_string());
    Ok(TranslateResponse {
        translated_text: PerTarget::shape(texts, many_texts, many_targets).ok_or_else(empty)?,
        alternatives: if with_alternatives {
            Some(PerTarget::shape(alternatives, many_texts, many_targets).ok_or_else(empty)?)
        } else {
            None
        },
        detected_language: batch.detected,
        path: PerTarget::shape(paths, many_texts, many_targets).ok_or_else(empty)?,
    })
}

pub async fn detect(
    State(state): State<Arc<AppState>>,
    ClientAddress(address): ClientAddress,
    headers: HeaderMap,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<Vec<Detection>>, GatewayError> {
    let started = Instant::now();
    let request = body(payload)?;
    let key = api_key(request.api_key, &headers);
    let characters = request.q.chars().count();

    let result = state
        .gateway
        .detect(&request.q, key.as_deref(), &address)
        .await;

    let entry = record("/detect", started, key.as_deref(), &address, characters);
    match result {
        Ok(detections) => {
            log_record(&entry, &state.verbosity);
            Ok(Json(detections))
        }
        Err(err) => {
            log_record(&with_error(entry, &err), &state.verbosity);
            Err(err)
        }
    }
}

pub async fn languages(State(state): State<Arc<AppState>>) -> Json<Vec<LanguageInfo>> {
    Json(state.gateway.languages())
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.gateway.health_check().await;
    let status = match health {
        Health::Healthy { .. } => StatusCode::OK,
        Health::Unhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health))
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModelStatus>>, GatewayError> {
    Ok(Json(state.gateway.registry().list_models().await?))
}

// ============================================================================
// Admin handlers
// ============================================================================

pub async fn model_action(
    _admin: AdminAccess,
    State(state): State<Arc<AppState>>,
    Path((from, to, action)): Path<(String, String, String)>,
) -> Result<Json<ModelActionResponse>, GatewayError> {
    let pair = LanguagePair::parse(&from, &to)?;
    let registry = state.gateway.registry();

    let outcome = match action.as_str() {
        "install" => Some(registry.install_pair(pair).await?),
        "load" => {
            registry.load(pair).await?;
            None
        }
        "unload" => {
            registry.unload(pair).await?;
            None
        }
        other => {
            return Err(GatewayError::NotFound(format!("unknown model action '{}'", other)));
        }
    };

    Ok(Json(ModelActionResponse {
        pair,
        action,
        outcome,
        loaded: registry.is_loaded(pair),
    }))
}

pub async fn list_keys(
    _admin: AdminAccess,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.gateway.auth().list_keys().await?))
}

pub async fn issue_key(
    _admin: AdminAccess,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueKeyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let request = body(payload)?;
    let key = state
        .gateway
        .auth()
        .issue_key(
            request.req_limit.unwrap_or(state.default_req_limit),
            request.char_limit,
            request.expires_in_secs.map(Duration::from_secs),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn revoke_key(
    _admin: AdminAccess,
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<RevokeKeyResponse>, GatewayError> {
    if state.gateway.auth().revoke(&key).await? {
        Ok(Json(RevokeKeyResponse { revoked: true }))
    } else {
        Err(GatewayError::NotFound("API key not found".to_string()))
    }
}
