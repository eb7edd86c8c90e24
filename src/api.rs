use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, Request, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{ApiError, DownloadError},
    format::FormatSpec,
    inspect::{MediaInfo, inspect},
    lifecycle::{DownloadManager, PreparedDownload, validate_source_url},
    rate_limit::RateLimiter,
};

const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
pub struct AppState {
    pub manager: DownloadManager,
    pub rate_limiter: RateLimiter,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(config: &Config, manager: DownloadManager) -> Self {
        Self {
            manager,
            rate_limiter: RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window),
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrepareRequest {
    id: Option<String>,
    url: Option<String>,
    format: Option<FormatSpec>,
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Result<Router, ApiError> {
    let cors = build_cors_layer(allowed_origins)?;

    Ok(Router::new()
        .route("/health", get(health))
        .route("/api/inspect", post(inspect_url))
        .route("/api/prepare", post(prepare_download))
        .route("/api/download/{token}", get(download_file))
        .layer(middleware::from_fn_with_state(state.clone(), enforce_rate_limit))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "ts": Utc::now().timestamp_millis() }))
}

async fn inspect_url(
    State(state): State<AppState>,
    payload: Result<Json<InspectRequest>, JsonRejection>,
) -> Result<Json<MediaInfo>, ApiError> {
    let payload = json_body(payload)?;
    let url = validate_source_url(payload.url.as_deref().unwrap_or_default())?;
    let info = inspect(state.manager.worker(), url).await?;
    Ok(Json(info))
}

async fn prepare_download(
    State(state): State<AppState>,
    payload: Result<Json<PrepareRequest>, JsonRejection>,
) -> Result<Json<PreparedDownload>, ApiError> {
    let payload = json_body(payload)?;
    let url = match payload.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => url,
        None if payload.id.is_some() => {
            return Err(DownloadError::validation(
                "Preparing by id is not supported, send the url",
            )
            .into());
        }
        None => return Err(DownloadError::validation("Missing url or id").into()),
    };

    let format = payload.format.unwrap_or_else(|| FormatSpec::video(None));
    let prepared = state.manager.prepare(url, &format).await?;
    Ok(Json(prepared))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        debug!(status = %rejection.status(), "rejected request body");
        DownloadError::validation(rejection.body_text()).into()
    })
}

async fn download_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let download = state.manager.consume(&token).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(download.mime_type));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&download.size_bytes.to_string())
            .map_err(|_| ApiError::internal("Could not build content length"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&download.file_name))
            .map_err(|_| ApiError::internal("Could not build content disposition"))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&download.file_name))
            .map_err(|_| ApiError::internal("Could not build file name header"))?,
    );

    info!(file = %download.file_name, size = download.size_bytes, "streaming download");
    Ok((headers, Body::from_stream(download.body)).into_response())
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client_ip = client_ip_for_request(state.trust_proxy_headers, request.headers(), addr);
    if let Err(retry_after_seconds) = state.rate_limiter.check(&client_ip).await {
        warn!(%client_ip, retry_after_seconds, "rate limit exceeded");
        return Err(ApiError::rate_limited(retry_after_seconds));
    }
    Ok(next.run(request).await)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            CONTENT_LENGTH,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    if allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set, accepting requests from any origin");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = allowed_origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(origins = ?normalized_origins, "CORS allow-list loaded");

    let allowed = Arc::new(normalized_origins);
    Ok(layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let accepted = normalized
                .as_ref()
                .is_some_and(|value| allowed.contains(value));
            debug!(?origin, ?normalized, accepted, "CORS origin check");
            accepted
        },
    )))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
