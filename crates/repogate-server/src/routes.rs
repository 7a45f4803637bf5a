//! HTTP-layer dispatch: turns an axum request into a call into
//! [`repogate_engine::handler::RequestHandler`] (via [`Engine::handle`])
//! and turns its [`HandlerOutcome`] back into an axum [`Response`].
//!
//! This is the thin translation layer sitting in front of the engine:
//! method dispatch, proxy-style vs reverse-proxy routing, and
//! transparent forwarding for anything the [`classify`] module calls
//! `Opaque`.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use repogate_engine::classify::{classify, Kind};
use repogate_engine::handler::HandlerOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::state::AppState;
use crate::tunnel;

const X_CACHE: &str = "x-cache";

/// Top-level fallback handler for everything that isn't `/_admin/*`,
/// `/_health`, or `/metrics` (those get their own routes in `main.rs`).
/// `CONNECT` is handled here too since its authority-form URI doesn't
/// match an ordinary path route.
pub async fn dispatch(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let method = req.method().clone();
    if method == Method::CONNECT {
        return tunnel::connect_handler(State(state), req).await;
    }
    if !matches!(method, Method::GET | Method::HEAD) {
        return transparent_forward(&state, req).await;
    }

    let Some(host) = request_host(&req) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let path = decoded_request_path(&req);
    let client_ims = req
        .headers()
        .get(axum::http::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(repogate_engine::conditional::parse_if_modified_since);

    let Ok(classification) = classify(&host, &path) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if classification.kind == Kind::Opaque {
        return transparent_forward(&state, req).await;
    }

    match state.engine.handle(&host, &path, client_ims).await {
        Ok(outcome) => outcome_to_response(&state, method, outcome).await,
        Err(err) => {
            warn!(error = %err, "request handling failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn outcome_to_response(state: &AppState, method: Method, outcome: HandlerOutcome) -> Response {
    match outcome {
        HandlerOutcome::NotModified => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            response
                .headers_mut()
                .insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static("HIT"));
            response
        }
        HandlerOutcome::MemoryHit(entry) => {
            let mut builder = Response::builder().status(entry.status);
            for (name, value) in &entry.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::from_str(value),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder = builder.header(X_CACHE, "MEMORY-HIT");
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from(entry.bytes)
            };
            builder.body(body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        HandlerOutcome::DiskHit { path, .. } => match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let metadata = file.metadata().await.ok();
                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(metadata) = &metadata {
                    builder = builder.header(axum::http::header::CONTENT_LENGTH, metadata.len());
                    if let Ok(modified) = metadata.modified() {
                        builder = builder.header(
                            axum::http::header::LAST_MODIFIED,
                            repogate_engine::conditional::format_last_modified(modified),
                        );
                    }
                }
                builder = builder.header(X_CACHE, "HIT");
                let body = if method == Method::HEAD {
                    Body::empty()
                } else {
                    Body::from_stream(ReaderStream::new(file))
                };
                builder
                    .body(body)
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        HandlerOutcome::Fetched(fetched) => {
            state.metrics.upstream_fallback(fetched.upstream_index);
            let mut builder = Response::builder().status(fetched.status.as_u16());
            for (name, value) in fetched.headers.iter() {
                builder = builder.header(name, value);
            }
            builder = builder.header(X_CACHE, "MISS");
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from_stream(fetched.body)
            };
            builder
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Forwards a non-cacheable request unmodified to the default upstream:
/// no classification, no caching, no conditional handling — plain
/// pass-through.
async fn transparent_forward(state: &AppState, req: Request<Body>) -> Response {
    let Some(upstream) = state.config.upstreams.first() else {
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let path = request_path(&req);
    let Ok(target) = upstream.url.join(path.trim_start_matches('/')) else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let client = repogate_networking::build_fetch_client(upstream.proxy.as_ref(), Duration::from_secs(30));
    let method = convert_method(req.method());
    let mut builder = client.request(method, target);
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    builder = builder.body(body_bytes.to_vec());

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let mut builder = Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            let stream = response.bytes_stream();
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            warn!(error = %err, "transparent forward failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

fn convert_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

fn request_host(req: &Request<Body>) -> Option<String> {
    req.uri()
        .host()
        .map(str::to_string)
        .or_else(|| header_str(req.headers(), axum::http::header::HOST))
}

fn request_path(req: &Request<Body>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Percent-decodes the request path (without query) for classification
/// and cache-key derivation; `classify` expects a plain decoded path.
fn decoded_request_path(req: &Request<Body>) -> String {
    let raw = req.uri().path();
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn header_str(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}
