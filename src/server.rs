//! Reverse proxy host that feeds incoming requests to the active worker.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheSource;
use crate::event::EventSender;
use crate::fetch::{
  header_pairs, is_hop_by_hop, FetchError, Fetcher, Request, RequestMode, Response, PRELOAD_HEADER,
};
use crate::worker::{FetchEvent, Preload, Registration};

/// Control endpoints live under this prefix instead of being proxied.
pub const CONTROL_PREFIX: &str = "/__navcache";

/// Largest request body the proxy will buffer.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Shown when a navigation fails and the worker has no offline page either.
const DEFAULT_OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body><h1>You are offline</h1><p>This page is not available right now.</p></body>
</html>"#;

#[derive(Clone)]
struct HostState {
  registration: Registration,
  events: EventSender,
}

#[derive(Serialize)]
struct MessageResponse {
  handled: bool,
}

#[derive(Serialize)]
struct UpdateResponse {
  version: u64,
}

pub fn router(registration: Registration, events: EventSender) -> Router {
  let state = HostState {
    registration,
    events,
  };

  Router::new()
    .route(&format!("{}/status", CONTROL_PREFIX), get(status))
    .route(&format!("{}/message", CONTROL_PREFIX), post(message))
    .route(&format!("{}/update", CONTROL_PREFIX), post(update))
    .fallback(proxy)
    .with_state(state)
}

/// Serve until ctrl-c.
pub async fn run(listen: &str, registration: Registration, events: EventSender) -> Result<()> {
  let addr: SocketAddr = listen
    .parse()
    .map_err(|e| eyre!("Invalid listen address '{}': {}", listen, e))?;
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  info!(%addr, "proxy listening");

  axum::serve(listener, router(registration, events))
    .with_graceful_shutdown(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
      }
    })
    .await
    .map_err(|e| eyre!("Proxy server error: {}", e))?;

  info!("proxy stopped");
  Ok(())
}

async fn status(State(state): State<HostState>) -> impl IntoResponse {
  axum::Json(state.registration.status())
}

async fn message(State(state): State<HostState>, body: Bytes) -> axum::response::Response {
  // Bodies that are not JSON are just another unrecognized message
  let data: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

  match state.events.post_message(data).await {
    Ok(action) => (
      StatusCode::ACCEPTED,
      axum::Json(MessageResponse {
        handled: action.is_some(),
      }),
    )
      .into_response(),
    Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
  }
}

async fn update(State(state): State<HostState>) -> axum::response::Response {
  match state.events.update().await {
    Ok(version) => axum::Json(UpdateResponse { version }).into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)).into_response(),
  }
}

async fn proxy(
  State(state): State<HostState>,
  request: axum::extract::Request,
) -> axum::response::Response {
  let Some(worker) = state.registration.active() else {
    return (StatusCode::SERVICE_UNAVAILABLE, "no active worker").into_response();
  };
  let _client = state.registration.claim_client();

  let request = match into_worker_request(&worker.config().origin, request).await {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let mut event = FetchEvent::new(request);
  if event.request.is_navigation() && worker.navigation_preload_enabled() {
    let preload = start_preload(worker.fetcher(), &event.request);
    event = event.with_preload(preload);
  }

  let url = event.request.url.clone();
  match worker.handle_fetch(event).await {
    Ok(Some(served)) => {
      if served.source == CacheSource::Offline {
        info!(%url, cached_at = ?served.cached_at, "served offline page");
      } else {
        debug!(
          %url,
          source = served.source.as_str(),
          cached_at = ?served.cached_at,
          revalidating = served.revalidation.is_some(),
          "served"
        );
      }
      into_http_response(served.response)
    }
    Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, Html(DEFAULT_OFFLINE_PAGE)).into_response(),
    Err(e) => {
      warn!(%url, error = %e, "upstream fetch failed");
      (StatusCode::BAD_GATEWAY, format!("upstream fetch failed: {}", e)).into_response()
    }
  }
}

/// Begin fetching a navigation while the worker gets ready to handle it.
fn start_preload(fetcher: Arc<dyn Fetcher>, request: &Request) -> Preload {
  let request = request.clone().with_header(PRELOAD_HEADER, "true");
  let handle = tokio::spawn(async move { fetcher.fetch(&request).await });

  Box::pin(async move {
    match handle.await {
      Ok(result) => result.map(Some),
      Err(e) => Err(FetchError::Preload(e.to_string())),
    }
  })
}

/// Work out the request mode the way a browser would have labelled it.
fn classify(method: &Method, headers: &HeaderMap) -> RequestMode {
  if let Some(mode) = headers
    .get("sec-fetch-mode")
    .and_then(|v| v.to_str().ok())
    .and_then(RequestMode::from_header)
  {
    return mode;
  }

  // Clients without fetch metadata: treat HTML page loads as navigations
  let wants_html = headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|accept| accept.contains("text/html"));

  if *method == Method::GET && wants_html {
    RequestMode::Navigate
  } else {
    RequestMode::SameOrigin
  }
}

async fn into_worker_request(origin: &Url, request: axum::extract::Request) -> Result<Request> {
  let (parts, body) = request.into_parts();

  // Rebuild on the upstream origin; joining would let "//host" escape it
  let mut url = origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let headers = header_pairs(&parts.headers);

  let body = axum::body::to_bytes(body, BODY_LIMIT)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  Ok(Request {
    mode: classify(&parts.method, &parts.headers),
    method: parts.method,
    url,
    headers,
    body,
  })
}

fn into_http_response(response: Response) -> axum::response::Response {
  let mut builder = axum::http::Response::builder().status(response.status);

  for (name, value) in &response.headers {
    if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
      continue;
    }
    builder = builder.header(name.as_str(), value.as_str());
  }

  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|e| {
      (StatusCode::BAD_GATEWAY, format!("invalid upstream response: {}", e)).into_response()
    })
}
