//! Range request interception.
//!
//! Ranged reads against the streaming path are not served directly. The
//! interceptor announces a [`RangeNeeded`] to whoever can actually fetch the
//! data, holds the request, and answers it with `206 Partial Content` once a
//! matching [`RangeCompleted`] arrives. Concurrent reads for the same
//! resource key share one announcement and are all answered, in arrival
//! order, from the same completion.
//!
//! Reads under the profiles path are served from the cache, or held until
//! [`RangeInterceptor::profile_completed`] is called for their key. Every
//! other path is handed to a [`PassThrough`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use dashmap::DashMap;
use mediaferry_common::ResourceKey;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use crate::config::InterceptConfig;

/// Largest request body forwarded by [`HttpPassThrough`].
const MAX_FORWARD_BODY: usize = 16 * 1024 * 1024;

/// Announcement that a byte range of a resource is wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeNeeded {
    pub key: ResourceKey,
    /// Aligned start offset.
    pub offset: u64,
    pub limit: u64,
}

/// Data for a previously announced range.
#[derive(Debug, Clone)]
pub struct RangeCompleted {
    pub key: ResourceKey,
    pub offset: u64,
    /// Exclusive end offset.
    pub end: u64,
    /// Total resource size, if known.
    pub total: Option<u64>,
    pub data: Bytes,
}

/// A cached answer shared by every request it resolves.
#[derive(Debug, Clone)]
pub struct CachedRange {
    pub offset: u64,
    pub end: u64,
    pub total: Option<u64>,
    pub content_type: &'static str,
    pub data: Bytes,
    /// Whether this answers a range request (206) or a whole resource (200).
    pub partial: bool,
}

impl CachedRange {
    fn content_range(&self) -> String {
        let total = self
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        format!("bytes {}-{}/{}", self.offset, self.end.saturating_sub(1), total)
    }

    /// Build an HTTP response for this entry.
    pub fn to_response(&self) -> Response {
        let mut builder = Response::builder()
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_LENGTH, self.data.len().to_string())
            .header(header::ACCEPT_RANGES, "bytes");
        builder = if self.partial {
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, self.content_range())
        } else {
            builder.status(StatusCode::OK)
        };
        builder
            .body(Body::from(self.data.clone()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

type Resolver = oneshot::Sender<Result<Arc<CachedRange>, StatusCode>>;

/// Handles requests that are not streaming or profile reads.
#[async_trait::async_trait]
pub trait PassThrough: Send + Sync {
    async fn forward(&self, request: Request) -> Response;
}

/// Proxies requests to an upstream base URL.
#[derive(Debug, Clone)]
pub struct HttpPassThrough {
    client: reqwest::Client,
    upstream: Option<String>,
}

impl HttpPassThrough {
    pub fn new(upstream: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream: upstream.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    async fn proxy(&self, upstream: &str, request: Request) -> Result<Response, String> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("{}{}", upstream, path);

        // reqwest speaks http 0.2; convert through strings and bytes.
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|e| e.to_string())?;
        let mut outgoing = self.client.request(method, &url);
        for (name, value) in request.headers() {
            if name != header::HOST {
                outgoing = outgoing.header(name.as_str(), value.as_bytes());
            }
        }
        let body = axum::body::to_bytes(request.into_body(), MAX_FORWARD_BODY)
            .await
            .map_err(|e| e.to_string())?;
        if !body.is_empty() {
            outgoing = outgoing.body(body);
        }

        let upstream_response = outgoing.send().await.map_err(|e| e.to_string())?;
        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = Response::builder().status(status);
        for (name, value) in upstream_response.headers() {
            response = response.header(name.as_str(), value.as_bytes());
        }
        let bytes = upstream_response.bytes().await.map_err(|e| e.to_string())?;

        response.body(Body::from(bytes)).map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl PassThrough for HttpPassThrough {
    async fn forward(&self, request: Request) -> Response {
        let Some(upstream) = &self.upstream else {
            return (StatusCode::BAD_GATEWAY, "no upstream configured").into_response();
        };
        let uri = request.uri().clone();
        match self.proxy(upstream, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%uri, error = %e, "Pass-through request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

/// Brokers ranged reads between HTTP consumers and a data source.
#[derive(Clone)]
pub struct RangeInterceptor {
    inner: Arc<Inner>,
}

struct Inner {
    config: InterceptConfig,
    /// Held streaming reads per key, in arrival order.
    pending: DashMap<ResourceKey, Vec<Resolver>>,
    /// Held profile reads per key.
    held_profiles: DashMap<ResourceKey, Vec<oneshot::Sender<()>>>,
    cache: DashMap<ResourceKey, Arc<CachedRange>>,
    needed: mpsc::UnboundedSender<RangeNeeded>,
    pass_through: Arc<dyn PassThrough>,
}

enum Route {
    Stream(ResourceKey),
    Profile(ResourceKey),
    Other,
}

impl RangeInterceptor {
    /// Create an interceptor and the receiver of its range announcements.
    pub fn new(
        config: InterceptConfig,
        pass_through: Arc<dyn PassThrough>,
    ) -> (Self, mpsc::UnboundedReceiver<RangeNeeded>) {
        let (needed, needed_rx) = mpsc::unbounded_channel();
        let interceptor = Self {
            inner: Arc::new(Inner {
                config,
                pending: DashMap::new(),
                held_profiles: DashMap::new(),
                cache: DashMap::new(),
                needed,
                pass_through,
            }),
        };
        (interceptor, needed_rx)
    }

    fn route(&self, path: &str) -> Route {
        let config = &self.inner.config;
        if let Some(rest) = path.strip_prefix(config.stream_prefix.as_str()) {
            if let Some(key) = ResourceKey::from_path(rest) {
                return Route::Stream(key);
            }
        }
        if let Some(rest) = path.strip_prefix(config.profiles_prefix.as_str()) {
            if let Some(key) = ResourceKey::from_path(rest) {
                return Route::Profile(key);
            }
        }
        Route::Other
    }

    /// Answer one request.
    pub async fn handle(&self, request: Request) -> Response {
        match self.route(request.uri().path()) {
            Route::Stream(key) => {
                let range = request
                    .headers()
                    .get(header::RANGE)
                    .and_then(|h| h.to_str().ok())
                    .map(parse_range_header);
                match range {
                    Some(None) => range_not_satisfiable(),
                    Some(Some((start, end))) => self.stream(key, start, end).await,
                    None => self.stream(key, 0, None).await,
                }
            }
            Route::Profile(key) => self.profile(key).await,
            Route::Other => self.inner.pass_through.forward(request).await,
        }
    }

    async fn stream(&self, key: ResourceKey, start: u64, end: Option<u64>) -> Response {
        let align = self.inner.config.align;
        let offset = start / align * align;
        let limit = match end {
            Some(end) => end.saturating_add(1) - offset,
            None => align,
        };

        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.inner.pending.entry(key.clone()).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            tracing::debug!(key = %key, offset, limit, "Range needed");
            let announcement = RangeNeeded {
                key: key.clone(),
                offset,
                limit,
            };
            if self.inner.needed.send(announcement).is_err() {
                tracing::warn!(key = %key, "No range provider attached");
            }
        } else {
            tracing::trace!(key = %key, start, "Joining pending range request");
        }

        let reply = match self.inner.config.pending_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.prune(&key);
                    tracing::warn!(key = %key, start, "Range request timed out");
                    return StatusCode::GATEWAY_TIMEOUT.into_response();
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(range)) => range.to_response(),
            Ok(Err(status)) => status.into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }

    async fn profile(&self, key: ResourceKey) -> Response {
        if let Some(cached) = self.cached(&key) {
            return cached.to_response();
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .held_profiles
            .entry(key.clone())
            .or_default()
            .push(tx);
        tracing::debug!(key = %key, "Holding profile request");

        let released = match self.inner.config.pending_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.is_ok(),
            None => rx.await.is_ok(),
        };
        if !released {
            self.prune_profiles(&key);
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }

        match self.cached(&key) {
            Some(cached) => cached.to_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    /// Deliver data for `done.key` to every held request, in arrival order.
    ///
    /// Returns the number of requests answered.
    pub fn complete(&self, done: RangeCompleted) -> usize {
        let range = Arc::new(CachedRange {
            offset: done.offset,
            end: done.end,
            total: done.total,
            content_type: "video/mp4",
            data: done.data,
            partial: true,
        });
        self.inner.cache.insert(done.key.clone(), Arc::clone(&range));

        let released = self.release(&done.key, Ok(range));
        tracing::debug!(key = %done.key, offset = done.offset, end = done.end, released, "Range completed");
        released
    }

    /// Answer every held request for `key` with an error status.
    pub fn fail(&self, key: &ResourceKey, status: StatusCode) -> usize {
        let released = self.release(key, Err(status));
        tracing::debug!(key = %key, %status, released, "Range failed");
        released
    }

    fn release(&self, key: &ResourceKey, reply: Result<Arc<CachedRange>, StatusCode>) -> usize {
        let Some((_, waiters)) = self.inner.pending.remove(key) else {
            return 0;
        };
        waiters
            .into_iter()
            .map(|w| w.send(reply.clone()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    /// Cache a whole resource, e.g. a profile photo.
    pub fn cache_resource(&self, key: ResourceKey, data: Bytes, content_type: &'static str) {
        let len = data.len() as u64;
        self.inner.cache.insert(
            key,
            Arc::new(CachedRange {
                offset: 0,
                end: len,
                total: Some(len),
                content_type,
                data,
                partial: false,
            }),
        );
    }

    /// Release held profile requests for `key`; they re-check the cache.
    pub fn profile_completed(&self, key: &ResourceKey) -> usize {
        let Some((_, waiters)) = self.inner.held_profiles.remove(key) else {
            return 0;
        };
        waiters
            .into_iter()
            .map(|w| w.send(()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    pub fn cached(&self, key: &ResourceKey) -> Option<Arc<CachedRange>> {
        self.inner.cache.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn evict(&self, key: &ResourceKey) -> bool {
        self.inner.cache.remove(key).is_some()
    }

    /// Number of streaming requests currently held for `key`.
    pub fn pending_count(&self, key: &ResourceKey) -> usize {
        self.inner
            .pending
            .get(key)
            .map(|w| w.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    fn prune(&self, key: &ResourceKey) {
        prune_closed(&self.inner.pending, key, |w| w.is_closed());
    }

    fn prune_profiles(&self, key: &ResourceKey) {
        prune_closed(&self.inner.held_profiles, key, |w| w.is_closed());
    }
}

/// Drop closed senders for `key` and the entry itself once empty.
fn prune_closed<T>(map: &DashMap<ResourceKey, Vec<T>>, key: &ResourceKey, closed: impl Fn(&T) -> bool) {
    if let Some(mut waiters) = map.get_mut(key) {
        waiters.retain(|w| !closed(w));
    }
    map.remove_if(key, |_, waiters| waiters.is_empty());
}

/// Parse a `Range` header into a start offset and optional inclusive end.
///
/// Supports `bytes=500-999` and `bytes=500-`. Suffix ranges need the total
/// size, which is not known here, and are rejected.
fn parse_range_header(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.trim().strip_prefix("bytes=")?;
    // Only the first of several ranges is honored.
    let spec = spec.split(',').next()?;
    let (start, end) = spec.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        return Some((start, None));
    }
    let end: u64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, Some(end)))
}

fn range_not_satisfiable() -> Response {
    let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response
}

/// Router that sends every request through the interceptor.
pub fn router(interceptor: RangeInterceptor) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(intercept)
        .with_state(interceptor)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn intercept(State(interceptor): State<RangeInterceptor>, request: Request) -> Response {
    interceptor.handle(request).await
}
