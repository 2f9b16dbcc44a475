//! Answers range announcements from a [`RangeSource`].

use std::sync::Arc;

use axum::http::StatusCode;
use dashmap::DashMap;
use mediaferry_common::{Error, ResourceKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::intercept::{RangeCompleted, RangeInterceptor, RangeNeeded};
use super::source::{FetchOptions, FileRangeSource, HttpRangeSource, RangeSource};

/// Maps a resource key to a location the source understands.
pub type Locator = Arc<dyn Fn(&ResourceKey) -> String + Send + Sync>;

/// Fetches announced ranges and completes them on the interceptor.
#[derive(Clone)]
pub struct RangeBroker {
    interceptor: RangeInterceptor,
    source: Arc<dyn RangeSource>,
    locate: Locator,
    options: FetchOptions,
    totals: Arc<DashMap<ResourceKey, Option<u64>>>,
}

impl RangeBroker {
    /// Keys are passed to `source` unchanged.
    pub fn new(interceptor: RangeInterceptor, source: Arc<dyn RangeSource>) -> Self {
        Self {
            interceptor,
            source,
            locate: Arc::new(|key: &ResourceKey| key.as_str().to_string()),
            options: FetchOptions::default(),
            totals: Arc::new(DashMap::new()),
        }
    }

    /// Build a broker for a configured source: an http(s) base URL or a
    /// directory. `None` reads from the working directory.
    pub fn for_source(interceptor: RangeInterceptor, source: Option<&str>) -> Self {
        match source {
            Some(base) if base.starts_with("http://") || base.starts_with("https://") => {
                let base = base.trim_end_matches('/').to_string();
                Self::new(interceptor, Arc::new(HttpRangeSource::new()))
                    .with_locator(move |key| format!("{}/{}", base, key))
            }
            Some(root) => Self::new(interceptor, Arc::new(FileRangeSource::with_root(root))),
            None => Self::new(interceptor, Arc::new(FileRangeSource::with_root("."))),
        }
    }

    pub fn with_locator<F>(mut self, locate: F) -> Self
    where
        F: Fn(&ResourceKey) -> String + Send + Sync + 'static,
    {
        self.locate = Arc::new(locate);
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve announcements in the background until the channel closes.
    pub fn spawn(self, needed: mpsc::UnboundedReceiver<RangeNeeded>) -> JoinHandle<()> {
        tokio::spawn(self.run(needed))
    }

    /// Serve announcements until the channel closes. Each one is fetched on
    /// its own task.
    pub async fn run(self, mut needed: mpsc::UnboundedReceiver<RangeNeeded>) {
        while let Some(request) = needed.recv().await {
            let broker = self.clone();
            tokio::spawn(async move {
                broker.resolve(request).await;
            });
        }
        tracing::debug!("Range broker stopped");
    }

    /// Fetch one announced range and answer its waiters.
    ///
    /// Returns the number of requests answered.
    pub async fn resolve(&self, needed: RangeNeeded) -> usize {
        let RangeNeeded { key, offset, limit } = needed;
        let location = (self.locate)(&key);

        let data = match self
            .source
            .get_part(&location, offset, limit, &self.options)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(key = %key, location = %location, offset, error = %e, "Range fetch failed");
                let status = match e {
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                return self.interceptor.fail(&key, status);
            }
        };
        if data.is_empty() {
            return self
                .interceptor
                .fail(&key, StatusCode::RANGE_NOT_SATISFIABLE);
        }

        let total = self.total_size(&key, &location).await;
        let end = offset + data.len() as u64;
        self.interceptor.complete(RangeCompleted {
            key,
            offset,
            end,
            total,
            data,
        })
    }

    async fn total_size(&self, key: &ResourceKey, location: &str) -> Option<u64> {
        if let Some(known) = self.totals.get(key) {
            return *known;
        }
        let total = self
            .source
            .total_size(location, &self.options)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(key = %key, error = %e, "Total size unavailable");
                None
            });
        self.totals.insert(key.clone(), total);
        total
    }
}
