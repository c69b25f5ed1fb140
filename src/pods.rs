//! Per-cluster app pod cache
//!
//! Caches the `app` label -> pod-name mapping for one cluster. The cache is
//! refreshed only when it is empty; the test population is static enough
//! that no further invalidation is needed. Every read and write goes
//! through a copy so callers can never alias or mutate the cached map.

use std::collections::HashMap;

use tokio::sync::Mutex;

/// Pod-name lists keyed by `app` label value.
pub type AppPods = HashMap<String, Vec<String>>;

/// Lazily-populated pod index for one cluster.
#[derive(Debug, Default)]
pub struct PodIndex {
    pods: Mutex<AppPods>,
}

impl PodIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the cached mapping; empty if never populated.
    pub async fn snapshot(&self) -> AppPods {
        self.pods.lock().await.clone()
    }

    /// Store a copy of `pods` as the new cache contents.
    pub async fn replace(&self, pods: &AppPods) {
        *self.pods.lock().await = pods.clone();
    }
}
