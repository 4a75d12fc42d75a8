//! Single-flight image pulls.
//!
//! The first caller for a `(backend, image)` key runs the pull; everyone who
//! arrives while it is in flight awaits the same shared future and receives
//! the same outcome. The entry removes itself when the pull finishes, so a
//! later call pulls again. Failures are not retried here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::core::SchedulerError;
use crate::util::serde::BackendKind;

type PullKey = (BackendKind, String);
type InflightPull = Shared<BoxFuture<'static, Result<(), SchedulerError>>>;

/// Per-process map of in-flight pulls.
#[derive(Clone)]
pub struct ImagePullLock {
    enabled: bool,
    inflight: Arc<Mutex<HashMap<PullKey, InflightPull>>>,
}

impl ImagePullLock {
    /// New lock. A disabled lock runs every pull directly.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether deduplication is on.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pulls currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `pull` for `image` on `backend`, or join the pull already running.
    pub async fn run<F, Fut>(&self, backend: BackendKind, image: &str, pull: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SchedulerError>> + Send + 'static,
    {
        if !self.enabled {
            return pull().await;
        }

        let key = (backend, image.to_owned());
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                tracing::debug!(%backend, image, "joining in-flight image pull");
                existing.clone()
            } else {
                tracing::debug!(%backend, image, "starting image pull");
                let map = Arc::clone(&self.inflight);
                let entry_key = key.clone();
                let fut = pull();
                let shared = async move {
                    let outcome = fut.await;
                    map.lock().remove(&entry_key);
                    outcome
                }
                .boxed()
                .shared();
                inflight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }
}

impl Default for ImagePullLock {
    fn default() -> Self {
        Self::new(true)
    }
}
