//! Named detector backends and their readiness.
//!
//! Model loading is slow and happens on the blocking pool, so a backend may be
//! requested before it exists. Each entry is a `watch` channel whose value
//! moves `Loading -> Ready | Failed` exactly once per load; `acquire` waits on
//! those channels with a single deadline shared by every requested name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use veil_core::{BackendError, DetectorBackend};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no requested backend is ready: {requested}")]
    Unavailable { requested: String },
    #[error("backend loading requires a Tokio runtime")]
    NoRuntime,
}

#[derive(Clone)]
pub enum BackendStatus {
    Loading,
    Ready(Arc<dyn DetectorBackend>),
    Failed(String),
}

impl BackendStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, BackendStatus::Loading)
    }
}

impl fmt::Debug for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Loading => f.write_str("Loading"),
            BackendStatus::Ready(backend) => write!(f, "Ready({})", backend.name()),
            BackendStatus::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    entries: Arc<Mutex<BTreeMap<String, watch::Sender<BackendStatus>>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, name: &str, status: BackendStatus) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(name) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                let (tx, _rx) = watch::channel(status);
                entries.insert(name.to_string(), tx);
            }
        }
    }

    /// Register a backend that is already usable.
    pub fn register_ready(&self, backend: Arc<dyn DetectorBackend>) {
        let name = backend.name().to_string();
        tracing::info!(backend = %name, "backend ready");
        self.set(&name, BackendStatus::Ready(backend));
    }

    /// Mark `name` as loading. Waiters block until [`Self::complete`] is called.
    pub fn mark_loading(&self, name: &str) {
        self.set(name, BackendStatus::Loading);
    }

    /// Settle a load started with [`Self::mark_loading`].
    pub fn complete(&self, name: &str, result: Result<Arc<dyn DetectorBackend>, BackendError>) {
        match result {
            Ok(backend) => {
                tracing::info!(backend = %name, "backend loaded");
                self.set(name, BackendStatus::Ready(backend));
            }
            Err(err) => {
                tracing::error!(backend = %name, error = %err, "backend failed to load");
                self.set(name, BackendStatus::Failed(err.to_string()));
            }
        }
    }

    /// Run `loader` on the blocking pool and publish its outcome under `name`.
    pub fn register_loading<F>(&self, name: &str, loader: F) -> Result<(), RegistryError>
    where
        F: FnOnce() -> Result<Arc<dyn DetectorBackend>, BackendError> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        self.mark_loading(name);

        let registry = self.clone();
        let name = name.to_string();
        runtime.spawn(async move {
            let result = match tokio::task::spawn_blocking(loader).await {
                Ok(result) => result,
                Err(join) => Err(BackendError::Failed {
                    name: name.clone(),
                    reason: format!("loader task aborted: {join}"),
                }),
            };
            registry.complete(&name, result);
        });
        Ok(())
    }

    pub fn status(&self, name: &str) -> Option<BackendStatus> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|tx| tx.borrow().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    /// Wait up to `timeout` for each requested backend to settle and return the
    /// ready ones in request order. Backends that are unknown, failed or still
    /// loading at the deadline are skipped with a warning.
    pub async fn acquire(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn DetectorBackend>>, RegistryError> {
        let deadline = Instant::now() + timeout;
        let mut ready = Vec::with_capacity(names.len());

        for name in names {
            let rx = {
                let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                entries.get(name).map(watch::Sender::subscribe)
            };
            let Some(mut rx) = rx else {
                tracing::warn!(backend = %name, "requested backend is not registered");
                continue;
            };

            let settled = match tokio::time::timeout_at(deadline, rx.wait_for(BackendStatus::is_settled)).await {
                Ok(Ok(status)) => Some(status.clone()),
                Ok(Err(_)) | Err(_) => None,
            };

            match settled {
                Some(BackendStatus::Ready(backend)) => ready.push(backend),
                Some(BackendStatus::Failed(reason)) => {
                    tracing::warn!(backend = %name, reason = %reason, "requested backend failed to load");
                }
                Some(BackendStatus::Loading) | None => {
                    tracing::warn!(backend = %name, timeout_ms = timeout.as_millis() as u64, "requested backend not ready in time");
                }
            }
        }

        if ready.is_empty() {
            return Err(RegistryError::Unavailable {
                requested: names.join(", "),
            });
        }
        Ok(ready)
    }
}
