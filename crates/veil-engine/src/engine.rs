//! Shared engine state: configuration plus the identity set, swapped whole.
//!
//! Readers take an `Arc` snapshot and keep using it for the rest of their
//! work; writers build a complete new [`EngineState`] and publish it through a
//! `watch` channel. Nothing is ever patched in place, so an in-flight match
//! always sees one consistent pairing of thresholds and identities.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use veil_core::{IdentitySet, ReferenceIdentity};

use crate::config::{Config, ConfigError};

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference storage unavailable: {0}")]
    Unavailable(String),
    #[error("malformed reference data: {0}")]
    Malformed(String),
}

/// Reference-storage collaborator: the source of enrolled embeddings.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ReferenceIdentity>, ReferenceError>;
}

/// One immutable snapshot of everything matching depends on.
#[derive(Debug)]
pub struct EngineState {
    pub config: Config,
    pub identities: IdentitySet,
}

impl EngineState {
    pub fn build(config: Config, references: Vec<ReferenceIdentity>) -> Self {
        let identities = IdentitySet::build(references, &config.threshold_params());
        Self { config, identities }
    }
}

/// Owner of the current [`EngineState`]. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    state: Arc<watch::Sender<Arc<EngineState>>>,
}

impl Engine {
    pub fn new(config: Config, references: Vec<ReferenceIdentity>) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = EngineState::build(config, references);
        tracing::info!(identities = state.identities.len(), "engine state initialised");
        let (tx, _rx) = watch::channel(Arc::new(state));
        Ok(Self { state: Arc::new(tx) })
    }

    /// The current state. Holders keep a consistent view even if the state is
    /// replaced while they work.
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.state.borrow().clone()
    }

    /// Receive every future state replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineState>> {
        self.state.subscribe()
    }

    /// Rebuild the identity set from fresh reference data.
    pub fn replace_references(&self, references: Vec<ReferenceIdentity>) {
        self.state.send_modify(|current| {
            let next = EngineState::build(current.config.clone(), references);
            tracing::info!(identities = next.identities.len(), "identity set replaced");
            *current = Arc::new(next);
        });
    }

    /// Pull reference data from storage and swap it in. Returns the number of
    /// identities that take part in matching.
    pub async fn reload_references(&self, store: &dyn ReferenceStore) -> Result<usize, ReferenceError> {
        let references = store.load().await?;
        self.replace_references(references);
        Ok(self.snapshot().identities.len())
    }

    /// Replace the configuration. Every identity's threshold is recomputed
    /// immediately, whatever changed.
    pub fn replace_config(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.state.send_modify(|current| {
            if current.config.thresholds_changed(&config) {
                tracing::info!(
                    base_threshold = config.base_threshold,
                    adaptive = config.use_adaptive_thresholds,
                    "threshold settings changed; recomputing all identities"
                );
            }
            let identities = current.identities.rethreshold(&config.threshold_params());
            *current = Arc::new(EngineState { config, identities });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::Embedding;

    fn references() -> Vec<ReferenceIdentity> {
        vec![ReferenceIdentity {
            label: "a".into(),
            embeddings: vec![Embedding::new(vec![0.0, 0.0]), Embedding::new(vec![0.1, 0.0])],
        }]
    }

    struct FixedStore(Vec<ReferenceIdentity>);

    #[async_trait]
    impl ReferenceStore for FixedStore {
        async fn load(&self) -> Result<Vec<ReferenceIdentity>, ReferenceError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ReferenceStore for BrokenStore {
        async fn load(&self) -> Result<Vec<ReferenceIdentity>, ReferenceError> {
            Err(ReferenceError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let engine = Engine::new(Config::default(), references()).unwrap();
        let before = engine.snapshot();
        engine.replace_references(vec![]);
        assert_eq!(before.identities.len(), 1);
        assert!(engine.snapshot().identities.is_empty());
    }

    #[test]
    fn test_config_change_recomputes_thresholds() {
        let engine = Engine::new(Config::default(), references()).unwrap();
        let old = engine.snapshot().identities.get("a").unwrap().threshold().value;

        let mut config = Config::default();
        config.base_threshold = 0.5;
        engine.replace_config(config).unwrap();

        let state = engine.snapshot();
        let new = state.identities.get("a").unwrap().threshold();
        assert_eq!(new.base_threshold, 0.5);
        assert!(new.value < old);
    }

    #[test]
    fn test_invalid_config_leaves_state_untouched() {
        let engine = Engine::new(Config::default(), references()).unwrap();
        let mut config = Config::default();
        config.concurrency_limit = 0;
        assert!(engine.replace_config(config).is_err());
        assert_eq!(engine.snapshot().config.concurrency_limit, 8);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config {
            min_threshold: 0.9,
            max_threshold: 0.5,
            ..Config::default()
        };
        assert!(matches!(Engine::new(config, references()), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let engine = Engine::new(Config::default(), vec![]).unwrap();
        let mut rx = engine.subscribe();
        let count = engine.reload_references(&FixedStore(references())).await.unwrap();
        assert_eq!(count, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().identities.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_identities() {
        let engine = Engine::new(Config::default(), references()).unwrap();
        assert!(engine.reload_references(&BrokenStore).await.is_err());
        assert_eq!(engine.snapshot().identities.len(), 1);
    }
}
