//! Durable references to external objects
//!
//! A script can hold a `Val::Handle(Pickle)`. Before a saved program is
//! restored, every pickle it holds is resolved again through the resolver
//! registered for its kind.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::script::Val;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pickle {
    pub kind: String,
    pub key: String,
}

impl Pickle {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Pickle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Re-creates the live object behind a pickle
#[async_trait]
pub trait PickleResolver: Send + Sync {
    async fn resolve(&self, pickle: &Pickle) -> anyhow::Result<Val>;
}

#[derive(Default, Clone)]
pub struct PickleRegistry {
    resolvers: BTreeMap<String, Arc<dyn PickleResolver>>,
}

impl PickleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, resolver: Arc<dyn PickleResolver>) {
        self.resolvers.insert(kind.into(), resolver);
    }

    /// Resolve all pickles concurrently
    ///
    /// `pending` always lists what is still outstanding, so thread dumps taken
    /// during a load can report it. Any failure, the timeout, or cancellation
    /// abandons the whole resolution.
    pub async fn resolve_all(
        &self,
        pickles: Vec<Pickle>,
        timeout: Duration,
        cancel: CancellationToken,
        pending: Arc<Mutex<Vec<Pickle>>>,
    ) -> EngineResult<BTreeMap<Pickle, Val>> {
        *pending.lock() = pickles.clone();

        let mut futures = FuturesUnordered::new();
        for pickle in pickles {
            let resolver = self.resolvers.get(&pickle.kind).cloned().ok_or_else(|| {
                EngineError::Pickle(pickle.to_string(), "no resolver for this kind".to_string())
            })?;
            futures.push(async move {
                let result = resolver.resolve(&pickle).await;
                (pickle, result)
            });
        }

        let resolve = async {
            let mut resolved = BTreeMap::new();
            while let Some((pickle, result)) = futures.next().await {
                let value =
                    result.map_err(|e| EngineError::Pickle(pickle.to_string(), e.to_string()))?;
                pending.lock().retain(|p| p != &pickle);
                tracing::debug!(pickle = %pickle, "Resolved pickle");
                resolved.insert(pickle, value);
            }
            Ok(resolved)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(timeout, resolve) => match outcome {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout("pickle resolution".to_string())),
            },
        }
    }
}
