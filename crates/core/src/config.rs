//! Configuration loading and representation.

use crate::error::{CoordError, CoordResult};
use crate::keys::Namespace;

/// Connection and namespacing configuration for the coordination layer.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Store connection URL, e.g. `redis://localhost:6379`.
    pub redis_url: String,
    /// Key prefix isolating this deployment's state.
    pub namespace: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "latch".to_string(),
        }
    }
}

impl CoordConfig {
    /// Load from `LATCH_REDIS_URL` / `LATCH_NAMESPACE`, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> CoordResult<Self> {
        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("LATCH_REDIS_URL") {
            if url.trim().is_empty() {
                return Err(CoordError::invalid_config("LATCH_REDIS_URL is empty"));
            }
            cfg.redis_url = url;
        }
        if let Ok(ns) = std::env::var("LATCH_NAMESPACE") {
            if ns.trim().is_empty() || ns.contains(':') {
                return Err(CoordError::invalid_config(
                    "LATCH_NAMESPACE must be non-empty and contain no ':'",
                ));
            }
            cfg.namespace = ns;
        }

        Ok(cfg)
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.clone())
    }
}
