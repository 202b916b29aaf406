//! Cache key definitions.
//!
//! Keys are scoped by a namespace so unrelated consumers can share one
//! coordinator without colliding. Dependency tags name a class of underlying
//! data (an entity class such as `purchase_orders`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dependency tag naming a class of underlying data.
pub type Tag = String;

/// Namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Returns true if this key lives in `namespace`.
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.namespace == namespace
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}
