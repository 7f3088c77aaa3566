//! Per-connection configuration.
//!
//! A `StorageOptions` value is consulted once, at construction; nothing in
//! the layer reads process-wide state.

use std::path::PathBuf;

use crate::backend::Mechanism;

/// Options accepted by [`Storage::open`](crate::Storage::open).
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Backend mechanisms to try, in order. The first supported one wins
    /// and the choice is final for the connection's lifetime.
    pub mechanisms: Vec<Mechanism>,
    /// Size hint forwarded to backends that accept one.
    pub size: Option<u64>,
    /// When true and the schema declares no stores, stores may be added at
    /// runtime without a version change.
    pub auto_schema: bool,
    /// Inject the reserved-name default text store.
    pub use_text_store: bool,
    /// Debug mode tightens the queue staleness threshold.
    pub debug: bool,
    /// Directory for the persistent key-value engine's snapshots.
    pub base_dir: Option<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            mechanisms: Mechanism::DEFAULT_ORDER.to_vec(),
            size: None,
            auto_schema: false,
            use_text_store: false,
            debug: false,
            base_dir: None,
        }
    }
}

impl StorageOptions {
    pub fn with_mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    pub fn with_text_store(mut self) -> Self {
        self.use_text_store = true;
        self
    }

    pub fn with_auto_schema(mut self) -> Self {
        self.auto_schema = true;
        self
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }
}
