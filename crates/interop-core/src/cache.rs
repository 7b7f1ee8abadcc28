//! Small cache/map primitives.

pub use ahash::{AHashMap, AHashSet};

/// Generic cache store, keyed the way the rest of the engine keys things (queue names, rule
/// names, schema ids).
pub type EngineCache<K, V> = AHashMap<K, V>;
