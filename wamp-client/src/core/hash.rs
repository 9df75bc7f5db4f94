/// Hash map used for WAMP dictionaries and session bookkeeping.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Hash set used across the client.
pub type HashSet<V> = std::collections::HashSet<V, ahash::RandomState>;
