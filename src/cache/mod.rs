//! Client-side query cache and the routing table that invalidates it.

mod key;
mod query_cache;
mod router;

pub use key::NamespaceKey;
pub use query_cache::{CacheChange, CacheEntry, QueryCache, QueryWatch};
pub use router::{kind_matches, InvalidationRouter};
