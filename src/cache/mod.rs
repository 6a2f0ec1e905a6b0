//! Decision and answer caches.

mod answer;
mod expiring;

pub use answer::{AnswerCache, PersistError, QueryKey};
pub use expiring::{Cache, ExpiringCache, Ttl};

/// Sink verdicts keyed by normalized domain name.
pub type DecisionCache = ExpiringCache<String, bool>;
