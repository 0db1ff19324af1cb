//! Remote result cache: the client's view of server-computed results.

use crate::error::{ClientError, ClientResult};
use ripple_codec::Value;
use ripple_sync_protocol::{QueryChange, QueryId, StateVersion, Transition};
use std::collections::HashMap;
use tracing::debug;

/// The latest server-computed result of one query: a value or a
/// server-reported failure, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// The query produced a value.
    Success(Value),
    /// The query failed with a server-reported message.
    Failure(String),
}

impl QueryResult {
    /// True if this result carries a value.
    pub fn is_success(&self) -> bool {
        matches!(self, QueryResult::Success(_))
    }

    /// The carried value, if successful.
    pub fn value(&self) -> Option<&Value> {
        match self {
            QueryResult::Success(value) => Some(value),
            QueryResult::Failure(_) => None,
        }
    }

    /// The server-reported error message, if failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            QueryResult::Success(_) => None,
            QueryResult::Failure(message) => Some(message),
        }
    }
}

/// Applies server transitions to an id-keyed result map and tracks the
/// server's acknowledged version.
pub struct RemoteQueryCache {
    version: StateVersion,
    results: HashMap<QueryId, QueryResult>,
}

impl RemoteQueryCache {
    /// Creates an empty cache at the initial version.
    pub fn new() -> Self {
        Self {
            version: StateVersion::initial(),
            results: HashMap::new(),
        }
    }

    /// The last applied version.
    pub fn version(&self) -> &StateVersion {
        &self.version
    }

    /// Applies one transition's deltas.
    ///
    /// The transition must start at the version this cache currently holds;
    /// anything else means the client and server have diverged, and the
    /// transition is rejected without applying any of its deltas.
    pub fn transition(&mut self, transition: &Transition) -> ClientResult<()> {
        if transition.start_version != self.version {
            return Err(ClientError::Protocol(format!(
                "transition starts at version {:?} but cache is at {:?}",
                transition.start_version, self.version
            )));
        }

        for change in &transition.modifications {
            match change {
                QueryChange::QueryUpdated {
                    query_id, value, ..
                } => {
                    self.results
                        .insert(*query_id, QueryResult::Success(value.clone()));
                }
                QueryChange::QueryFailed {
                    query_id,
                    error_message,
                } => {
                    self.results
                        .insert(*query_id, QueryResult::Failure(error_message.clone()));
                }
                QueryChange::QueryRemoved { query_id } => {
                    self.results.remove(query_id);
                }
            }
        }

        self.version = transition.end_version.clone();
        debug!(
            query_set = self.version.query_set,
            results = self.results.len(),
            "transition applied"
        );
        Ok(())
    }

    /// Evicts one query's result, e.g. after a local unsubscribe.
    pub fn remove(&mut self, id: QueryId) -> Option<QueryResult> {
        self.results.remove(&id)
    }

    /// Drops all results and restarts at the initial version, for a fresh
    /// connection epoch.
    pub fn reset(&mut self) {
        self.version = StateVersion::initial();
        self.results.clear();
    }

    /// The result of one query, if any has arrived.
    pub fn get(&self, id: QueryId) -> Option<&QueryResult> {
        self.results.get(&id)
    }

    /// Iterates over all cached results.
    pub fn entries(&self) -> impl Iterator<Item = (QueryId, &QueryResult)> + '_ {
        self.results.iter().map(|(id, result)| (*id, result))
    }

    /// Iterates over the ids with cached results.
    pub fn ids(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.results.keys().copied()
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True if no results are cached.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Default for RemoteQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(
        start: StateVersion,
        end: StateVersion,
        modifications: Vec<QueryChange>,
    ) -> Transition {
        Transition {
            start_version: start,
            end_version: end,
            modifications,
        }
    }

    #[test]
    fn applies_updates_failures_and_removals() {
        let mut cache = RemoteQueryCache::new();

        cache
            .transition(&transition(
                StateVersion::initial(),
                StateVersion::new(1, "10", 0),
                vec![
                    QueryChange::QueryUpdated {
                        query_id: 1,
                        value: Value::Integer(1),
                        log_lines: vec![],
                    },
                    QueryChange::QueryUpdated {
                        query_id: 2,
                        value: Value::Integer(2),
                        log_lines: vec![],
                    },
                    QueryChange::QueryUpdated {
                        query_id: 3,
                        value: Value::Integer(3),
                        log_lines: vec![],
                    },
                ],
            ))
            .unwrap();

        cache
            .transition(&transition(
                StateVersion::new(1, "10", 0),
                StateVersion::new(2, "11", 0),
                vec![
                    QueryChange::QueryUpdated {
                        query_id: 1,
                        value: Value::Integer(7),
                        log_lines: vec![],
                    },
                    QueryChange::QueryRemoved { query_id: 2 },
                ],
            ))
            .unwrap();

        assert_eq!(cache.get(1), Some(&QueryResult::Success(Value::Integer(7))));
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(3), Some(&QueryResult::Success(Value::Integer(3))));
        assert_eq!(cache.version(), &StateVersion::new(2, "11", 0));
    }

    #[test]
    fn failure_replaces_value() {
        let mut cache = RemoteQueryCache::new();
        cache
            .transition(&transition(
                StateVersion::initial(),
                StateVersion::new(1, "5", 0),
                vec![QueryChange::QueryFailed {
                    query_id: 0,
                    error_message: "index missing".to_string(),
                }],
            ))
            .unwrap();

        let result = cache.get(0).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.error_message(), Some("index missing"));
        assert_eq!(result.value(), None);
    }

    #[test]
    fn rejects_mismatched_start_version() {
        let mut cache = RemoteQueryCache::new();
        let skewed = transition(
            StateVersion::new(3, "9", 0),
            StateVersion::new(4, "10", 0),
            vec![QueryChange::QueryUpdated {
                query_id: 0,
                value: Value::Integer(1),
                log_lines: vec![],
            }],
        );

        assert!(matches!(
            cache.transition(&skewed),
            Err(ClientError::Protocol(_))
        ));
        // Nothing was applied.
        assert!(cache.is_empty());
        assert_eq!(cache.version(), &StateVersion::initial());
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut cache = RemoteQueryCache::new();
        cache
            .transition(&transition(
                StateVersion::initial(),
                StateVersion::new(1, "2", 0),
                vec![QueryChange::QueryUpdated {
                    query_id: 0,
                    value: Value::Integer(5),
                    log_lines: vec![],
                }],
            ))
            .unwrap();

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.version(), &StateVersion::initial());
    }
}
