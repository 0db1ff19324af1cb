//! Subscription registry: deduplication, reference counts, query-set
//! versioning.

use crate::error::ClientResult;
use ripple_codec::{to_canonical_json, Value};
use ripple_sync_protocol::{QueryId, QuerySetChange, QuerySetModification};
use std::collections::HashMap;
use tracing::debug;

/// Deduplication key of a subscription.
///
/// Derived from the canonical serialization of the function path and
/// arguments, so two definitions serializing identically are the same
/// subscription. Stable for the registry's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryToken(String);

impl QueryToken {
    fn compute(udf_path: &str, args: &[Value]) -> ClientResult<Self> {
        let key = Value::map(vec![
            ("args".to_string(), Value::Array(args.to_vec())),
            ("udfPath".to_string(), Value::String(udf_path.to_string())),
        ]);
        Ok(Self(to_canonical_json(&key)?))
    }

    /// The canonical text this token is made of.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct LocalQuery {
    id: QueryId,
    udf_path: String,
    args: Vec<Value>,
    subscribers: usize,
}

/// Tracks the set of active subscriptions and the negotiated query-set
/// version.
///
/// Identifiers are monotonically increasing and never reused; the version
/// advances by exactly one per produced modification.
#[derive(Default)]
pub struct QueryRegistry {
    next_query_id: QueryId,
    version: u64,
    queries: HashMap<QueryToken, LocalQuery>,
    tokens_by_id: HashMap<QueryId, QueryToken>,
}

impl QueryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a query.
    ///
    /// Identical definitions share a token: only the first subscription to
    /// a definition allocates a [`QueryId`] and produces a protocol delta;
    /// later ones just raise the subscriber count.
    pub fn subscribe(
        &mut self,
        udf_path: &str,
        args: &[Value],
    ) -> ClientResult<(Option<QuerySetModification>, QueryToken)> {
        let token = QueryToken::compute(udf_path, args)?;

        if let Some(entry) = self.queries.get_mut(&token) {
            entry.subscribers += 1;
            debug!(
                query_id = entry.id,
                subscribers = entry.subscribers,
                "subscription reused"
            );
            return Ok((None, token));
        }

        let query_id = self.next_query_id;
        self.next_query_id += 1;

        let modification = QuerySetModification::single(
            self.version,
            QuerySetChange::Add {
                query_id,
                udf_path: udf_path.to_string(),
                args: args.to_vec(),
            },
        );
        self.version = modification.new_version;

        self.queries.insert(
            token.clone(),
            LocalQuery {
                id: query_id,
                udf_path: udf_path.to_string(),
                args: args.to_vec(),
                subscribers: 1,
            },
        );
        self.tokens_by_id.insert(query_id, token.clone());
        debug!(query_id, udf_path, version = self.version, "query added");

        Ok((Some(modification), token))
    }

    /// Drops one subscriber from a query.
    ///
    /// When the last subscriber leaves, the token/id mappings are released
    /// and a removal delta is produced. The freed [`QueryId`] is never
    /// reused.
    pub fn unsubscribe(&mut self, token: &QueryToken) -> Option<QuerySetModification> {
        let entry = self.queries.get_mut(token)?;
        entry.subscribers -= 1;
        if entry.subscribers > 0 {
            debug!(
                query_id = entry.id,
                subscribers = entry.subscribers,
                "subscriber dropped"
            );
            return None;
        }

        let query_id = entry.id;
        self.queries.remove(token);
        self.tokens_by_id.remove(&query_id);

        let modification =
            QuerySetModification::single(self.version, QuerySetChange::Remove { query_id });
        self.version = modification.new_version;
        debug!(query_id, version = self.version, "query removed");

        Some(modification)
    }

    /// Token of a query, by server-facing identifier.
    pub fn token_for(&self, id: QueryId) -> Option<&QueryToken> {
        self.tokens_by_id.get(&id)
    }

    /// Function path of a query, by identifier.
    pub fn path_for(&self, id: QueryId) -> Option<&str> {
        let token = self.tokens_by_id.get(&id)?;
        self.queries.get(token).map(|q| q.udf_path.as_str())
    }

    /// Arguments of a query, by identifier.
    pub fn args_for(&self, id: QueryId) -> Option<&[Value]> {
        let token = self.tokens_by_id.get(&id)?;
        self.queries.get(token).map(|q| q.args.as_slice())
    }

    /// Whether the registry currently knows this identifier.
    pub fn contains_id(&self, id: QueryId) -> bool {
        self.tokens_by_id.contains_key(&id)
    }

    /// Number of subscribers on a token; zero if unknown.
    pub fn subscriber_count(&self, token: &QueryToken) -> usize {
        self.queries.get(token).map_or(0, |q| q.subscribers)
    }

    /// Current query-set version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of distinct active queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// True if no queries are active.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Rebases the registry for a fresh connection epoch.
    ///
    /// The version space restarts at zero and one modification re-adding
    /// every live query is produced, so a new connection can rebuild the
    /// server-side query set in a single step. Tokens and identifiers stay
    /// stable across epochs.
    pub fn rebase_for_reconnect(&mut self) -> Option<QuerySetModification> {
        self.version = 0;
        if self.queries.is_empty() {
            return None;
        }

        let mut changes: Vec<QuerySetChange> = self
            .queries
            .values()
            .map(|query| QuerySetChange::Add {
                query_id: query.id,
                udf_path: query.udf_path.clone(),
                args: query.args.clone(),
            })
            .collect();
        changes.sort_by_key(|change| match change {
            QuerySetChange::Add { query_id, .. } | QuerySetChange::Remove { query_id } => *query_id,
        });

        self.version = 1;
        debug!(queries = changes.len(), "query set rebased for reconnect");
        Some(QuerySetModification {
            base_version: 0,
            new_version: 1,
            modifications: changes,
        })
    }
}
