//! Result projection: token-keyed snapshots and change detection.

use crate::cache::QueryResult;
use crate::error::{ClientError, ClientResult};
use crate::registry::QueryToken;
use ripple_codec::Value;
use std::collections::HashMap;

/// A query's definition together with its latest result.
///
/// `result` is `None` while the query is still awaiting its first
/// transition.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Latest result, if any has arrived.
    pub result: Option<QueryResult>,
    /// Identifying name of the server-side function.
    pub udf_path: String,
    /// Canonicalized arguments.
    pub args: Vec<Value>,
}

/// Diffs successive token-keyed snapshots to find the queries whose
/// observed result actually changed.
#[derive(Default)]
pub struct ResultProjector {
    snapshot: HashMap<QueryToken, QuerySnapshot>,
}

impl ResultProjector {
    /// Creates an empty projector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored snapshot wholesale and returns the tokens that
    /// are new or whose result differs by value. Each changed token is
    /// emitted at most once; order is unspecified.
    pub fn ingest(&mut self, snapshot: HashMap<QueryToken, QuerySnapshot>) -> Vec<QueryToken> {
        let previous = std::mem::replace(&mut self.snapshot, snapshot);

        let mut changed = Vec::new();
        for (token, query) in &self.snapshot {
            match previous.get(token) {
                Some(old) if old.result == query.result => {}
                _ => changed.push(token.clone()),
            }
        }
        changed
    }

    /// The current projected value of a token.
    ///
    /// Returns `Ok(None)` while the query is pending its first transition
    /// or unknown. A failed result is surfaced as a typed error: reading a
    /// failed query is a logic condition the consumer must handle, not a
    /// normal absence.
    pub fn value_of(&self, token: &QueryToken) -> ClientResult<Option<Value>> {
        let Some(query) = self.snapshot.get(token) else {
            return Ok(None);
        };
        match &query.result {
            None => Ok(None),
            Some(QueryResult::Success(value)) => Ok(Some(value.clone())),
            Some(QueryResult::Failure(message)) => Err(ClientError::QueryFailed {
                message: message.clone(),
            }),
        }
    }

    /// The full snapshot entry for a token.
    pub fn snapshot_of(&self, token: &QueryToken) -> Option<&QuerySnapshot> {
        self.snapshot.get(token)
    }
}
