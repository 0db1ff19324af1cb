//! Protocol messages.

use crate::error::ProtocolResult;
use crate::version::StateVersion;
use ripple_codec::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-local identifier of a subscribed query, assigned by the client
/// and echoed by the server. Never reused within a session.
pub type QueryId = u64;

/// Monotonically increasing identifier of an outbound mutation.
pub type MutationId = u64;

/// A message sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Session handshake. The only message that may be transmitted before
    /// the connection is fully open.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// Session identifier, fresh per client instance.
        session_id: Uuid,
        /// Number of previous connection attempts in this session.
        connection_count: u32,
    },
    /// A versioned delta to the set of subscribed queries.
    ModifyQuerySet(QuerySetModification),
    /// A fire-and-forget write request.
    Mutation(MutationRequest),
}

impl ClientMessage {
    /// Encodes this message to its JSON frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a client message from a JSON frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// True for handshake-class messages, which the transport may transmit
    /// while still connecting.
    pub fn is_handshake(&self) -> bool {
        matches!(self, ClientMessage::Connect { .. })
    }
}

/// A versioned change to the query set.
///
/// `new_version` is always `base_version + 1`; the server applies these
/// deltas strictly in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySetModification {
    /// Version the change applies on top of.
    pub base_version: u64,
    /// Version after the change.
    pub new_version: u64,
    /// The individual additions and removals.
    pub modifications: Vec<QuerySetChange>,
}

impl QuerySetModification {
    /// Creates a modification carrying a single change.
    pub fn single(base_version: u64, change: QuerySetChange) -> Self {
        Self {
            base_version,
            new_version: base_version + 1,
            modifications: vec![change],
        }
    }
}

/// One addition to or removal from the query set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuerySetChange {
    /// Subscribe the server to a query.
    #[serde(rename_all = "camelCase")]
    Add {
        /// Client-assigned query identifier.
        query_id: QueryId,
        /// Identifying name of the server-side function.
        udf_path: String,
        /// Canonicalized arguments.
        args: Vec<Value>,
    },
    /// Remove a query from the set.
    #[serde(rename_all = "camelCase")]
    Remove {
        /// Identifier of the query to remove.
        query_id: QueryId,
    },
}

/// An outbound mutation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Client-assigned mutation identifier, used for response correlation.
    pub mutation_id: MutationId,
    /// Identifying name of the server-side function.
    pub udf_path: String,
    /// Mutation arguments.
    pub args: Vec<Value>,
}

/// A message pushed from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A batch of query-result deltas moving the client from one query-set
    /// version to the next.
    Transition(Transition),
    /// Completion of a previously sent mutation.
    MutationResponse(MutationResponse),
    /// Unrecoverable server-reported failure; terminal for the connection.
    FatalError {
        /// Server-provided description.
        error: String,
    },
}

impl ServerMessage {
    /// Encodes this message to its JSON frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a server message from a JSON frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// A server-pushed batch of query-result deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Version the deltas apply on top of.
    pub start_version: StateVersion,
    /// Version after the deltas are applied.
    pub end_version: StateVersion,
    /// The individual result changes.
    pub modifications: Vec<QueryChange>,
}

/// One change to a single query's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryChange {
    /// The query produced a new value.
    #[serde(rename_all = "camelCase")]
    QueryUpdated {
        /// Affected query.
        query_id: QueryId,
        /// The new result value.
        value: Value,
        /// Server-side log output, if any.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        log_lines: Vec<String>,
    },
    /// The query failed on the server.
    #[serde(rename_all = "camelCase")]
    QueryFailed {
        /// Affected query.
        query_id: QueryId,
        /// Server-reported error message.
        error_message: String,
    },
    /// The query was removed from the set.
    #[serde(rename_all = "camelCase")]
    QueryRemoved {
        /// Affected query.
        query_id: QueryId,
    },
}

impl QueryChange {
    /// The query this change applies to.
    pub fn query_id(&self) -> QueryId {
        match self {
            QueryChange::QueryUpdated { query_id, .. }
            | QueryChange::QueryFailed { query_id, .. }
            | QueryChange::QueryRemoved { query_id } => *query_id,
        }
    }
}

/// Completion report for a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    /// The mutation this responds to.
    pub mutation_id: MutationId,
    /// Whether the mutation was applied.
    pub success: bool,
    /// Return value on success, error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Server-side log output, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_lines: Vec<String>,
}
