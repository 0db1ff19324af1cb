//! Mutation envelopes and response correlation.

use crate::error::{ClientError, ClientResult};
use ripple_codec::Value;
use ripple_sync_protocol::{ClientMessage, MutationId, MutationRequest, MutationResponse};
use tokio::sync::oneshot;

/// Builds outbound mutation envelopes.
///
/// Pure construction: identifier allocation and transmission belong to the
/// client.
#[derive(Debug, Default)]
pub struct MutationDispatcher;

impl MutationDispatcher {
    /// Creates a dispatcher.
    pub fn new() -> Self {
        Self
    }

    /// Builds the envelope for one mutation.
    pub fn request(
        &self,
        udf_path: &str,
        args: Vec<Value>,
        mutation_id: MutationId,
    ) -> ClientMessage {
        ClientMessage::Mutation(MutationRequest {
            mutation_id,
            udf_path: udf_path.to_string(),
            args,
        })
    }
}

/// Completion report of a mutation, mirroring the wire response.
///
/// A failed mutation is data: `success` is false and `result` carries the
/// server's error detail.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Whether the mutation was applied.
    pub success: bool,
    /// Return value on success, error detail on failure.
    pub result: Option<Value>,
    /// Server-side log output, if any.
    pub log_lines: Vec<String>,
}

impl From<MutationResponse> for MutationOutcome {
    fn from(response: MutationResponse) -> Self {
        Self {
            success: response.success,
            result: response.result,
            log_lines: response.log_lines,
        }
    }
}

/// Caller-visible completion signal for one mutation.
///
/// Resolved when the server's response with the matching identifier
/// arrives. Dropping the handle makes the mutation fire-and-forget.
pub struct PendingMutation {
    mutation_id: MutationId,
    receiver: oneshot::Receiver<MutationOutcome>,
}

impl PendingMutation {
    pub(crate) fn new(mutation_id: MutationId, receiver: oneshot::Receiver<MutationOutcome>) -> Self {
        Self {
            mutation_id,
            receiver,
        }
    }

    /// The identifier this mutation was sent under.
    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    /// Waits for the server's response.
    ///
    /// Fails with [`ClientError::Closed`] if the connection ends before the
    /// response arrives.
    pub async fn outcome(self) -> ClientResult<MutationOutcome> {
        self.receiver.await.map_err(|_| ClientError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_the_wire_envelope() {
        let dispatcher = MutationDispatcher::new();
        let message = dispatcher.request("incrementCounter", vec![Value::Integer(1)], 3);
        assert_eq!(
            message,
            ClientMessage::Mutation(MutationRequest {
                mutation_id: 3,
                udf_path: "incrementCounter".to_string(),
                args: vec![Value::Integer(1)],
            })
        );
    }

    #[tokio::test]
    async fn pending_mutation_resolves_with_outcome() {
        let (sender, receiver) = oneshot::channel();
        let pending = PendingMutation::new(7, receiver);
        assert_eq!(pending.mutation_id(), 7);

        sender
            .send(MutationOutcome {
                success: true,
                result: Some(Value::Integer(1)),
                log_lines: vec![],
            })
            .unwrap();

        let outcome = pending.outcome().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(Value::Integer(1)));
    }

    #[tokio::test]
    async fn pending_mutation_fails_when_sender_dropped() {
        let (sender, receiver) = oneshot::channel::<MutationOutcome>();
        let pending = PendingMutation::new(0, receiver);
        drop(sender);

        assert!(matches!(pending.outcome().await, Err(ClientError::Closed)));
    }
}
