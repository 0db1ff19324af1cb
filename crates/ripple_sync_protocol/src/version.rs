//! Server state generation markers.

use serde::{Deserialize, Serialize};

/// A server-reported generation marker attached to each transition.
///
/// The `query_set` component tracks the client's query-set version the
/// server has acknowledged; `ts` and `identity` are opaque server-side
/// generation coordinates echoed back as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVersion {
    /// Acknowledged query-set version.
    pub query_set: u64,
    /// Server timestamp, opaque to the client.
    pub ts: String,
    /// Identity generation, opaque to the client.
    pub identity: u64,
}

impl StateVersion {
    /// Creates a state version.
    pub fn new(query_set: u64, ts: impl Into<String>, identity: u64) -> Self {
        Self {
            query_set,
            ts: ts.into(),
            identity,
        }
    }

    /// The initial version, before any transition has been applied.
    pub fn initial() -> Self {
        Self::new(0, "0", 0)
    }
}

impl Default for StateVersion {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_version() {
        let version = StateVersion::initial();
        assert_eq!(version.query_set, 0);
        assert_eq!(version.ts, "0");
        assert_eq!(version.identity, 0);
        assert_eq!(version, StateVersion::default());
    }

    #[test]
    fn wire_shape() {
        let version = StateVersion::new(3, "17", 1);
        let text = serde_json::to_string(&version).unwrap();
        assert_eq!(text, r#"{"querySet":3,"ts":"17","identity":1}"#);

        let decoded: StateVersion = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, version);
    }
}
