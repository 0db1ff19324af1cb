//! # Ripple Sync Protocol
//!
//! Wire protocol types and JSON codecs for ripple.
//!
//! This crate provides:
//! - Outbound client messages (`Connect`, `ModifyQuerySet`, `Mutation`)
//! - Inbound server messages (`Transition`, `MutationResponse`, `FatalError`)
//! - `StateVersion` generation markers
//! - JSON encoding/decoding
//!
//! Messages travel as JSON text frames tagged with a `"type"` discriminator.
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ClientMessage, MutationId, MutationRequest, MutationResponse, QueryChange, QueryId,
    QuerySetChange, QuerySetModification, ServerMessage, Transition,
};
pub use version::StateVersion;
