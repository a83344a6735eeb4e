//! icelink - Trickle-ICE session establishment over an HTTP signaling exchange
//!
//! This library exchanges ICE credentials and candidates between two
//! endpoints, drives an ICE agent to a connected session, and exercises the
//! session with a keep-alive message loop.

pub mod network;
pub mod protocol;

pub use network::{MessageLoop, Orchestrator};
pub use protocol::{CandidateDescriptor, Credential, ExchangeMessage};
