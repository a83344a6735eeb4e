//! Network module for P2P session establishment
//!
//! Handles the signaling exchange, the ICE agent adapter, the establishment
//! state machine and the post-establishment message loop.

mod agent;
mod config;
mod error;
mod message_loop;
mod orchestrator;
mod signaling;

pub use agent::{
    ConnectionStatus, ConnectivityEngine, EngineEvent, EngineEvents, IceAgent, SessionStream,
};
pub use config::{
    AgentSettings, CandidatePolicy, ExchangeConfig, MessageLoopConfig, NetworkKind,
    OrchestratorConfig, RetryPolicy, Role, DEFAULT_SIGNALING_PORT, DEFAULT_STUN_SERVERS,
};
pub use error::{NetworkError, SignalingError, Step};
pub use message_loop::{random_payload, LoopEvent, MessageLoop};
pub use orchestrator::{EstablishedSession, Orchestrator, RelayProgress, State};
pub use signaling::{SignalingClient, SignalingServer};
