//! ICE agent adapter
//!
//! Wraps a `webrtc-ice` agent behind the [`ConnectivityEngine`] trait. The
//! agent's candidate and state callbacks are turned into [`EngineEvent`]s on a
//! bounded channel, so the orchestrator consumes them like any other stream
//! instead of reacting inside closures. A full channel blocks the callback
//! rather than dropping events.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc_ice::agent::agent_config::AgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::Candidate;
use webrtc_ice::network_type::NetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::url::Url;
use webrtc_util::Conn;

use crate::protocol::{CandidateDescriptor, Credential};

use super::config::{AgentSettings, NetworkKind};
use super::error::{NetworkError, SignalingError, Step};

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Checking => "checking",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Completed => "completed",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Checking => ConnectionStatus::Checking,
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Completed => ConnectionStatus::Completed,
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Failed => ConnectionStatus::Failed,
            ConnectionState::Closed => ConnectionStatus::Closed,
            _ => ConnectionStatus::New,
        }
    }
}

/// Event surfaced by the engine, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(CandidateDescriptor),
    GatheringComplete,
    StateChanged(ConnectionStatus),
}

/// Receiving half of the engine event channel
pub type EngineEvents = mpsc::Receiver<EngineEvent>;

/// Established bidirectional byte stream
#[async_trait]
pub trait SessionStream: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;
    async fn close(&self) -> io::Result<()>;
}

/// Operations the orchestrator needs from a connectivity engine
#[async_trait]
pub trait ConnectivityEngine: Send + Sync + 'static {
    async fn local_credentials(&self) -> Result<Credential, NetworkError>;

    /// Trigger gathering; candidates arrive later as [`EngineEvent`]s
    fn gather_candidates(&self) -> Result<(), NetworkError>;

    /// Ingest one remote candidate; duplicates are accepted and ignored
    fn add_remote_candidate(&self, candidate: &CandidateDescriptor) -> Result<(), SignalingError>;

    /// Establish as the controlling agent
    async fn dial(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError>;

    /// Establish as the controlled agent
    async fn accept(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError>;

    async fn close(&self) -> Result<(), NetworkError>;
}

/// `webrtc-ice` backed engine
pub struct IceAgent {
    agent: Agent,
    seen_remote: Mutex<HashSet<String>>,
}

impl IceAgent {
    /// Create an agent and the channel its events are delivered on
    pub async fn new(
        settings: &AgentSettings,
        event_capacity: usize,
    ) -> Result<(Self, EngineEvents), NetworkError> {
        let urls = settings
            .stun_urls
            .iter()
            .map(|s| Url::parse_url(s).map_err(|e| NetworkError::Engine(format!("{s}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let config = AgentConfig {
            urls,
            network_types: settings
                .network_types
                .iter()
                .map(|kind| network_type(*kind))
                .collect(),
            nat_1to1_ips: settings.nat_1to1_ips.clone(),
            ..Default::default()
        };

        let agent = Agent::new(config)
            .await
            .map_err(|e| NetworkError::Engine(format!("Failed to create ICE agent: {}", e)))?;

        let (tx, rx) = mpsc::channel(event_capacity.max(1));

        let candidate_tx = tx.clone();
        agent.on_candidate(Box::new(
            move |c: Option<Arc<dyn Candidate + Send + Sync>>| {
                let tx = candidate_tx.clone();
                Box::pin(async move {
                    let event = match c {
                        Some(candidate) => {
                            debug!("local candidate is: {}", candidate);
                            EngineEvent::LocalCandidate(CandidateDescriptor::new(
                                candidate.marshal(),
                            ))
                        }
                        None => EngineEvent::GatheringComplete,
                    };
                    let _ = tx.send(event).await;
                })
            },
        ));

        let state_tx = tx;
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let status = ConnectionStatus::from(state);
                info!("ICE Connection State has changed: {}", status);
                let _ = tx.send(EngineEvent::StateChanged(status)).await;
            })
        }));

        Ok((
            Self {
                agent,
                seen_remote: Mutex::new(HashSet::new()),
            },
            rx,
        ))
    }

    async fn establish(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
        step: Step,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        // The agent only understands an mpsc receiver as its cancel signal
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let bridge = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                let _ = cancel_tx.send(()).await;
            }
        });

        let ufrag = remote.ufrag.clone();
        let pwd = remote.pwd.clone();
        let result: Result<Arc<dyn Conn + Send + Sync>, webrtc_ice::Error> = match step {
            Step::Dial => self
                .agent
                .dial(cancel_rx, ufrag, pwd)
                .await
                .map(|c| c as Arc<dyn Conn + Send + Sync>),
            _ => self
                .agent
                .accept(cancel_rx, ufrag, pwd)
                .await
                .map(|c| c as Arc<dyn Conn + Send + Sync>),
        };
        bridge.abort();

        match result {
            Ok(conn) => Ok(Arc::new(IceSession { conn })),
            Err(_) if cancel.is_cancelled() => Err(NetworkError::Cancelled(step)),
            Err(e) => Err(NetworkError::Establishment {
                step,
                reason: e.to_string(),
            }),
        }
    }

    fn ingest_remote(&self, raw: &str) -> Result<(), SignalingError> {
        let parsed = unmarshal_candidate(raw).map_err(|e| SignalingError::MalformedCandidate {
            candidate: raw.to_string(),
            reason: e.to_string(),
        })?;
        let parsed: Arc<dyn Candidate + Send + Sync> = Arc::new(parsed);

        self.agent.add_remote_candidate(&parsed).map_err(|e| {
            warn!("Failed to add remote candidate {}: {}", raw, e);
            SignalingError::MalformedCandidate {
                candidate: raw.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!("remote candidate added: {}", parsed);
        Ok(())
    }
}

#[async_trait]
impl ConnectivityEngine for IceAgent {
    async fn local_credentials(&self) -> Result<Credential, NetworkError> {
        let (ufrag, pwd) = self.agent.get_local_user_credentials().await;
        Ok(Credential { ufrag, pwd })
    }

    fn gather_candidates(&self) -> Result<(), NetworkError> {
        self.agent
            .gather_candidates()
            .map_err(|e| NetworkError::Establishment {
                step: Step::Gathering,
                reason: e.to_string(),
            })
    }

    fn add_remote_candidate(&self, candidate: &CandidateDescriptor) -> Result<(), SignalingError> {
        let raw = candidate.as_str();
        if !self.seen_remote.lock().insert(raw.to_string()) {
            debug!("Ignoring duplicate remote candidate: {}", raw);
            return Ok(());
        }

        // A rejected candidate must stay eligible for a later resend
        let result = self.ingest_remote(raw);
        if result.is_err() {
            self.seen_remote.lock().remove(raw);
        }
        result
    }

    async fn dial(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        self.establish(remote, cancel, Step::Dial).await
    }

    async fn accept(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        self.establish(remote, cancel, Step::Accept).await
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.agent
            .close()
            .await
            .map_err(|e| NetworkError::Engine(format!("Failed to close ICE agent: {}", e)))
    }
}

fn network_type(kind: NetworkKind) -> NetworkType {
    match kind {
        NetworkKind::Udp4 => NetworkType::Udp4,
        NetworkKind::Udp6 => NetworkType::Udp6,
        NetworkKind::Tcp4 => NetworkType::Tcp4,
        NetworkKind::Tcp6 => NetworkType::Tcp6,
    }
}

/// Session over a selected ICE candidate pair
struct IceSession {
    conn: Arc<dyn Conn + Send + Sync>,
}

#[async_trait]
impl SessionStream for IceSession {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn
            .recv(buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.conn
            .send(buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    async fn close(&self) -> io::Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}
