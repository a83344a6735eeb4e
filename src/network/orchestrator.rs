//! Session establishment state machine
//!
//! Sequences the credential exchange, trickled candidate relay and
//! dial/accept for one endpoint:
//!
//! ```text
//! Idle -> GatheringRemoteCredential -> GatheringCandidates -> Establishing -> Established
//!                 \                           \                     \
//!                  +---------------------------+---------------------+--> Failed
//! ```
//!
//! Dial/accept is never invoked before the remote credential is known. Local
//! candidates are relayed one by one as the engine produces them, and remote
//! candidates keep being ingested after dial/accept has started.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::protocol::{CandidateDescriptor, Credential};

use super::agent::{ConnectivityEngine, EngineEvent, EngineEvents, SessionStream};
use super::config::{CandidatePolicy, OrchestratorConfig};
use super::error::{NetworkError, Step};
use super::signaling::{SignalingClient, SignalingServer};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    GatheringRemoteCredential,
    GatheringCandidates,
    Establishing,
    Established,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Established | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::GatheringRemoteCredential => "gathering remote credential",
            State::GatheringCandidates => "gathering candidates",
            State::Establishing => "establishing",
            State::Established => "established",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Local candidate relay progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayProgress {
    /// Local candidates handed to the exchange channel
    pub relayed: usize,
    /// Remote candidates ingested from exchange responses
    pub ingested: usize,
    pub gathering_complete: bool,
}

/// Exchange channel endpoint held for the lifetime of the session
enum Exchange {
    Server(SignalingServer),
    Client(Arc<SignalingClient>),
}

/// Result of a successful run
pub struct EstablishedSession {
    pub session: Arc<dyn SessionStream>,
    pub remote_credential: Credential,
    server: Option<SignalingServer>,
    relay: JoinHandle<()>,
}

impl EstablishedSession {
    /// Stop the candidate relay and the signaling listener
    pub async fn shutdown(mut self) {
        self.relay.abort();
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        if let Err(e) = self.session.close().await {
            debug!("Session close failed: {}", e);
        }
    }
}

impl fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("remote_credential", &self.remote_credential)
            .field("serving", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for EstablishedSession {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// Drives one endpoint from `Idle` to `Established` or `Failed`
pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: Arc<dyn ConnectivityEngine>,
    events: Option<EngineEvents>,
    state_tx: watch::Sender<State>,
    progress_tx: watch::Sender<RelayProgress>,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn ConnectivityEngine>,
        events: EngineEvents,
    ) -> Self {
        let (state_tx, _) = watch::channel(State::Idle);
        let (progress_tx, _) = watch::channel(RelayProgress::default());
        Self {
            config,
            engine,
            events: Some(events),
            state_tx,
            progress_tx,
            run_id: Uuid::new_v4(),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Observe candidate relay progress
    pub fn progress(&self) -> watch::Receiver<RelayProgress> {
        self.progress_tx.subscribe()
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Run the state machine to completion
    ///
    /// Any error moves the orchestrator to `Failed`; the error names the step.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<EstablishedSession, NetworkError> {
        let role = self.config.role;
        let span = info_span!(
            "session",
            run = %self.run_id,
            ice = role.ice_role(),
            signaling = role.signaling_role()
        );

        let result = self.establish(cancel).instrument(span).await;
        if let Err(e) = &result {
            error!("Session establishment failed: {}", e);
            self.transition(State::Failed);
        }
        result
    }

    async fn establish(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<EstablishedSession, NetworkError> {
        let events = self.events.take().ok_or_else(|| {
            NetworkError::Engine("orchestrator has already been run".to_string())
        })?;

        if self.config.role.is_controlling {
            info!("Local Agent is controlling");
        } else {
            info!("Local Agent is controlled");
        }

        self.transition(State::GatheringRemoteCredential);
        let local = self.engine.local_credentials().await?;
        let (remote, exchange) = self.exchange_credentials(&local, &cancel).await?;

        self.transition(State::GatheringCandidates);
        let relay_cancel = cancel.child_token();
        let relay = self.spawn_relay(events, &exchange, relay_cancel.clone());
        let relay_guard = relay_cancel.clone().drop_guard();

        self.engine.gather_candidates()?;
        self.wait_for_candidates(&cancel).await?;

        self.transition(State::Establishing);
        let session = self.dial_or_accept(&remote, &cancel).await?;

        self.transition(State::Established);
        let _ = relay_guard.disarm();

        let server = match exchange {
            Exchange::Server(server) => Some(server),
            Exchange::Client(_) => None,
        };
        Ok(EstablishedSession {
            session,
            remote_credential: remote,
            server,
            relay,
        })
    }

    async fn exchange_credentials(
        &self,
        local: &Credential,
        cancel: &CancellationToken,
    ) -> Result<(Credential, Exchange), NetworkError> {
        let step = Step::CredentialExchange;

        if self.config.role.is_server {
            let mut server = SignalingServer::bind(
                &self.config.exchange,
                self.engine.clone(),
                local.clone(),
            )
            .await?;

            info!("Waiting for remote credential");
            let remote = cancellable(cancel, step, server.receive_credential()).await?;
            info!("remote ufrag pwd is: {},{}", remote.ufrag, remote.pwd);
            Ok((remote, Exchange::Server(server)))
        } else {
            let client = Arc::new(SignalingClient::new(&self.config.exchange)?);
            cancellable(cancel, Step::Ready, client.wait_ready()).await?;
            let remote = cancellable(cancel, step, client.send_credential(local)).await?;
            Ok((remote, Exchange::Client(client)))
        }
    }

    fn spawn_relay(
        &self,
        events: EngineEvents,
        exchange: &Exchange,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let relay = CandidateRelay {
            engine: self.engine.clone(),
            target: match exchange {
                Exchange::Server(server) => RelayTarget::Queue(server.candidate_relay()),
                Exchange::Client(client) => RelayTarget::Peer(client.clone()),
            },
            progress: self.progress_tx.clone(),
            state: self.state_tx.subscribe(),
        };

        tokio::spawn(relay.run(events, cancel).in_current_span())
    }

    async fn wait_for_candidates(&self, cancel: &CancellationToken) -> Result<(), NetworkError> {
        let CandidatePolicy::AtLeast(min) = self.config.candidate_policy else {
            return Ok(());
        };

        debug!("Waiting for {} local candidates before establishing", min);
        let mut progress = self.progress_tx.subscribe();
        let wait = async {
            progress
                .wait_for(|p| p.relayed >= min || p.gathering_complete)
                .await
                .map(|_| ())
                .map_err(|_| NetworkError::Establishment {
                    step: Step::Gathering,
                    reason: "candidate relay stopped".to_string(),
                })
        };
        cancellable(cancel, Step::Gathering, wait).await
    }

    async fn dial_or_accept(
        &self,
        remote: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        let establish_cancel = cancel.child_token();
        let (step, attempt) = if self.config.role.is_controlling {
            (Step::Dial, self.engine.dial(remote, establish_cancel.clone()))
        } else {
            (Step::Accept, self.engine.accept(remote, establish_cancel.clone()))
        };

        info!("Starting {} with remote ufrag {}", step, remote.ufrag);
        match timeout(self.config.establish_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                establish_cancel.cancel();
                Err(NetworkError::Timeout {
                    step,
                    after: self.config.establish_timeout,
                })
            }
        }
    }

    fn transition(&self, next: State) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!("State: {} -> {}", prev, next);
        }
    }
}

/// Await `fut` unless `cancel` fires first
async fn cancellable<T, F>(
    cancel: &CancellationToken,
    step: Step,
    fut: F,
) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(NetworkError::Cancelled(step)),
    }
}

enum RelayTarget {
    /// Listener side: candidates wait in the queue drained by `/remoteCandidate`
    Queue(mpsc::Sender<CandidateDescriptor>),
    /// Initiator side: each candidate is posted to the peer
    Peer(Arc<SignalingClient>),
}

/// Moves engine events onto the exchange channel
struct CandidateRelay {
    engine: Arc<dyn ConnectivityEngine>,
    target: RelayTarget,
    progress: watch::Sender<RelayProgress>,
    state: watch::Receiver<State>,
}

impl CandidateRelay {
    async fn run(self, mut events: EngineEvents, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => {
                    debug!("Candidate relay cancelled");
                    return;
                }
            };

            match event {
                Some(EngineEvent::LocalCandidate(candidate)) => {
                    info!("local candidate is: {}", candidate);
                    self.relay(candidate, &cancel).await;
                }
                Some(EngineEvent::GatheringComplete) => {
                    info!("Local candidate gathering complete");
                    self.progress.send_modify(|p| p.gathering_complete = true);
                    if let RelayTarget::Peer(client) = &self.target {
                        self.drain_peer(client, &cancel).await;
                    }
                }
                Some(EngineEvent::StateChanged(status)) => {
                    debug!("Engine state: {}", status);
                }
                None => {
                    debug!("Engine event channel closed");
                    return;
                }
            }
        }
    }

    async fn relay(&self, candidate: CandidateDescriptor, cancel: &CancellationToken) {
        match &self.target {
            RelayTarget::Queue(queue) => {
                // Blocks while the queue is full
                tokio::select! {
                    sent = queue.send(candidate) => {
                        if sent.is_err() {
                            warn!("Candidate queue closed");
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
                self.progress.send_modify(|p| p.relayed += 1);
            }
            RelayTarget::Peer(client) => {
                let reply = tokio::select! {
                    reply = client.send_candidate(&candidate) => reply,
                    _ = cancel.cancelled() => return,
                };
                match reply {
                    Ok(remote) => {
                        self.progress.send_modify(|p| p.relayed += 1);
                        match remote {
                            Some(remote) => {
                                info!(
                                    "local candidate is: {}, remote candidate is {}",
                                    candidate, remote
                                );
                                self.ingest(&remote);
                            }
                            None => {
                                info!("local candidate is: {}, remote candidate is empty", candidate)
                            }
                        }
                    }
                    Err(e) => warn!("Failed to relay candidate {}: {}", candidate, e),
                }
            }
        }
    }

    /// Pull listener candidates left over once there is nothing more to post
    async fn drain_peer(&self, client: &SignalingClient, cancel: &CancellationToken) {
        loop {
            let reply = tokio::select! {
                reply = client.poll_candidate() => reply,
                _ = cancel.cancelled() => return,
            };
            match reply {
                Ok(Some(remote)) => {
                    info!("remote candidate is {}", remote);
                    self.ingest(&remote);
                }
                Ok(None) if self.state.borrow().is_terminal() => return,
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to poll remote candidates: {}", e);
                    return;
                }
            }
        }
    }

    fn ingest(&self, remote: &CandidateDescriptor) {
        match self.engine.add_remote_candidate(remote) {
            Ok(()) => self.progress.send_modify(|p| p.ingested += 1),
            Err(e) => warn!("Dropping remote candidate: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(State::Established.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::Establishing.is_terminal());
        assert!(!State::Idle.is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            State::GatheringRemoteCredential.to_string(),
            "gathering remote credential"
        );
    }
}
