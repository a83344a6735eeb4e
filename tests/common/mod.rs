//! Shared test fixtures: a scripted connectivity engine and in-memory sessions

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use icelink::network::{
    ConnectivityEngine, EngineEvent, EngineEvents, ExchangeConfig, NetworkError,
    OrchestratorConfig, RetryPolicy, Role, SessionStream, SignalingError, Step,
};
use icelink::protocol::{CandidateDescriptor, Credential};

/// Find an available port for testing
pub fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Slack allowed around a configured timeout
pub const TIMEOUT_TOLERANCE: Duration = Duration::from_millis(250);

/// Assert that `elapsed` matches `expected` within [`TIMEOUT_TOLERANCE`]
pub fn assert_elapsed_near(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected,
        "finished after {:?}, before the {:?} timeout",
        elapsed,
        expected
    );
    assert!(
        elapsed <= expected + TIMEOUT_TOLERANCE,
        "finished after {:?}, well past the {:?} timeout",
        elapsed,
        expected
    );
}

/// Exchange settings pointed at `127.0.0.1:port` with short windows
pub fn exchange_config(port: u16) -> ExchangeConfig {
    ExchangeConfig {
        peer_url: format!("http://127.0.0.1:{}", port),
        listen_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        request_timeout: Duration::from_millis(500),
        ready_timeout: Duration::from_secs(5),
        pairing_window: Duration::from_millis(150),
        relay_capacity: 3,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        },
    }
}

pub fn orchestrator_config(port: u16, is_controlling: bool, is_server: bool) -> OrchestratorConfig {
    OrchestratorConfig {
        role: Role::new(is_controlling, is_server),
        exchange: exchange_config(port),
        establish_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A well-formed candidate string for `name`'s `index`th path
pub fn candidate(name: &str, index: usize) -> CandidateDescriptor {
    CandidateDescriptor::new(format!(
        "candidate:{name}{index} 1 udp 2130706431 10.0.0.{} {} typ host",
        index + 1,
        50000 + index
    ))
}

/// Recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Gather,
    Dial(Credential),
    Accept(Credential),
}

/// Pairs a dialing engine with the accepting one holding matching credentials
#[derive(Clone, Default)]
pub struct Switchboard {
    waiting: Arc<Mutex<HashMap<(String, String), oneshot::Sender<Arc<ChannelSession>>>>>,
}

impl Switchboard {
    async fn meet(&self, local: &str, remote: &str) -> Arc<ChannelSession> {
        let key = if local < remote {
            (local.to_string(), remote.to_string())
        } else {
            (remote.to_string(), local.to_string())
        };

        let rx = {
            let mut waiting = self.waiting.lock();
            match waiting.remove(&key) {
                Some(peer) => {
                    let (mine, theirs) = ChannelSession::pair();
                    let _ = peer.send(Arc::new(theirs));
                    return Arc::new(mine);
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    waiting.insert(key, tx);
                    rx
                }
            }
        };
        rx.await.expect("switchboard peer vanished")
    }
}

/// Engine that emits a fixed candidate list and connects through a [`Switchboard`]
pub struct ScriptedEngine {
    name: String,
    local: Credential,
    local_candidates: Vec<CandidateDescriptor>,
    events: mpsc::Sender<EngineEvent>,
    remote_candidates: Mutex<Vec<CandidateDescriptor>>,
    remote_arrived: Notify,
    calls: Mutex<Vec<Call>>,
    switchboard: Switchboard,
}

impl ScriptedEngine {
    pub fn new(
        name: &str,
        candidate_count: usize,
        switchboard: Switchboard,
    ) -> (Arc<Self>, EngineEvents) {
        let (events, rx) = mpsc::channel(32);
        let engine = Arc::new(Self {
            name: name.to_string(),
            local: Credential::new(format!("{name}-ufrag"), format!("{name}-pwd")),
            local_candidates: (0..candidate_count).map(|i| candidate(name, i)).collect(),
            events,
            remote_candidates: Mutex::new(Vec::new()),
            remote_arrived: Notify::new(),
            calls: Mutex::new(Vec::new()),
            switchboard,
        });
        (engine, rx)
    }

    pub fn credential(&self) -> Credential {
        self.local.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<CandidateDescriptor> {
        self.remote_candidates.lock().clone()
    }

    /// Wait until `count` distinct remote candidates were ingested
    pub async fn wait_for_remote_candidates(&self, count: usize) {
        loop {
            let notified = self.remote_arrived.notified();
            if self.remote_candidates.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }

    async fn connect(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
        step: Step,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        let call = match step {
            Step::Dial => Call::Dial(remote.clone()),
            _ => Call::Accept(remote.clone()),
        };
        self.calls.lock().push(call);

        // Like a real agent, a pair can only be checked once a remote candidate exists
        let ready = async {
            self.wait_for_remote_candidates(1).await;
            self.switchboard.meet(&self.local.ufrag, &remote.ufrag).await
        };
        tokio::select! {
            session = ready => Ok(session as Arc<dyn SessionStream>),
            _ = cancel.cancelled() => Err(NetworkError::Cancelled(step)),
        }
    }
}

#[async_trait]
impl ConnectivityEngine for ScriptedEngine {
    async fn local_credentials(&self) -> Result<Credential, NetworkError> {
        Ok(self.local.clone())
    }

    fn gather_candidates(&self) -> Result<(), NetworkError> {
        self.calls.lock().push(Call::Gather);
        let events = self.events.clone();
        let candidates = self.local_candidates.clone();
        tokio::spawn(async move {
            for c in candidates {
                let _ = events.send(EngineEvent::LocalCandidate(c)).await;
            }
            let _ = events.send(EngineEvent::GatheringComplete).await;
        });
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: &CandidateDescriptor) -> Result<(), SignalingError> {
        if !candidate.as_str().starts_with("candidate:") {
            return Err(SignalingError::MalformedCandidate {
                candidate: candidate.to_string(),
                reason: format!("{} cannot parse it", self.name),
            });
        }
        let mut remote = self.remote_candidates.lock();
        if !remote.contains(candidate) {
            remote.push(candidate.clone());
        }
        drop(remote);
        self.remote_arrived.notify_waiters();
        Ok(())
    }

    async fn dial(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        self.connect(remote, cancel, Step::Dial).await
    }

    async fn accept(
        &self,
        remote: &Credential,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn SessionStream>, NetworkError> {
        self.connect(remote, cancel, Step::Accept).await
    }

    async fn close(&self) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// One end of an in-memory datagram session
pub struct ChannelSession {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelSession {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl SessionStream for ChannelSession {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.lock().await.recv().await {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer session dropped",
            )),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer session dropped"))?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
