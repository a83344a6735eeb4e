//! Credential and candidate exchange over HTTP
//!
//! The signaling server side listens for the peer's credential and trickled
//! candidates; the client side posts its own and reads the peer's from the
//! responses. Either side may be ICE controlling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    CandidateDescriptor, CandidateForm, Credential, ErrorBody, ExchangeMessage, ReadyMessage,
    POLL_CANDIDATE_PATH, READY_PATH, REMOTE_AUTH_PATH, REMOTE_CANDIDATE_PATH,
};

use super::agent::ConnectivityEngine;
use super::config::{ExchangeConfig, RetryPolicy};
use super::error::{NetworkError, SignalingError, Step};

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = match &self {
            SignalingError::CredentialConflict => StatusCode::CONFLICT,
            SignalingError::ListenerClosed => StatusCode::SERVICE_UNAVAILABLE,
            SignalingError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Shared state of the listener's handlers
#[derive(Clone)]
struct ExchangeState {
    engine: Arc<dyn ConnectivityEngine>,
    local_credential: Credential,
    remote_credential: Arc<watch::Sender<Option<Credential>>>,
    local_candidates: Arc<Mutex<mpsc::Receiver<CandidateDescriptor>>>,
    pairing_window: Duration,
}

/// Listener side of the exchange channel
pub struct SignalingServer {
    local_addr: SocketAddr,
    remote_credential: watch::Receiver<Option<Credential>>,
    relay_tx: mpsc::Sender<CandidateDescriptor>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SignalingServer {
    /// Bind the listener and start serving in the background
    pub async fn bind(
        config: &ExchangeConfig,
        engine: Arc<dyn ConnectivityEngine>,
        local_credential: Credential,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let (remote_tx, remote_rx) = watch::channel(None);
        let (relay_tx, relay_rx) = mpsc::channel(config.relay_capacity.max(1));

        let state = ExchangeState {
            engine,
            local_credential,
            remote_credential: Arc::new(remote_tx),
            local_candidates: Arc::new(Mutex::new(relay_rx)),
            pairing_window: config.pairing_window,
        };

        let app = Router::new()
            .route(READY_PATH, post(ready))
            .route(REMOTE_AUTH_PATH, post(remote_auth))
            .route(REMOTE_CANDIDATE_PATH, post(remote_candidate))
            .route(POLL_CANDIDATE_PATH, post(poll_candidate))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Signaling listener failed: {}", e);
            }
        });

        info!("Signaling server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            remote_credential: remote_rx,
            relay_tx,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the peer's credential
    ///
    /// Blocks for as long as the listener lives; there is no timeout on this side.
    pub async fn receive_credential(&mut self) -> Result<Credential, NetworkError> {
        let credential = self
            .remote_credential
            .wait_for(|c| c.is_some())
            .await
            .map_err(|_| {
                NetworkError::signaling(Step::CredentialExchange, SignalingError::ListenerClosed)
            })?
            .clone();

        credential.ok_or_else(|| {
            NetworkError::signaling(Step::CredentialExchange, SignalingError::ListenerClosed)
        })
    }

    /// Sender feeding local candidates to `/remoteCandidate` responses
    ///
    /// Bounded: a full queue blocks the producer until a request drains it.
    pub fn candidate_relay(&self) -> mpsc::Sender<CandidateDescriptor> {
        self.relay_tx.clone()
    }

    /// Stop accepting requests and wait for the listener to exit
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn ready() -> Json<ReadyMessage> {
    info!("Peer is ready");
    Json(ReadyMessage { ready: true })
}

async fn remote_auth(
    State(state): State<ExchangeState>,
    form: Result<Form<Credential>, FormRejection>,
) -> Result<Json<ExchangeMessage>, SignalingError> {
    let Form(remote) = form.map_err(|e| {
        warn!("Rejected credential request: {}", e);
        SignalingError::MalformedRequest(e.body_text())
    })?;

    if remote.ufrag.is_empty() {
        return Err(SignalingError::MissingField("ufrag"));
    }
    if remote.pwd.is_empty() {
        return Err(SignalingError::MissingField("pwd"));
    }

    let mut conflict = false;
    state.remote_credential.send_if_modified(|current| match current {
        None => {
            *current = Some(remote.clone());
            true
        }
        Some(existing) => {
            conflict = *existing != remote;
            false
        }
    });

    if conflict {
        warn!("Rejected second remote credential (ufrag {})", remote.ufrag);
        return Err(SignalingError::CredentialConflict);
    }

    info!("receive remote auth");
    Ok(Json(ExchangeMessage::Credential(state.local_credential.clone())))
}

async fn remote_candidate(
    State(state): State<ExchangeState>,
    form: Result<Form<CandidateForm>, FormRejection>,
) -> Result<Json<ExchangeMessage>, SignalingError> {
    let Form(CandidateForm { candidate }) = form.map_err(|e| {
        warn!("Rejected candidate request: {}", e);
        SignalingError::MalformedRequest(e.body_text())
    })?;
    if candidate.is_empty() {
        return Err(SignalingError::MissingField("candidate"));
    }

    let remote = CandidateDescriptor::new(candidate);
    if let Err(e) = state.engine.add_remote_candidate(&remote) {
        warn!("{}", e);
        return Err(e);
    }
    info!("receive remote candidate: {}", remote);

    Ok(next_local_candidate(&state).await)
}

async fn poll_candidate(State(state): State<ExchangeState>) -> Json<ExchangeMessage> {
    next_local_candidate(&state).await
}

/// Next queued local candidate, or the empty marker once the pairing window passes
async fn next_local_candidate(state: &ExchangeState) -> Json<ExchangeMessage> {
    let mut local = state.local_candidates.lock().await;
    match timeout(state.pairing_window, local.recv()).await {
        Ok(Some(candidate)) => {
            debug!("pairing local candidate {}", candidate);
            Json(ExchangeMessage::candidate(&candidate))
        }
        _ => {
            debug!("no local candidate");
            Json(ExchangeMessage::empty_candidate())
        }
    }
}

/// Initiator side of the exchange channel
pub struct SignalingClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    ready_timeout: Duration,
    retry: RetryPolicy,
}

impl SignalingClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                NetworkError::signaling(
                    Step::Ready,
                    SignalingError::Transport(format!("Failed to build HTTP client: {}", e)),
                )
            })?;

        Ok(Self {
            http,
            base_url: config.peer_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            ready_timeout: config.ready_timeout,
            retry: config.retry.clone(),
        })
    }

    /// Poll the listener until it answers, backing off between attempts
    pub async fn wait_ready(&self) -> Result<(), NetworkError> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut attempt = 1;

        loop {
            let result = self
                .http
                .post(format!("{}{}", self.base_url, READY_PATH))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    info!("Signaling peer {} is ready", self.base_url);
                    return Ok(());
                }
                Ok(resp) => debug!("Ready check answered {}", resp.status()),
                Err(e) => debug!("Ready check failed: {}", e),
            }

            let delay = self.retry.backoff(attempt);
            if Instant::now() + delay >= deadline {
                return Err(NetworkError::Timeout {
                    step: Step::Ready,
                    after: self.ready_timeout,
                });
            }
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Post the local credential and return the peer's
    pub async fn send_credential(&self, local: &Credential) -> Result<Credential, NetworkError> {
        let step = Step::CredentialExchange;
        let msg = self
            .with_retry(step, || self.post(REMOTE_AUTH_PATH, local, step))
            .await?;

        let remote = msg.into_credential().ok_or_else(|| {
            NetworkError::signaling(
                step,
                SignalingError::MalformedResponse("expected ufrag and pwd".to_string()),
            )
        })?;
        if remote.ufrag.is_empty() {
            return Err(NetworkError::signaling(step, SignalingError::MissingField("ufrag")));
        }
        if remote.pwd.is_empty() {
            return Err(NetworkError::signaling(step, SignalingError::MissingField("pwd")));
        }

        info!("remote ufrag pwd is: {},{}", remote.ufrag, remote.pwd);
        Ok(remote)
    }

    /// Relay one local candidate; returns the peer's piggybacked candidate, if any
    pub async fn send_candidate(
        &self,
        candidate: &CandidateDescriptor,
    ) -> Result<Option<CandidateDescriptor>, NetworkError> {
        let step = Step::CandidateRelay;
        let form = CandidateForm {
            candidate: candidate.as_str().to_string(),
        };
        let msg = self
            .with_retry(step, || self.post(REMOTE_CANDIDATE_PATH, &form, step))
            .await?;

        match msg {
            ExchangeMessage::Candidate { .. } => Ok(msg.into_candidate()),
            ExchangeMessage::Credential(_) => Err(NetworkError::signaling(
                step,
                SignalingError::MalformedResponse("expected candidate".to_string()),
            )),
        }
    }

    /// Ask the listener for one of its queued candidates without posting one
    pub async fn poll_candidate(&self) -> Result<Option<CandidateDescriptor>, NetworkError> {
        let step = Step::CandidateRelay;
        let empty: [(&str, &str); 0] = [];
        let msg = self
            .with_retry(step, || self.post(POLL_CANDIDATE_PATH, &empty, step))
            .await?;
        Ok(msg.into_candidate())
    }

    async fn with_retry<F, Fut>(&self, step: Step, f: F) -> Result<ExchangeMessage, NetworkError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<ExchangeMessage, NetworkError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(NetworkError::Signaling { source, .. })
                    if source.is_recoverable() && attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "{} attempt {} failed: {}; retrying in {:?}",
                        step, attempt, source, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        form: &T,
        step: Step,
    ) -> Result<ExchangeMessage, NetworkError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .form(form)
            .send()
            .await
            .map_err(|e| self.request_error(step, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(NetworkError::signaling(
                step,
                SignalingError::Status {
                    status: status.as_u16(),
                    message,
                },
            ));
        }

        resp.json::<ExchangeMessage>()
            .await
            .map_err(|e| self.request_error(step, e))
    }

    fn request_error(&self, step: Step, e: reqwest::Error) -> NetworkError {
        if e.is_timeout() {
            NetworkError::Timeout {
                step,
                after: self.request_timeout,
            }
        } else if e.is_decode() {
            NetworkError::signaling(step, SignalingError::MalformedResponse(e.to_string()))
        } else {
            NetworkError::signaling(step, SignalingError::Transport(e.to_string()))
        }
    }
}
