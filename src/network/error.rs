//! Network error types

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Orchestration step an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ready,
    CredentialExchange,
    CandidateRelay,
    Gathering,
    Dial,
    Accept,
    MessageLoop,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Ready => "ready handshake",
            Step::CredentialExchange => "credential exchange",
            Step::CandidateRelay => "candidate relay",
            Step::Gathering => "candidate gathering",
            Step::Dial => "dial",
            Step::Accept => "accept",
            Step::MessageLoop => "message loop",
        };
        f.write_str(name)
    }
}

/// Faults on the out-of-band exchange channel
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer answered with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Malformed candidate '{candidate}': {reason}")]
    MalformedCandidate { candidate: String, reason: String },

    #[error("A different remote credential was already received")]
    CredentialConflict,

    #[error("Exchange listener is gone")]
    ListenerClosed,
}

impl SignalingError {
    /// Whether retrying the same exchange can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SignalingError::Transport(_) => true,
            SignalingError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors that can occur while establishing or running a session
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Signaling failed during {step}: {source}")]
    Signaling {
        step: Step,
        #[source]
        source: SignalingError,
    },

    #[error("Establishment failed during {step}: {reason}")]
    Establishment { step: Step, reason: String },

    #[error("Timed out after {after:?} during {step}")]
    Timeout { step: Step, after: Duration },

    #[error("Session lost: {0}")]
    ConnectionRuntime(std::io::Error),

    #[error("Cancelled during {0}")]
    Cancelled(Step),

    #[error("ICE engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn signaling(step: Step, source: SignalingError) -> Self {
        NetworkError::Signaling { step, source }
    }

    /// Step the failure is attributed to, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            NetworkError::Signaling { step, .. }
            | NetworkError::Establishment { step, .. }
            | NetworkError::Timeout { step, .. }
            | NetworkError::Cancelled(step) => Some(*step),
            NetworkError::ConnectionRuntime(_) => Some(Step::MessageLoop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_signaling_errors() {
        assert!(SignalingError::Transport("refused".into()).is_recoverable());
        assert!(SignalingError::Status {
            status: 503,
            message: "busy".into()
        }
        .is_recoverable());
        assert!(!SignalingError::Status {
            status: 400,
            message: "bad".into()
        }
        .is_recoverable());
        assert!(!SignalingError::CredentialConflict.is_recoverable());
        assert!(!SignalingError::MissingField("ufrag").is_recoverable());
    }

    #[test]
    fn test_diagnostic_names_step() {
        let err = NetworkError::Timeout {
            step: Step::CredentialExchange,
            after: Duration::from_secs(3),
        };
        assert_eq!(err.step(), Some(Step::CredentialExchange));
        assert!(err.to_string().contains("credential exchange"));
    }

    #[test]
    fn test_listener_bind_failure_is_io() {
        let err: NetworkError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken").into();
        assert!(matches!(err, NetworkError::Io(_)));
        assert_eq!(err.step(), None);
    }
}
