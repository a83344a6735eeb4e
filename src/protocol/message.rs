//! Signaling exchange messages
//!
//! Requests are sent as `application/x-www-form-urlencoded` bodies, responses
//! as JSON:
//! - `POST /ready`: no body -> JSON `{"ready": true}` once the listener serves
//! - `POST /remoteAuth`: form `ufrag`, `pwd` -> JSON `{"ufrag", "pwd"}`
//! - `POST /remoteCandidate`: form `candidate` -> JSON `{"candidate"}`,
//!   where an empty string means no local candidate was ready in time.
//! - `POST /pollCandidate`: no body -> JSON `{"candidate"}`, lets the initiator
//!   drain listener candidates once it has none of its own left to post.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Path of the credential exchange
pub const REMOTE_AUTH_PATH: &str = "/remoteAuth";

/// Path of the candidate relay
pub const REMOTE_CANDIDATE_PATH: &str = "/remoteCandidate";

/// Path the initiator drains remaining listener candidates from
pub const POLL_CANDIDATE_PATH: &str = "/pollCandidate";

/// Path of the readiness handshake
pub const READY_PATH: &str = "/ready";

/// ICE username fragment and password of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ufrag: String,
    pub pwd: String,
}

impl Credential {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    /// Both halves must be present for the credential to be usable
    pub fn is_complete(&self) -> bool {
        !self.ufrag.is_empty() && !self.pwd.is_empty()
    }
}

/// One serialized local network path, in ICE candidate attribute syntax
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateDescriptor(String);

impl CandidateDescriptor {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self(candidate.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CandidateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON body returned by the listener
///
/// Variant order matters: a body carrying both `ufrag` and `pwd` is a
/// credential, anything else with a `candidate` field is a candidate reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExchangeMessage {
    Credential(Credential),
    Candidate { candidate: String },
}

impl ExchangeMessage {
    /// Candidate reply carrying no candidate
    pub fn empty_candidate() -> Self {
        ExchangeMessage::Candidate {
            candidate: String::new(),
        }
    }

    pub fn candidate(candidate: &CandidateDescriptor) -> Self {
        ExchangeMessage::Candidate {
            candidate: candidate.as_str().to_string(),
        }
    }

    pub fn into_credential(self) -> Option<Credential> {
        match self {
            ExchangeMessage::Credential(c) => Some(c),
            ExchangeMessage::Candidate { .. } => None,
        }
    }

    /// Piggybacked candidate, `None` for the empty marker
    pub fn into_candidate(self) -> Option<CandidateDescriptor> {
        match self {
            ExchangeMessage::Candidate { candidate } if !candidate.is_empty() => {
                Some(CandidateDescriptor(candidate))
            }
            _ => None,
        }
    }
}

/// Form body of `POST /remoteCandidate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateForm {
    pub candidate: String,
}

/// Body of `POST /ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub ready: bool,
}

/// JSON error body returned with every 4xx/5xx status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
