//! Signaling protocol definitions
//!
//! Defines the message shapes moved over the out-of-band exchange channel.

mod message;

pub use message::{
    CandidateDescriptor, CandidateForm, Credential, ErrorBody, ExchangeMessage, ReadyMessage,
    POLL_CANDIDATE_PATH, READY_PATH, REMOTE_AUTH_PATH, REMOTE_CANDIDATE_PATH,
};
