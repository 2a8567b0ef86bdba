//! Diff envelopes
//!
//! The envelope is the unit of submission and of durable history: a batch of
//! steps plus the version the client based them on, a client identifier for
//! broadcast attribution, and a request identifier for acknowledgment
//! correlation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::Step;

/// Structural validation failures, rejected at the boundary before any
/// ledger state is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("envelope carries no steps")]
    EmptySteps,

    #[error("envelope client id is empty")]
    EmptyClientId,

    #[error("step {index} has inverted range {from}..{to}")]
    InvertedStepRange { index: usize, from: u64, to: u64 },
}

/// A client-submitted batch of steps awaiting commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEnvelope {
    /// Client-local sequence number, used only for ack correlation.
    pub request_id: u64,
    /// Originating session's client identifier. Distinct from user identity;
    /// one user may hold several open sessions.
    pub client_id: String,
    /// The document version the client believed was current.
    pub base_version: u64,
    /// Ordered, non-empty list of steps.
    pub steps: Vec<Step>,
}

impl DiffEnvelope {
    /// Check structural validity. Stale-but-valid envelopes pass here; they
    /// are a control-flow branch of the ledger, not a protocol error.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.steps.is_empty() {
            return Err(ProtocolError::EmptySteps);
        }
        if self.client_id.is_empty() {
            return Err(ProtocolError::EmptyClientId);
        }
        for (index, step) in self.steps.iter().enumerate() {
            if let (Some(from), Some(to)) = (step.from_pos(), step.to_pos()) {
                if from > to {
                    return Err(ProtocolError::InvertedStepRange { index, from, to });
                }
            }
        }
        Ok(())
    }
}

/// A committed `(version, steps)` pair as relayed to subscribers and
/// returned in rebase responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedDiff {
    pub version: u64,
    pub client_id: String,
    pub steps: Vec<Step>,
}
