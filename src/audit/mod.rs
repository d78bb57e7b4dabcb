//! Audit trail and integrity hashes
//!
//! Every step of a thread is checkpointed, so the audit trail is derived
//! from the checkpoint list rather than stored separately. Hashes are
//! SHA-256 over the canonical JSON encoding.

use crate::models::{CapitalCallData, WorkflowStatus};
use crate::state::{Checkpoint, WorkflowState};
use crate::workflow::NodeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use uuid::Uuid;

/// One executed step of a thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub sequence: usize,
    pub checkpoint_id: Uuid,
    /// `None` for the checkpoint written when the thread started
    pub step: Option<NodeName>,
    pub status: WorkflowStatus,
    pub error: Option<String>,
    pub data_hash: String,
    pub state_hash: String,
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn from_checkpoint(sequence: usize, checkpoint: &Checkpoint) -> Self {
        Self {
            sequence,
            checkpoint_id: checkpoint.checkpoint_id,
            step: checkpoint.step,
            status: checkpoint.state.orchestration.status,
            error: checkpoint.state.orchestration.error.clone(),
            data_hash: compute_data_hash(&checkpoint.state.data),
            state_hash: compute_state_hash(&checkpoint.state),
            recorded_at: checkpoint.created_at,
        }
    }
}

/// Audit trail of a thread, oldest step first.
pub fn build_trail(checkpoints: &[Checkpoint]) -> Vec<StepRecord> {
    checkpoints
        .iter()
        .enumerate()
        .map(|(i, c)| StepRecord::from_checkpoint(i, c))
        .collect()
}

/// Whether a checkpoint still matches the hash recorded for it.
pub fn verify_integrity(record: &StepRecord, checkpoint: &Checkpoint) -> bool {
    record.checkpoint_id == checkpoint.checkpoint_id
        && record.state_hash == compute_state_hash(&checkpoint.state)
}

/// Hash binding a confirmation summary to the data it describes.
pub fn compute_data_hash(data: &CapitalCallData) -> String {
    hash_json(data)
}

pub fn compute_state_hash(state: &WorkflowState) -> String {
    hash_json(state)
}

/// Streams the JSON encoding straight into the hasher.
fn hash_json<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserContext;

    #[test]
    fn test_data_hash_tracks_content() {
        let mut data = CapitalCallData {
            fund_id: Some("EGF3".into()),
            amount: Some(1_000.0),
            ..Default::default()
        };
        let first = compute_data_hash(&data);
        assert_eq!(first.len(), 64);
        assert_eq!(first, compute_data_hash(&data.clone()));

        data.amount = Some(1_000.01);
        assert_ne!(first, compute_data_hash(&data));
    }

    #[test]
    fn test_trail_and_integrity() {
        let mut state = WorkflowState::new("t-1", UserContext::new("u-1", "Quinn"));
        let start = Checkpoint::new(None, state.clone());
        state.enter_step(NodeName::ParseIntent);
        state.orchestration.status = WorkflowStatus::AwaitingInput;
        let parsed = Checkpoint::new(Some(NodeName::ParseIntent), state);

        let trail = build_trail(&[start.clone(), parsed.clone()]);
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].step, None);
        assert_eq!(trail[1].step, Some(NodeName::ParseIntent));
        assert_eq!(trail[1].status, WorkflowStatus::AwaitingInput);
        assert_ne!(trail[0].state_hash, trail[1].state_hash);

        assert!(verify_integrity(&trail[1], &parsed));
        let mut tampered = parsed;
        tampered.state.data.amount = Some(5.0);
        assert!(!verify_integrity(&trail[1], &tampered));
    }
}
