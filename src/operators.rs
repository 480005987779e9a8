use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{OperatorId, PubKey, QuorumNum, SignatureIndices};

// one operator's registered identity and weight within a quorum
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorState {
    pub operator_id: OperatorId,

    pub pubkey: PubKey,

    pub stake: u64,
}

// per-quorum operator sets pinned to one block
#[derive(Clone, Debug, Default)]
pub struct QuorumSnapshot {
    pub operators: HashMap<QuorumNum, Vec<OperatorState>>,
}

impl QuorumSnapshot {
    pub fn total_stake(&self, quorum: QuorumNum) -> u64 {
        self.operators
            .get(&quorum)
            .map_or(0, |ops| ops.iter().map(|op| op.stake).sum())
    }

    pub fn operator_in_quorum(
        &self,
        quorum: QuorumNum,
        operator_id: OperatorId,
    ) -> Option<&OperatorState> {
        self.operators
            .get(&quorum)
            .and_then(|ops| ops.iter().find(|op| op.operator_id == operator_id))
    }

    // member of any quorum in the snapshot
    pub fn operator(&self, operator_id: OperatorId) -> Option<&OperatorState> {
        self.operators
            .values()
            .flatten()
            .find(|op| op.operator_id == operator_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryLookupError {
    #[error("no operator set registered for quorum {quorum}")]
    UnknownQuorum { quorum: QuorumNum },

    #[error("operator `{operator_id}` is not registered in quorum {quorum}")]
    UnknownOperator {
        quorum: QuorumNum,
        operator_id: OperatorId,
    },

    #[error("registry backend unavailable: {0}")]
    Backend(String),
}

// view onto the on-chain operator registry. snapshots and index
// lookups are pinned to the task's creation block so a task is
// judged against the stake distribution that existed when it was
// created.
#[async_trait]
pub trait OperatorRegistry: Send + Sync + 'static {
    async fn quorum_snapshot(
        &self,
        block_number: u64,
        quorums: &[QuorumNum],
    ) -> Result<QuorumSnapshot, RegistryLookupError>;

    // positions of the non-signers and stake tables in the
    // registry's historical records, needed by the certificate
    async fn signature_indices(
        &self,
        block_number: u64,
        quorums: &[QuorumNum],
        non_signers: &[OperatorId],
    ) -> Result<SignatureIndices, RegistryLookupError>;
}

// fixed operator set from configuration; every block sees the same
// registration, which is what dev nets and tests want
pub struct StaticOperatorRegistry {
    quorums: HashMap<QuorumNum, Vec<OperatorState>>,
}

impl StaticOperatorRegistry {
    pub fn new(mut quorums: HashMap<QuorumNum, Vec<OperatorState>>) -> StaticOperatorRegistry {
        // canonical order keeps index lookups stable
        for ops in quorums.values_mut() {
            ops.sort_by(|a, b| a.operator_id.cmp(&b.operator_id));
        }
        StaticOperatorRegistry { quorums }
    }

    fn quorum(&self, quorum: QuorumNum) -> Result<&Vec<OperatorState>, RegistryLookupError> {
        self.quorums
            .get(&quorum)
            .ok_or(RegistryLookupError::UnknownQuorum { quorum })
    }
}

#[async_trait]
impl OperatorRegistry for StaticOperatorRegistry {
    async fn quorum_snapshot(
        &self,
        _block_number: u64,
        quorums: &[QuorumNum],
    ) -> Result<QuorumSnapshot, RegistryLookupError> {
        let mut operators = HashMap::new();
        for &quorum in quorums {
            operators.insert(quorum, self.quorum(quorum)?.clone());
        }
        Ok(QuorumSnapshot { operators })
    }

    async fn signature_indices(
        &self,
        _block_number: u64,
        quorums: &[QuorumNum],
        non_signers: &[OperatorId],
    ) -> Result<SignatureIndices, RegistryLookupError> {
        // a static set has exactly one history entry per table, so
        // bitmap/apk/total indices are all zero; stake indices are
        // the operators' positions in their quorum's sorted set
        let mut indices = SignatureIndices {
            non_signer_quorum_bitmap_indices: vec![0; non_signers.len()],
            quorum_apk_indices: vec![0; quorums.len()],
            total_stake_indices: vec![0; quorums.len()],
            non_signer_stake_indices: Vec::with_capacity(quorums.len()),
        };
        for &quorum in quorums {
            let ops = self.quorum(quorum)?;
            let mut per_quorum = Vec::new();
            for non_signer in non_signers {
                if let Some(pos) = ops.iter().position(|op| op.operator_id == *non_signer) {
                    per_quorum.push(pos as u32);
                }
            }
            indices.non_signer_stake_indices.push(per_quorum);
        }
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::OperatorSigner;

    fn operator(seed: u8, stake: u64) -> OperatorState {
        let signer = OperatorSigner::from_seed([seed; 32]);
        OperatorState {
            operator_id: signer.operator_id(),
            pubkey: signer.pubkey(),
            stake,
        }
    }

    fn registry() -> StaticOperatorRegistry {
        let mut quorums = HashMap::new();
        quorums.insert(0u8, vec![operator(1, 100), operator(2, 200), operator(3, 300)]);
        quorums.insert(1u8, vec![operator(2, 50), operator(3, 50)]);
        StaticOperatorRegistry::new(quorums)
    }

    #[tokio::test]
    async fn snapshot_covers_requested_quorums_only() {
        let snapshot = registry().quorum_snapshot(10, &[0]).await.unwrap();
        assert_eq!(snapshot.operators.len(), 1);
        assert_eq!(snapshot.total_stake(0), 600);
        assert_eq!(snapshot.total_stake(1), 0);
    }

    #[tokio::test]
    async fn unknown_quorum_is_an_error() {
        let err = registry().quorum_snapshot(10, &[0, 9]).await.unwrap_err();
        assert_eq!(err, RegistryLookupError::UnknownQuorum { quorum: 9 });
    }

    #[tokio::test]
    async fn membership_lookups_resolve_across_quorums() {
        let snapshot = registry().quorum_snapshot(10, &[0, 1]).await.unwrap();
        let id = OperatorSigner::from_seed([2u8; 32]).operator_id();
        assert!(snapshot.operator(id).is_some());
        assert!(snapshot.operator_in_quorum(0, id).is_some());
        let only_quorum_zero = OperatorSigner::from_seed([1u8; 32]).operator_id();
        assert!(snapshot.operator_in_quorum(1, only_quorum_zero).is_none());
    }

    #[tokio::test]
    async fn static_indices_are_positions_in_the_sorted_set() {
        let reg = registry();
        let non_signer = OperatorSigner::from_seed([3u8; 32]).operator_id();
        let indices = reg.signature_indices(10, &[0, 1], &[non_signer]).await.unwrap();
        assert_eq!(indices.quorum_apk_indices, vec![0, 0]);
        assert_eq!(indices.total_stake_indices, vec![0, 0]);
        assert_eq!(indices.non_signer_quorum_bitmap_indices, vec![0]);
        assert_eq!(indices.non_signer_stake_indices.len(), 2);
        // the operator appears in both quorums, at its sorted position
        assert_eq!(indices.non_signer_stake_indices[0].len(), 1);
        assert_eq!(indices.non_signer_stake_indices[1].len(), 1);
    }
}
