use alloy_primitives::{keccak256, Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// task indices are global across jobs, allocated by the coordinator
pub type TaskIndex = u32;

pub type QuorumNum = u8;

// 32-byte digest binding a response's content
pub type ResponseDigest = B256;

// 32-byte operator identity as registered on-chain
pub type OperatorId = B256;

// opaque public key material, scheme-defined encoding
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKey(#[serde(with = "hex")] pub Vec<u8>);

// opaque signature material, scheme-defined encoding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex")] pub Vec<u8>);

// canonical digest of a response payload
pub fn response_digest(payload: &[u8]) -> ResponseDigest {
    keccak256(payload)
}

// one decoded job request as emitted on-chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: u32,

    pub job_type: String,

    pub job_description: String,

    pub resource_url: String,

    // window over which the job's sub-tasks are spread
    pub timeframe: Duration,

    pub sub_task_types: Vec<String>,
}

// one schedulable unit of work derived from a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub job_id: u32,

    pub task_id: TaskIndex,

    pub chain_id: u64,

    pub contract_addr: Address,

    pub target_function: String,

    pub dispatch_at: DateTime<Utc>,
}

// immutable per-task facts, written once at registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_index: TaskIndex,

    pub quorum_numbers: Vec<QuorumNum>,

    // required signed stake per quorum, in percent
    pub quorum_threshold_percentages: Vec<u8>,

    pub task_created_block: u64,
}

// body POSTed to each worker endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: TaskIndex,

    pub chain_id: u64,

    pub contract_addr: Address,

    pub target_function: String,
}

impl TaskRequest {
    pub fn from_descriptor(task: &TaskDescriptor) -> TaskRequest {
        TaskRequest {
            task_id: task.task_id,
            chain_id: task.chain_id,
            contract_addr: task.contract_addr,
            target_function: task.target_function.clone(),
        }
    }
}

// signed result a worker posts back to the aggregator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedResponse {
    pub task_index: TaskIndex,

    pub response_digest: ResponseDigest,

    #[serde(with = "hex")]
    pub payload: Vec<u8>,

    pub operator_id: OperatorId,

    pub signature: Signature,
}

// positions of non-signer/stake data in the on-chain registry's
// historical tables, resolved at the task's creation block
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureIndices {
    pub non_signer_quorum_bitmap_indices: Vec<u32>,

    pub quorum_apk_indices: Vec<u32>,

    pub total_stake_indices: Vec<u32>,

    pub non_signer_stake_indices: Vec<Vec<u32>>,
}

// aggregate proof for one task, ready for on-chain submission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub task_index: TaskIndex,

    pub response_digest: ResponseDigest,

    pub aggregate_signature: Signature,

    // pubkeys of operators that did not sign, sorted by operator id
    pub non_signer_pubkeys: Vec<PubKey>,

    // aggregate pubkey per required quorum, in quorum order
    pub quorum_apks: Vec<PubKey>,

    pub indices: SignatureIndices,
}
