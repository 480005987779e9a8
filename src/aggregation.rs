use dashmap::DashMap;
use futures::channel::{mpsc, oneshot};
use futures::{select, FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::operators::{OperatorRegistry, QuorumSnapshot, RegistryLookupError};
use crate::registry::ResponseRegistry;
use crate::signing::{SignatureScheme, SignatureVerificationError};
use crate::types::{
    response_digest, OperatorId, PubKey, QuorumCertificate, QuorumNum, ResponseDigest, Signature,
    SignedResponse, TaskIndex, TaskRecord,
};

/*
    one aggregation session runs per task, as its own tokio task
    owning all session state. responses are routed in over a bounded
    inbox and each carries a reply slot, so the rpc surface can
    report verification outcomes to the worker that posted them. the
    session's deadline is a sleep raced against the inbox; reaching
    threshold breaks the loop and drops the sleep, which is what
    cancels the timer. a session emits on the event channel at most
    once, then archives its terminal status and removes itself from
    the live map.
*/

const SESSION_INBOX_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Collecting,
    ThresholdReached,
    Expired,
}

// how a verified-and-routed response was taken
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseAck {
    // counted toward the task's quorum stakes
    Counted,

    // kept for audit but not counted (digest fork or duplicate)
    Recorded,

    // session already terminal; idempotent no-op
    SessionClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseRejected {
    #[error("task {task_index} is not known to the aggregation engine")]
    TaskNotFound { task_index: TaskIndex },

    #[error("operator `{operator_id}` is not part of task {task_index}'s quorums")]
    OperatorNotInQuorum {
        task_index: TaskIndex,
        operator_id: OperatorId,
    },

    #[error("signature rejected: {0}")]
    InvalidSignature(#[from] SignatureVerificationError),

    #[error("claimed digest `{claimed}` does not match the payload digest `{computed}`")]
    DigestMismatch {
        claimed: ResponseDigest,
        computed: ResponseDigest,
    },
}

#[derive(Debug, Error)]
pub enum AggregationAssemblyError {
    #[error("registry index lookup failed: {0}")]
    Indices(#[from] RegistryLookupError),

    #[error("signature fold failed: {0}")]
    Fold(#[from] SignatureVerificationError),
}

#[derive(Debug, Error)]
pub enum InitializeError {
    #[error("task {task_index} already has an aggregation session")]
    DuplicateTask { task_index: TaskIndex },

    #[error("task {task_index} pairs {quorums} quorums with {thresholds} thresholds")]
    MismatchedThresholds {
        task_index: TaskIndex,
        quorums: usize,
        thresholds: usize,
    },

    #[error("operator snapshot failed: {0}")]
    Snapshot(#[from] RegistryLookupError),
}

// emitted at most once per session
#[derive(Debug)]
pub enum AggregationEvent {
    Completed(QuorumCertificate),

    AssemblyFailed {
        task_index: TaskIndex,
        error: AggregationAssemblyError,
    },

    Expired {
        task_index: TaskIndex,
    },
}

struct ResponseEnvelope {
    response: SignedResponse,
    reply: oneshot::Sender<Result<ResponseAck, ResponseRejected>>,
}

struct SessionHandle {
    tx: mpsc::Sender<ResponseEnvelope>,
    join: JoinHandle<()>,
}

pub struct AggregationService {
    scheme: Arc<dyn SignatureScheme>,
    operators: Arc<dyn OperatorRegistry>,
    registry: Arc<ResponseRegistry>,

    // live sessions only; a session removes itself when it ends
    sessions: Arc<DashMap<TaskIndex, SessionHandle>>,

    // every session ever opened, terminal statuses included
    statuses: Arc<DashMap<TaskIndex, SessionStatus>>,

    events_tx: mpsc::Sender<AggregationEvent>,
}

impl AggregationService {
    pub fn new(
        scheme: Arc<dyn SignatureScheme>,
        operators: Arc<dyn OperatorRegistry>,
        registry: Arc<ResponseRegistry>,
    ) -> (Arc<AggregationService>, mpsc::Receiver<AggregationEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let service = Arc::new(AggregationService {
            scheme,
            operators,
            registry,
            sessions: Arc::new(DashMap::new()),
            statuses: Arc::new(DashMap::new()),
            events_tx,
        });
        (service, events_rx)
    }

    // open a session for a freshly registered task. the operator set
    // is snapshotted at the task's creation block; the response
    // window starts now.
    pub async fn initialize_task(
        &self,
        record: TaskRecord,
        response_window: Duration,
    ) -> Result<(), InitializeError> {
        let task_index = record.task_index;
        if record.quorum_numbers.len() != record.quorum_threshold_percentages.len() {
            return Err(InitializeError::MismatchedThresholds {
                task_index,
                quorums: record.quorum_numbers.len(),
                thresholds: record.quorum_threshold_percentages.len(),
            });
        }
        match self.statuses.entry(task_index) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(InitializeError::DuplicateTask { task_index });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionStatus::Pending);
            }
        }
        let snapshot = match self
            .operators
            .quorum_snapshot(record.task_created_block, &record.quorum_numbers)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.statuses.remove(&task_index);
                return Err(e.into());
            }
        };
        info!(
            "aggregation session open for task `{task_index}`: quorums {:?}, window {}s",
            record.quorum_numbers,
            response_window.as_secs()
        );
        let (tx, inbox) = mpsc::channel(SESSION_INBOX_DEPTH);
        let session = Session::new(record, snapshot);
        let deps = SessionDeps {
            scheme: self.scheme.clone(),
            operators: self.operators.clone(),
            events: self.events_tx.clone(),
            sessions: self.sessions.clone(),
            statuses: self.statuses.clone(),
        };
        let join = tokio::task::spawn(run_session(session, deps, inbox, response_window));
        self.sessions.insert(task_index, SessionHandle { tx, join });
        Ok(())
    }

    // intake from the rpc surface. the response is stored for audit
    // as soon as the task is known and the digest is sound, then
    // routed to the session for verification and counting.
    pub async fn process_signed_response(
        &self,
        response: SignedResponse,
    ) -> Result<ResponseAck, ResponseRejected> {
        let task_index = response.task_index;
        let computed = response_digest(&response.payload);
        if computed != response.response_digest {
            return Err(ResponseRejected::DigestMismatch {
                claimed: response.response_digest,
                computed,
            });
        }
        if !self.statuses.contains_key(&task_index) {
            return Err(ResponseRejected::TaskNotFound { task_index });
        }
        self.registry.put_response(response.clone());

        // clone the sender out so no map shard is held across awaits
        let tx = self.sessions.get(&task_index).map(|h| h.tx.clone());
        let Some(mut tx) = tx else {
            // a Pending status without a live handle means the session
            // is still opening (the handle lands right after the
            // operator snapshot); reject so the worker retries
            if self.session_status(task_index) == Some(SessionStatus::Pending) {
                return Err(ResponseRejected::TaskNotFound { task_index });
            }
            debug!("task `{task_index}`: response after session end, kept for audit");
            return Ok(ResponseAck::SessionClosed);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = ResponseEnvelope {
            response,
            reply: reply_tx,
        };
        if tx.send(envelope).await.is_err() {
            return Ok(ResponseAck::SessionClosed);
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            // session went terminal while the envelope was queued
            Err(_) => Ok(ResponseAck::SessionClosed),
        }
    }

    pub fn session_status(&self, task_index: TaskIndex) -> Option<SessionStatus> {
        self.statuses.get(&task_index).map(|s| *s)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    // close every live session and wait for the actors to wind
    // down; collected responses stay in the registry
    pub async fn shutdown(&self) {
        let task_indices: Vec<TaskIndex> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut joins = Vec::new();
        for task_index in task_indices {
            if let Some((_, handle)) = self.sessions.remove(&task_index) {
                drop(handle.tx);
                joins.push(handle.join);
            }
        }
        for join in joins {
            let _ = join.await;
        }
    }
}

struct SessionDeps {
    scheme: Arc<dyn SignatureScheme>,
    operators: Arc<dyn OperatorRegistry>,
    events: mpsc::Sender<AggregationEvent>,
    sessions: Arc<DashMap<TaskIndex, SessionHandle>>,
    statuses: Arc<DashMap<TaskIndex, SessionStatus>>,
}

struct Session {
    record: TaskRecord,
    snapshot: QuorumSnapshot,

    // quorum number paired with its required stake percentage
    thresholds: Vec<(QuorumNum, u8)>,

    // digest fixed by the first valid response
    reference_digest: Option<ResponseDigest>,

    signers: HashMap<QuorumNum, HashSet<OperatorId>>,
    stake_signed: HashMap<QuorumNum, u64>,

    // sorted by operator id so the aggregate folds deterministically
    signatures: BTreeMap<OperatorId, Signature>,
}

impl Session {
    fn new(record: TaskRecord, snapshot: QuorumSnapshot) -> Session {
        let thresholds = record
            .quorum_numbers
            .iter()
            .copied()
            .zip(record.quorum_threshold_percentages.iter().copied())
            .collect();
        Session {
            record,
            snapshot,
            thresholds,
            reference_digest: None,
            signers: HashMap::new(),
            stake_signed: HashMap::new(),
            signatures: BTreeMap::new(),
        }
    }

    fn task_index(&self) -> TaskIndex {
        self.record.task_index
    }

    // verify, then count the operator's stake in every quorum it is
    // registered for. the ack mirrors what actually happened.
    fn take_response(
        &mut self,
        scheme: &dyn SignatureScheme,
        response: &SignedResponse,
    ) -> Result<ResponseAck, ResponseRejected> {
        let task_index = self.task_index();
        let operator_id = response.operator_id;
        let Some(operator) = self.snapshot.operator(operator_id) else {
            return Err(ResponseRejected::OperatorNotInQuorum {
                task_index,
                operator_id,
            });
        };
        scheme.verify_partial(
            &operator.pubkey,
            &response.response_digest,
            &response.signature,
        )?;
        match self.reference_digest {
            None => self.reference_digest = Some(response.response_digest),
            Some(reference) if reference != response.response_digest => {
                warn!(
                    "task `{task_index}`: digest fork from operator `{operator_id}`: `{}` vs reference `{reference}`",
                    response.response_digest
                );
                return Ok(ResponseAck::Recorded);
            }
            Some(_) => {}
        }
        let mut newly_counted = false;
        for &(quorum, _) in &self.thresholds {
            if let Some(in_quorum) = self.snapshot.operator_in_quorum(quorum, operator_id) {
                let stake = in_quorum.stake;
                if self.signers.entry(quorum).or_default().insert(operator_id) {
                    *self.stake_signed.entry(quorum).or_insert(0) += stake;
                    newly_counted = true;
                }
            }
        }
        if !newly_counted {
            debug!("task `{task_index}`: duplicate response from operator `{operator_id}`");
            return Ok(ResponseAck::Recorded);
        }
        self.signatures.insert(operator_id, response.signature.clone());
        Ok(ResponseAck::Counted)
    }

    fn threshold_met(&self) -> bool {
        self.thresholds.iter().all(|&(quorum, pct)| {
            let total = self.snapshot.total_stake(quorum);
            if total == 0 {
                return false;
            }
            let signed = self.stake_signed.get(&quorum).copied().unwrap_or(0);
            u128::from(signed) * 100 >= u128::from(total) * u128::from(pct)
        })
    }

    async fn assemble(
        &self,
        scheme: &dyn SignatureScheme,
        operators: &dyn OperatorRegistry,
    ) -> Result<QuorumCertificate, AggregationAssemblyError> {
        let partials: Vec<Signature> = self.signatures.values().cloned().collect();
        let aggregate_signature = scheme.aggregate_signatures(&partials)?;

        // sorted by operator id via the btree
        let mut non_signers: BTreeMap<OperatorId, PubKey> = BTreeMap::new();
        for &(quorum, _) in &self.thresholds {
            if let Some(ops) = self.snapshot.operators.get(&quorum) {
                for op in ops {
                    if !self.signatures.contains_key(&op.operator_id) {
                        non_signers
                            .entry(op.operator_id)
                            .or_insert_with(|| op.pubkey.clone());
                    }
                }
            }
        }
        let non_signer_ids: Vec<OperatorId> = non_signers.keys().copied().collect();
        let non_signer_pubkeys: Vec<PubKey> = non_signers.into_values().collect();

        let mut quorum_apks = Vec::with_capacity(self.thresholds.len());
        for &(quorum, _) in &self.thresholds {
            let mut members: Vec<&crate::operators::OperatorState> = self
                .snapshot
                .operators
                .get(&quorum)
                .map(|ops| ops.iter().collect())
                .unwrap_or_default();
            members.sort_by(|a, b| a.operator_id.cmp(&b.operator_id));
            let pubkeys: Vec<PubKey> = members.iter().map(|op| op.pubkey.clone()).collect();
            quorum_apks.push(scheme.aggregate_pubkeys(&pubkeys)?);
        }

        let indices = operators
            .signature_indices(
                self.record.task_created_block,
                &self.record.quorum_numbers,
                &non_signer_ids,
            )
            .await?;

        Ok(QuorumCertificate {
            task_index: self.task_index(),
            response_digest: self.reference_digest.unwrap_or_default(),
            aggregate_signature,
            non_signer_pubkeys,
            quorum_apks,
            indices,
        })
    }
}

async fn run_session(
    mut session: Session,
    mut deps: SessionDeps,
    inbox: mpsc::Receiver<ResponseEnvelope>,
    response_window: Duration,
) {
    let task_index = session.task_index();
    let mut inbox = inbox.fuse();
    let deadline = tokio::time::sleep(response_window).fuse();
    futures::pin_mut!(deadline);

    let final_status = loop {
        select! {
            envelope = inbox.next() => {
                let Some(envelope) = envelope else {
                    // service shut down; leave the status as it was
                    break None;
                };
                let outcome = session.take_response(&*deps.scheme, &envelope.response);
                let counted = matches!(outcome, Ok(ResponseAck::Counted));
                let _ = envelope.reply.send(outcome);
                if counted {
                    deps.statuses.insert(task_index, SessionStatus::Collecting);
                    if session.threshold_met() {
                        info!(
                            "task `{task_index}` reached threshold with {} signer(s)",
                            session.signatures.len()
                        );
                        match session.assemble(&*deps.scheme, &*deps.operators).await {
                            Ok(certificate) => {
                                let _ = deps
                                    .events
                                    .send(AggregationEvent::Completed(certificate))
                                    .await;
                            }
                            Err(error) => {
                                error!(
                                    "task `{task_index}`: aggregate proof assembly failed: {error}"
                                );
                                let _ = deps
                                    .events
                                    .send(AggregationEvent::AssemblyFailed { task_index, error })
                                    .await;
                            }
                        }
                        break Some(SessionStatus::ThresholdReached);
                    }
                }
            }
            _ = deadline => {
                warn!("task `{task_index}`: response window closed before threshold");
                let _ = deps.events.send(AggregationEvent::Expired { task_index }).await;
                break Some(SessionStatus::Expired);
            }
        }
    };
    if let Some(status) = final_status {
        deps.statuses.insert(task_index, status);
    }
    deps.sessions.remove(&task_index);
}
