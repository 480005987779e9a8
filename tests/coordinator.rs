use alloy_primitives::{address, Address, B256};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use keeper_aggregator::aggregation::{AggregationEvent, AggregationService, SessionStatus};
use keeper_aggregator::coordinator::{Coordinator, TaskPolicy};
use keeper_aggregator::dispatcher::{Dispatcher, RetryPolicy};
use keeper_aggregator::event::{encode_job_event, job_created_topic, RawLog};
use keeper_aggregator::operators::{OperatorState, StaticOperatorRegistry};
use keeper_aggregator::registry::ResponseRegistry;
use keeper_aggregator::scheduler::Scheduler;
use keeper_aggregator::signing::{Ed25519Scheme, OperatorSigner};
use keeper_aggregator::types::{response_digest, JobDescriptor, SignedResponse, TaskRequest};

const CONTRACT: Address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");

// stand-in keeper: takes a task over http, signs the result with
// every configured operator key and feeds the responses straight
// into the aggregation engine
struct WorkerState {
    signers: Vec<OperatorSigner>,
    aggregation: Arc<AggregationService>,
}

async fn run_task(
    State(worker): State<Arc<WorkerState>>,
    Json(request): Json<TaskRequest>,
) -> StatusCode {
    tokio::spawn(async move {
        let payload = format!("checked:{}", request.task_id).into_bytes();
        let digest = response_digest(&payload);
        for signer in &worker.signers {
            let response = SignedResponse {
                task_index: request.task_id,
                response_digest: digest,
                payload: payload.clone(),
                operator_id: signer.operator_id(),
                signature: signer.sign_digest(&digest),
            };
            let _ = worker.aggregation.process_signed_response(response).await;
        }
    });
    StatusCode::OK
}

struct Network {
    registry: Arc<ResponseRegistry>,
    aggregation: Arc<AggregationService>,
    endpoint: String,
}

async fn keeper_network(seeds: [u8; 2]) -> (Network, mpsc::Receiver<AggregationEvent>) {
    let signers = vec![
        OperatorSigner::from_seed([seeds[0]; 32]),
        OperatorSigner::from_seed([seeds[1]; 32]),
    ];
    let mut quorums = HashMap::new();
    quorums.insert(
        0u8,
        signers
            .iter()
            .map(|s| OperatorState {
                operator_id: s.operator_id(),
                pubkey: s.pubkey(),
                stake: 50,
            })
            .collect(),
    );
    let registry = Arc::new(ResponseRegistry::new());
    let (aggregation, aggregation_events) = AggregationService::new(
        Arc::new(Ed25519Scheme),
        Arc::new(StaticOperatorRegistry::new(quorums)),
        registry.clone(),
    );

    let worker = Arc::new(WorkerState {
        signers,
        aggregation: aggregation.clone(),
    });
    let app = Router::new().route("/task", post(run_task)).with_state(worker);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}/task", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let network = Network {
        registry,
        aggregation,
        endpoint,
    };
    (network, aggregation_events)
}

fn coordinator_over(network: &Network, endpoint: String, window: Duration) -> Coordinator {
    Coordinator::new(
        Scheduler::new(31337, CONTRACT),
        Dispatcher::new(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }),
        network.registry.clone(),
        network.aggregation.clone(),
        CONTRACT,
        vec![endpoint],
        TaskPolicy {
            quorum_numbers: vec![0],
            quorum_threshold_percentages: vec![100],
            response_window: window,
        },
    )
}

fn job(job_id: u32, sub_tasks: &[&str], timeframe: Duration) -> JobDescriptor {
    JobDescriptor {
        job_id,
        job_type: "price-check".to_string(),
        job_description: "keep the oracle honest".to_string(),
        resource_url: "https://feeds.example/eth".to_string(),
        timeframe,
        sub_task_types: sub_tasks.iter().map(|s| s.to_string()).collect(),
    }
}

fn job_log(block_number: u64, job: &JobDescriptor) -> RawLog {
    RawLog {
        address: CONTRACT,
        topic: job_created_topic(),
        block_number,
        data: encode_job_event(job),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn job_event_flows_through_to_certificates() {
    let (network, events) = keeper_network([31, 32]).await;
    let coordinator =
        coordinator_over(&network, network.endpoint.clone(), Duration::from_secs(10));

    let (mut log_tx, log_rx) = mpsc::channel(16);
    let (certificates_tx, mut certificates_rx) = mpsc::channel(16);
    let run = tokio::spawn(coordinator.run(log_rx, events, certificates_tx));

    // noise the loop must shrug off: foreign topic, foreign
    // contract, truncated payload
    log_tx
        .send(RawLog {
            address: CONTRACT,
            topic: B256::repeat_byte(0xab),
            block_number: 5,
            data: vec![],
        })
        .await
        .unwrap();
    log_tx
        .send(RawLog {
            address: address!("0000000000000000000000000000000000000001"),
            topic: job_created_topic(),
            block_number: 5,
            data: vec![],
        })
        .await
        .unwrap();
    log_tx
        .send(RawLog {
            address: CONTRACT,
            topic: job_created_topic(),
            block_number: 6,
            data: vec![0u8; 12],
        })
        .await
        .unwrap();

    // two sub-tasks spread over two seconds
    let job = job(900, &["checkPrice", "checkLiquidity"], Duration::from_secs(2));
    log_tx.send(job_log(7, &job)).await.unwrap();

    let mut certified = HashSet::new();
    for _ in 0..2 {
        let certificate = timeout(Duration::from_secs(15), certificates_rx.next())
            .await
            .expect("certificate never arrived")
            .expect("sink closed early");
        assert_eq!(
            certificate.response_digest,
            response_digest(format!("checked:{}", certificate.task_index).as_bytes())
        );
        assert!(certificate.non_signer_pubkeys.is_empty());
        assert_eq!(certificate.quorum_apks.len(), 1);
        certified.insert(certificate.task_index);
    }
    assert_eq!(certified, HashSet::from([0, 1]));

    drop(log_tx);
    run.await.unwrap().unwrap();

    for task_index in [0, 1] {
        let record = network.registry.get_task(task_index).unwrap();
        assert_eq!(record.task_created_block, 7);
        assert_eq!(
            network.aggregation.session_status(task_index),
            Some(SessionStatus::ThresholdReached)
        );
        // both operators signed the same digest, so one entry
        assert_eq!(network.registry.response_count(task_index), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn task_indices_are_global_across_jobs() {
    let (network, events) = keeper_network([33, 34]).await;
    let coordinator =
        coordinator_over(&network, network.endpoint.clone(), Duration::from_secs(10));

    let (mut log_tx, log_rx) = mpsc::channel(16);
    let (certificates_tx, mut certificates_rx) = mpsc::channel(16);
    let run = tokio::spawn(coordinator.run(log_rx, events, certificates_tx));

    // single immediate sub-task each
    log_tx
        .send(job_log(7, &job(1, &["checkPrice"], Duration::ZERO)))
        .await
        .unwrap();
    log_tx
        .send(job_log(8, &job(2, &["rebalance"], Duration::ZERO)))
        .await
        .unwrap();

    let mut certified = HashSet::new();
    for _ in 0..2 {
        let certificate = timeout(Duration::from_secs(10), certificates_rx.next())
            .await
            .expect("certificate never arrived")
            .expect("sink closed early");
        certified.insert(certificate.task_index);
    }
    // the counter continues across jobs instead of restarting
    assert_eq!(certified, HashSet::from([0, 1]));

    drop(log_tx);
    run.await.unwrap().unwrap();
    assert_eq!(network.registry.get_task(0).unwrap().task_created_block, 7);
    assert_eq!(network.registry.get_task(1).unwrap().task_created_block, 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_workers_leave_the_session_to_expire() {
    let (network, events) = keeper_network([35, 36]).await;
    // nobody listens on the discard port
    let coordinator = coordinator_over(
        &network,
        "http://127.0.0.1:9/task".to_string(),
        Duration::from_millis(150),
    );

    let (mut log_tx, log_rx) = mpsc::channel(16);
    let (certificates_tx, mut certificates_rx) = mpsc::channel(16);
    let run = tokio::spawn(coordinator.run(log_rx, events, certificates_tx));

    log_tx
        .send(job_log(9, &job(3, &["checkPrice"], Duration::ZERO)))
        .await
        .unwrap();

    // give the retries and the response window time to play out
    tokio::time::sleep(Duration::from_millis(600)).await;
    drop(log_tx);
    run.await.unwrap().unwrap();

    assert!(network.registry.get_task(0).is_some());
    assert_eq!(network.registry.response_count(0), 0);
    assert_eq!(
        network.aggregation.session_status(0),
        Some(SessionStatus::Expired)
    );
    // no certificate ever surfaced
    assert_eq!(certificates_rx.next().await, None);
}
