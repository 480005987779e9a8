use alloy_primitives::Address;
use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::{select, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;

use crate::aggregation::{AggregationEvent, AggregationService};
use crate::dispatcher::Dispatcher;
use crate::event::{decode_job_event, job_created_topic, RawLog};
use crate::registry::ResponseRegistry;
use crate::scheduler::Scheduler;
use crate::types::{QuorumCertificate, QuorumNum, TaskDescriptor, TaskIndex, TaskRecord};

const STATUS_INTERVAL_SECS: u64 = 60;

// quorum makeup and response window applied to every task
#[derive(Clone, Debug)]
pub struct TaskPolicy {
    pub quorum_numbers: Vec<QuorumNum>,

    pub quorum_threshold_percentages: Vec<u8>,

    pub response_window: Duration,
}

// what one task's registration and fan-out came to
struct TaskRunReport {
    task_index: TaskIndex,
    job_id: u32,
    delivered: usize,
    endpoints: usize,
    failure: Option<String>,
}

// ties the stages together: chain logs in, decoded jobs planned into
// tasks, tasks dispatched on their slots, aggregation outcomes out
// to the submission sink
pub struct Coordinator {
    scheduler: Scheduler,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ResponseRegistry>,
    aggregation: Arc<AggregationService>,

    // contract the log stream is trusted to come from
    contract_addr: Address,

    worker_endpoints: Arc<Vec<String>>,
    policy: TaskPolicy,
}

impl Coordinator {
    pub fn new(
        scheduler: Scheduler,
        dispatcher: Dispatcher,
        registry: Arc<ResponseRegistry>,
        aggregation: Arc<AggregationService>,
        contract_addr: Address,
        worker_endpoints: Vec<String>,
        policy: TaskPolicy,
    ) -> Coordinator {
        Coordinator {
            scheduler,
            dispatcher: Arc::new(dispatcher),
            registry,
            aggregation,
            contract_addr,
            worker_endpoints: Arc::new(worker_endpoints),
            policy,
        }
    }

    // main loop. ends when the log stream closes, then drains
    // in-flight dispatches and shuts the aggregation sessions down.
    pub async fn run(
        self,
        log_stream: mpsc::Receiver<RawLog>,
        aggregation_events: mpsc::Receiver<AggregationEvent>,
        mut certificates_tx: mpsc::Sender<QuorumCertificate>,
    ) -> anyhow::Result<()> {
        let topic = job_created_topic();
        let mut next_task_index: TaskIndex = 0;
        let mut jobs_seen: u64 = 0;
        let mut tasks_launched: u64 = 0;
        let mut certificates_sent: u64 = 0;

        let mut task_runs = FuturesUnordered::new();
        let mut log_stream = log_stream.fuse();
        let mut aggregation_events = aggregation_events.fuse();
        let mut timer_status = IntervalStream::new(
            interval(Duration::from_secs(STATUS_INTERVAL_SECS))
        )
        .fuse();

        loop {
            select! {
                _i = timer_status.select_next_some() => {
                    info!(
                        "status: `{}` live session(s), `{}` dispatch(es) in flight, `{jobs_seen}` job(s) seen",
                        self.aggregation.active_sessions(),
                        task_runs.len()
                    );
                },

                // job events inbound
                maybe_log = log_stream.next() => {
                    let Some(log) = maybe_log else {
                        info!("chain-log stream closed.");
                        break;
                    };
                    if log.topic != topic {
                        debug!("skipped log with foreign topic `{}`", log.topic);
                        continue;
                    }
                    if log.address != self.contract_addr {
                        debug!("skipped log from foreign contract `{}`", log.address);
                        continue;
                    }
                    let job = match decode_job_event(&log.data) {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(
                                "dropped malformed job event from block `{}`: {e}",
                                log.block_number
                            );
                            continue;
                        }
                    };
                    jobs_seen += 1;
                    info!(
                        "job `{}` decoded: type `{}`, `{}` sub-task(s) over {}s",
                        job.job_id,
                        job.job_type,
                        job.sub_task_types.len(),
                        job.timeframe.as_secs()
                    );
                    let plan = match self.scheduler.plan(&job, Utc::now()) {
                        Ok(plan) => plan,
                        Err(e) => {
                            warn!("rejected job `{}`: {e}", job.job_id);
                            continue;
                        }
                    };
                    for task in plan.iter() {
                        let task_index = next_task_index;
                        next_task_index += 1;
                        tasks_launched += 1;
                        task_runs.push(self.launch_task(task, task_index, log.block_number));
                    }
                },

                // finished registrations/fan-outs
                report = task_runs.select_next_some() => {
                    log_task_report(&report);
                },

                // session outcomes
                event = aggregation_events.select_next_some() => {
                    self.take_aggregation_event(
                        event,
                        &mut certificates_tx,
                        &mut certificates_sent
                    ).await;
                },
            }
        }

        if !task_runs.is_empty() {
            info!("draining `{}` in-flight dispatch(es)", task_runs.len());
        }
        while !task_runs.is_empty() {
            select! {
                report = task_runs.select_next_some() => {
                    log_task_report(&report);
                },
                event = aggregation_events.select_next_some() => {
                    self.take_aggregation_event(
                        event,
                        &mut certificates_tx,
                        &mut certificates_sent
                    ).await;
                },
            }
        }
        self.aggregation.shutdown().await;
        info!(
            "coordinator stopped: `{jobs_seen}` job(s), `{tasks_launched}` task(s), `{certificates_sent}` certificate(s)"
        );
        Ok(())
    }

    // register the task at its dispatch slot, open its aggregation
    // session, then fan the descriptor out to every worker at once.
    // the returned future owns everything it touches, so a slow
    // retry loop never blocks the coordinator.
    fn launch_task(
        &self,
        mut task: TaskDescriptor,
        task_index: TaskIndex,
        block_number: u64,
    ) -> impl std::future::Future<Output = TaskRunReport> {
        task.task_id = task_index;
        let record = TaskRecord {
            task_index,
            quorum_numbers: self.policy.quorum_numbers.clone(),
            quorum_threshold_percentages: self.policy.quorum_threshold_percentages.clone(),
            task_created_block: block_number,
        };
        let response_window = self.policy.response_window;
        let registry = self.registry.clone();
        let aggregation = self.aggregation.clone();
        let dispatcher = self.dispatcher.clone();
        let endpoints = self.worker_endpoints.clone();
        async move {
            let wait = (task.dispatch_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            let mut report = TaskRunReport {
                task_index,
                job_id: task.job_id,
                delivered: 0,
                endpoints: endpoints.len(),
                failure: None,
            };
            if !registry.put_task(record.clone()) {
                report.failure = Some("task index already registered".to_string());
                return report;
            }
            if let Err(e) = aggregation.initialize_task(record, response_window).await {
                report.failure = Some(e.to_string());
                return report;
            }
            let deliveries = futures::future::join_all(
                endpoints.iter().map(|endpoint| dispatcher.dispatch(&task, endpoint)),
            )
            .await;
            for undelivered in deliveries.iter().filter_map(|d| d.as_ref().err()) {
                warn!("{undelivered}");
            }
            report.delivered = deliveries.iter().filter(|d| d.is_ok()).count();
            report
        }
    }

    async fn take_aggregation_event(
        &self,
        event: AggregationEvent,
        certificates_tx: &mut mpsc::Sender<QuorumCertificate>,
        certificates_sent: &mut u64,
    ) {
        match event {
            AggregationEvent::Completed(certificate) => {
                info!(
                    "task `{}` certified: digest `{}`, `{}` non-signer(s)",
                    certificate.task_index,
                    certificate.response_digest,
                    certificate.non_signer_pubkeys.len()
                );
                if certificates_tx.send(certificate).await.is_err() {
                    warn!("submission sink closed, certificate dropped");
                } else {
                    *certificates_sent += 1;
                }
            }
            AggregationEvent::AssemblyFailed { task_index, error } => {
                error!("task `{task_index}` failed: aggregate proof assembly: {error}");
            }
            AggregationEvent::Expired { task_index } => {
                warn!(
                    "task `{task_index}` expired with `{}` response(s) on record",
                    self.registry.response_count(task_index)
                );
            }
        }
    }
}

fn log_task_report(report: &TaskRunReport) {
    if let Some(failure) = &report.failure {
        error!(
            "task `{}` of job `{}` not tracked: {failure}",
            report.task_index, report.job_id
        );
    } else if report.delivered == 0 {
        warn!(
            "task `{}` of job `{}` undelivered to all `{}` worker(s)",
            report.task_index, report.job_id, report.endpoints
        );
    } else {
        info!(
            "task `{}` of job `{}` delivered to `{}`/`{}` worker(s)",
            report.task_index, report.job_id, report.delivered, report.endpoints
        );
    }
}
