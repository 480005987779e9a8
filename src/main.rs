#![doc = include_str!("../README.md")]

use alloy_primitives::{Address, B256};
use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use futures::{
    channel::mpsc,
    prelude::sink::SinkExt,
    stream::StreamExt,
};
use log::{error, info, warn};
use redis::Value::BulkString;
use std::{sync::Arc, time::Duration};
use tokio::task;

use keeper_aggregator::{
    aggregation::AggregationService,
    config::Config,
    coordinator::{Coordinator, TaskPolicy},
    dispatcher::Dispatcher,
    event::RawLog,
    operators::{OperatorRegistry, StaticOperatorRegistry},
    registry::ResponseRegistry,
    rpc::{self, AppState},
    scheduler::Scheduler,
    signing::{Ed25519Scheme, SignatureScheme},
    types::QuorumCertificate,
};

// CLI
#[derive(Parser, Debug)]
#[command(name = "Keeper network aggregator")]
#[command(author = "Keeper network team")]
#[command(version = "1.0")]
#[command(about = "Schedules keeper tasks from on-chain job events and aggregates \
                   operator signatures into quorum certificates.",
          long_about = None
)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let cli = Cli::parse();
    info!("<-> Keeper network task aggregator <->");

    let config_path = cli.config_file.unwrap_or_else(|| "aggregator.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Serving chain `{}`, task contract `{}`, `{}` worker endpoint(s)",
        config.chain.chain_id,
        config.chain.task_contract,
        config.dispatch.worker_endpoints.len()
    );

    // chain logs come in over a redis stream fed by the watcher
    let redis_client = redis::Client::open(config.chain.redis_url.as_str())?;
    let redis_con = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to the redis log stream")?;
    let (feeder, log_stream) =
        subscribe_to_log_stream(redis_con, config.chain.log_stream.clone());

    let registry = Arc::new(ResponseRegistry::new());
    let scheme: Arc<dyn SignatureScheme> = Arc::new(Ed25519Scheme);
    let operators: Arc<dyn OperatorRegistry> =
        Arc::new(StaticOperatorRegistry::new(config.operator_states()?));
    let (aggregation, aggregation_events) =
        AggregationService::new(scheme, operators, registry.clone());

    // worker-facing rpc surface
    let app_state = Arc::new(AppState {
        aggregation: aggregation.clone(),
        registry: registry.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.rpc.listen_address)
        .await
        .with_context(|| {
            format!("failed to bind rpc listener on `{}`", config.rpc.listen_address)
        })?;
    info!("Signed-response server listening on `{}`", config.rpc.listen_address);
    task::spawn(async move {
        if let Err(e) = axum::serve(listener, rpc::router(app_state)).await {
            error!("rpc server stopped: {e}");
        }
    });

    // submission sink stub: the chain writer is external, so ready
    // certificates are logged for pickup
    let (certificates_tx, mut certificates_rx) = mpsc::channel::<QuorumCertificate>(32);
    task::spawn(async move {
        while let Some(certificate) = certificates_rx.next().await {
            match serde_json::to_string(&certificate) {
                Ok(body) => info!(
                    "certificate for task `{}` ready for submission: {body}",
                    certificate.task_index
                ),
                Err(e) => error!(
                    "certificate for task `{}` unserializable: {e}",
                    certificate.task_index
                ),
            }
        }
    });

    let scheduler = Scheduler::new(config.chain.chain_id, config.chain.task_contract);
    let dispatcher = Dispatcher::new(config.retry_policy());
    let policy = TaskPolicy {
        quorum_numbers: config.aggregation.quorum_numbers.clone(),
        quorum_threshold_percentages: config.aggregation.quorum_threshold_percentages.clone(),
        response_window: config.response_window(),
    };
    let coordinator = Coordinator::new(
        scheduler,
        dispatcher,
        registry,
        aggregation,
        config.chain.task_contract,
        config.dispatch.worker_endpoints.clone(),
        policy,
    );

    // ctrl-c ends the feeder; the closed stream drains the loop
    task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received.");
            feeder.abort();
        }
    });

    coordinator.run(log_stream, aggregation_events, certificates_tx).await
}

// tail the watcher's redis stream and feed raw logs into a bounded
// channel; unreadable entries are skipped with a warning
fn subscribe_to_log_stream(
    mut redis_con: redis::aio::MultiplexedConnection,
    stream_name: String,
) -> (task::JoinHandle<()>, mpsc::Receiver<RawLog>) {
    let (mut tx, rx) = mpsc::channel(32);
    let handle = task::spawn(async move {
        let mut last_id = "0".to_string();
        loop {
            let result: redis::Value = match redis::cmd("XREAD")
                .arg("BLOCK").arg(0)
                .arg("STREAMS").arg(&stream_name).arg(&last_id)
                .query_async(&mut redis_con)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    warn!("chain-log read failed: `{e}`, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            for log in parse_stream_entries(&result, &mut last_id) {
                if tx.send(log).await.is_err() {
                    return;
                }
            }
        }
    });
    (handle, rx)
}

fn parse_stream_entries(result: &redis::Value, last_id: &mut String) -> Vec<RawLog> {
    let mut logs = Vec::new();
    let Some(streams) = result.as_sequence() else {
        return logs;
    };
    for stream in streams {
        let Some(contents) = stream.as_sequence() else {
            continue;
        };
        let Some(entries) = contents.get(1).and_then(|e| e.as_sequence()) else {
            continue;
        };
        for entry in entries {
            let Some(items) = entry.as_sequence() else {
                continue;
            };
            if let Some(BulkString(bs)) = items.first() {
                *last_id = String::from_utf8_lossy(bs).into_owned();
            }
            let Some(fields) = items.get(1).and_then(|f| f.as_sequence()) else {
                continue;
            };
            match parse_log_fields(fields) {
                Ok(log) => logs.push(log),
                Err(e) => warn!("skipped unreadable log entry: {e}"),
            }
        }
    }
    logs
}

// entries carry flat key/value pairs: address, topic, block, data
fn parse_log_fields(fields: &[redis::Value]) -> anyhow::Result<RawLog> {
    let mut address: Option<Address> = None;
    let mut topic: Option<B256> = None;
    let mut block: Option<u64> = None;
    let mut data: Option<Vec<u8>> = None;
    for pair in fields.chunks(2) {
        let [BulkString(key), BulkString(value)] = pair else {
            continue;
        };
        let key = String::from_utf8_lossy(key);
        let value = String::from_utf8_lossy(value);
        match key.as_ref() {
            "address" => address = Some(value.parse()?),
            "topic" => topic = Some(value.parse()?),
            "block" => block = Some(value.parse()?),
            "data" => data = Some(hex::decode(value.trim_start_matches("0x"))?),
            _ => {}
        }
    }
    Ok(RawLog {
        address: address.context("log entry missing `address`")?,
        topic: topic.context("log entry missing `topic`")?,
        block_number: block.context("log entry missing `block`")?,
        data: data.context("log entry missing `data`")?,
    })
}
