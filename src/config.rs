use alloy_primitives::Address;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::RetryPolicy;
use crate::operators::OperatorState;
use crate::signing::operator_id_from_pubkey;
use crate::types::{PubKey, QuorumNum};

// responses stay open for ~100 blocks at a 12s cadence unless tuned
const DEFAULT_RESPONSE_WINDOW_SECS: u64 = 1_200;

#[derive(Debug, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,

    // contract whose job events the watcher forwards
    pub task_contract: Address,

    pub redis_url: String,

    // redis stream the chain watcher publishes logs on
    pub log_stream: String,
}

#[derive(Debug, Deserialize)]
pub struct RpcConfig {
    // host:port the signed-response server binds
    pub listen_address: String,
}

#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    pub worker_endpoints: Vec<String>,

    pub max_attempts: Option<u32>,

    pub backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AggregationConfig {
    pub quorum_numbers: Vec<QuorumNum>,

    pub quorum_threshold_percentages: Vec<u8>,

    pub response_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct OperatorConfig {
    // hex-encoded public key, scheme-defined length
    pub pubkey: String,

    pub stake: u64,

    pub quorums: Vec<QuorumNum>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,

    pub rpc: RpcConfig,

    pub dispatch: DispatchConfig,

    pub aggregation: AggregationConfig,

    pub operators: Vec<OperatorConfig>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no worker endpoints configured")]
    NoWorkerEndpoints,

    #[error("{quorums} quorum numbers paired with {thresholds} thresholds")]
    MismatchedThresholds { quorums: usize, thresholds: usize },

    #[error("quorum {quorum} threshold {pct}% is outside 1..=100")]
    ThresholdOutOfRange { quorum: QuorumNum, pct: u8 },

    #[error("no operators configured")]
    NoOperators,

    #[error("operator {index} pubkey is not valid hex: {reason}")]
    BadPubkey { index: usize, reason: String },

    #[error("required quorum {quorum} has no registered operators")]
    EmptyQuorum { quorum: QuorumNum },
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{path}`"))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("failed to parse config `{path}`"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.worker_endpoints.is_empty() {
            return Err(ConfigError::NoWorkerEndpoints);
        }
        let quorums = self.aggregation.quorum_numbers.len();
        let thresholds = self.aggregation.quorum_threshold_percentages.len();
        if quorums != thresholds {
            return Err(ConfigError::MismatchedThresholds { quorums, thresholds });
        }
        for (&quorum, &pct) in self
            .aggregation
            .quorum_numbers
            .iter()
            .zip(&self.aggregation.quorum_threshold_percentages)
        {
            if pct == 0 || pct > 100 {
                return Err(ConfigError::ThresholdOutOfRange { quorum, pct });
            }
        }
        if self.operators.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        let states = self.operator_states()?;
        for &quorum in &self.aggregation.quorum_numbers {
            if states.get(&quorum).map_or(true, |ops| ops.is_empty()) {
                return Err(ConfigError::EmptyQuorum { quorum });
            }
        }
        Ok(())
    }

    // decode the configured operator set into per-quorum states, the
    // shape the static registry wants
    pub fn operator_states(&self) -> Result<HashMap<QuorumNum, Vec<OperatorState>>, ConfigError> {
        let mut states: HashMap<QuorumNum, Vec<OperatorState>> = HashMap::new();
        for (index, operator) in self.operators.iter().enumerate() {
            let bytes = hex::decode(operator.pubkey.trim_start_matches("0x")).map_err(|e| {
                ConfigError::BadPubkey {
                    index,
                    reason: e.to_string(),
                }
            })?;
            let pubkey = PubKey(bytes);
            let state = OperatorState {
                operator_id: operator_id_from_pubkey(&pubkey),
                pubkey,
                stake: operator.stake,
            };
            for &quorum in &operator.quorums {
                states.entry(quorum).or_default().push(state.clone());
            }
        }
        Ok(states)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.dispatch.max_attempts.unwrap_or(defaults.max_attempts),
            backoff: self
                .dispatch
                .backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff),
        }
    }

    pub fn response_window(&self) -> Duration {
        Duration::from_secs(
            self.aggregation
                .response_window_secs
                .unwrap_or(DEFAULT_RESPONSE_WINDOW_SECS),
        )
    }
}
