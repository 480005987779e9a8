use log::{debug, warn};
use std::time::Duration;
use thiserror::Error;

use crate::types::{TaskDescriptor, TaskIndex, TaskRequest};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    // fixed pause between attempts, no jitter
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    // five tries two seconds apart, the cadence workers are built
    // around
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {task_index} undelivered to `{endpoint}` after {attempts} attempts: {last_error}")]
pub struct DispatchExhaustedError {
    pub task_index: TaskIndex,

    pub endpoint: String,

    pub attempts: u32,

    pub last_error: String,
}

// posts task descriptors to worker endpoints. each dispatch runs as
// its own future, so a retrying delivery never holds up ingestion
// or aggregation.
pub struct Dispatcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy) -> Dispatcher {
        Dispatcher {
            client: reqwest::Client::new(),
            policy,
        }
    }

    // deliver one task to one worker; transport failures and
    // non-success statuses both count as failed attempts
    pub async fn dispatch(
        &self,
        task: &TaskDescriptor,
        endpoint: &str,
    ) -> Result<(), DispatchExhaustedError> {
        let request = TaskRequest::from_descriptor(task);
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            match self.try_send(&request, endpoint).await {
                Ok(()) => {
                    debug!(
                        "task `{}` delivered to `{endpoint}` on attempt {attempt}",
                        task.task_id
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "task `{}` attempt {attempt}/{} to `{endpoint}` failed: {e}",
                        task.task_id, self.policy.max_attempts
                    );
                    last_error = e;
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }
        Err(DispatchExhaustedError {
            task_index: task.task_id,
            endpoint: endpoint.to_string(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn try_send(&self, request: &TaskRequest, endpoint: &str) -> Result<(), String> {
        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
