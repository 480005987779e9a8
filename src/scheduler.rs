use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{JobDescriptor, TaskDescriptor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidScheduleError {
    #[error("job {job_id} has no sub-tasks to schedule")]
    NoSubTasks { job_id: u32 },

    #[error("job {job_id} timeframe of {timeframe_secs}s is too short to spread {count} sub-tasks")]
    IntervalTooShort {
        job_id: u32,
        timeframe_secs: u64,
        count: usize,
    },
}

// spreads a job's sub-tasks evenly across its timeframe, one-shot
// absolute dispatch times, whole-second arithmetic
pub struct Scheduler {
    // chain target stamped onto every task
    chain_id: u64,

    contract_addr: Address,
}

impl Scheduler {
    pub fn new(chain_id: u64, contract_addr: Address) -> Scheduler {
        Scheduler {
            chain_id,
            contract_addr,
        }
    }

    // validate the job and lay out its dispatch times; the i-th
    // sub-task goes out at now + i * (timeframe / count)
    pub fn plan(
        &self,
        job: &JobDescriptor,
        now: DateTime<Utc>,
    ) -> Result<TaskPlan, InvalidScheduleError> {
        let count = job.sub_task_types.len();
        if count == 0 {
            return Err(InvalidScheduleError::NoSubTasks { job_id: job.job_id });
        }
        let timeframe_secs = job.timeframe.as_secs();
        let interval_secs = timeframe_secs / count as u64;
        if interval_secs == 0 && count > 1 {
            return Err(InvalidScheduleError::IntervalTooShort {
                job_id: job.job_id,
                timeframe_secs,
                count,
            });
        }
        Ok(TaskPlan {
            job_id: job.job_id,
            chain_id: self.chain_id,
            contract_addr: self.contract_addr,
            sub_task_types: job.sub_task_types.clone(),
            start: now,
            interval_secs,
        })
    }
}

// lazy dispatch layout for one job; iterating never mutates the
// plan, so it can be walked again after a restart
#[derive(Clone, Debug)]
pub struct TaskPlan {
    job_id: u32,

    chain_id: u64,

    contract_addr: Address,

    sub_task_types: Vec<String>,

    start: DateTime<Utc>,

    interval_secs: u64,
}

impl TaskPlan {
    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    pub fn len(&self) -> usize {
        self.sub_task_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_task_types.is_empty()
    }

    // task ids here are job-local ordinals; the coordinator rebinds
    // them to global task indices at registration
    fn descriptor(&self, ordinal: usize) -> TaskDescriptor {
        let delay = ordinal as u64 * self.interval_secs;
        TaskDescriptor {
            job_id: self.job_id,
            task_id: ordinal as u32,
            chain_id: self.chain_id,
            contract_addr: self.contract_addr,
            target_function: self.sub_task_types[ordinal].clone(),
            dispatch_at: self.start + chrono::Duration::seconds(delay as i64),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskDescriptor> + '_ {
        (0..self.len()).map(|ordinal| self.descriptor(ordinal))
    }
}

impl<'p> IntoIterator for &'p TaskPlan {
    type Item = TaskDescriptor;
    type IntoIter = Box<dyn Iterator<Item = TaskDescriptor> + 'p>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(31337, address!("5fbdb2315678afecb367f032d93f642f64180aa3"))
    }

    fn job(timeframe_secs: u64, sub_task_types: &[&str]) -> JobDescriptor {
        JobDescriptor {
            job_id: 9,
            job_type: "watch".to_string(),
            job_description: "poll and report".to_string(),
            resource_url: "https://jobs.example/9".to_string(),
            timeframe: Duration::from_secs(timeframe_secs),
            sub_task_types: sub_task_types.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn three_tasks_spread_over_ninety_seconds() {
        let now = Utc::now();
        let plan = scheduler()
            .plan(&job(90, &["fetch", "report", "verify"]), now)
            .unwrap();
        let offsets: Vec<i64> = plan
            .iter()
            .map(|t| (t.dispatch_at - now).num_seconds())
            .collect();
        assert_eq!(offsets, vec![0, 30, 60]);
        let functions: Vec<String> = plan.iter().map(|t| t.target_function).collect();
        assert_eq!(functions, vec!["fetch", "report", "verify"]);
    }

    #[test]
    fn five_tasks_in_three_seconds_are_rejected() {
        let err = scheduler()
            .plan(&job(3, &["a", "b", "c", "d", "e"]), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            InvalidScheduleError::IntervalTooShort {
                job_id: 9,
                timeframe_secs: 3,
                count: 5,
            }
        );
    }

    #[test]
    fn job_without_sub_tasks_is_rejected() {
        let err = scheduler().plan(&job(60, &[]), Utc::now()).unwrap_err();
        assert_eq!(err, InvalidScheduleError::NoSubTasks { job_id: 9 });
    }

    #[test]
    fn single_task_dispatches_immediately_even_with_zero_timeframe() {
        let now = Utc::now();
        let plan = scheduler().plan(&job(0, &["ping"]), now).unwrap();
        let tasks: Vec<TaskDescriptor> = plan.iter().collect();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].dispatch_at, now);
    }

    #[test]
    fn plan_can_be_walked_twice_with_identical_output() {
        let plan = scheduler()
            .plan(&job(120, &["a", "b", "c", "d"]), Utc::now())
            .unwrap();
        let first: Vec<TaskDescriptor> = plan.iter().collect();
        let second: Vec<TaskDescriptor> = plan.iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn tasks_carry_the_configured_chain_target() {
        let plan = scheduler().plan(&job(10, &["a"]), Utc::now()).unwrap();
        let task = plan.iter().next().unwrap();
        assert_eq!(task.chain_id, 31337);
        assert_eq!(
            task.contract_addr,
            address!("5fbdb2315678afecb367f032d93f642f64180aa3")
        );
        assert_eq!(task.task_id, 0);
        assert_eq!(task.job_id, 9);
    }
}
