use dashmap::DashMap;
use std::collections::HashMap;

use crate::types::{ResponseDigest, SignedResponse, TaskIndex, TaskRecord};

// in-memory task and response store. both maps are sharded, so
// writers for unrelated task indices never contend on one lock and
// readers always observe whole values.
pub struct ResponseRegistry {
    tasks: DashMap<TaskIndex, TaskRecord>,

    // responses keyed by (task index, digest); the inner map is
    // guarded by its task's shard
    responses: DashMap<TaskIndex, HashMap<ResponseDigest, SignedResponse>>,
}

impl ResponseRegistry {
    pub fn new() -> ResponseRegistry {
        ResponseRegistry {
            tasks: DashMap::new(),
            responses: DashMap::new(),
        }
    }

    // write-once: the first record for an index wins, a duplicate is
    // reported back so the caller can flag it
    pub fn put_task(&self, record: TaskRecord) -> bool {
        match self.tasks.entry(record.task_index) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn get_task(&self, task_index: TaskIndex) -> Option<TaskRecord> {
        self.tasks.get(&task_index).map(|r| r.clone())
    }

    // last write wins; the displaced response is handed back
    pub fn put_response(&self, response: SignedResponse) -> Option<SignedResponse> {
        self.responses
            .entry(response.task_index)
            .or_default()
            .insert(response.response_digest, response)
    }

    pub fn get_response(
        &self,
        task_index: TaskIndex,
        digest: ResponseDigest,
    ) -> Option<SignedResponse> {
        self.responses
            .get(&task_index)
            .and_then(|m| m.get(&digest).cloned())
    }

    // every response recorded for a task, any digest
    pub fn task_responses(&self, task_index: TaskIndex) -> Vec<SignedResponse> {
        self.responses
            .get(&task_index)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn response_count(&self, task_index: TaskIndex) -> usize {
        self.responses.get(&task_index).map_or(0, |m| m.len())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        ResponseRegistry::new()
    }
}
