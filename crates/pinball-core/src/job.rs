//! Job and event payloads carried in token data.
//!
//! Payloads are JSON records; the master never looks inside them. A job's
//! execution history is first-class: every run records the exact event
//! tokens it consumed, so re-running a failed execution is a re-post of the
//! same events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The job ran and succeeded.
    Success,
    /// The job ran and failed.
    Failure,
    /// The job was short-circuited by an abort signal.
    Aborted,
    /// The job was disabled and marked successful without running.
    Skipped,
}

impl ExecutionOutcome {
    /// Whether downstream events are posted for this outcome.
    pub fn posts_events(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// One entry in a job's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Identity of the worker that ran the job.
    pub worker: String,

    /// Unix seconds when the execution started.
    pub start_time: i64,

    /// Unix seconds when the execution ended.
    pub end_time: i64,

    /// How the execution ended.
    pub outcome: ExecutionOutcome,

    /// Names of the event tokens consumed by this execution.
    #[serde(default)]
    pub events: Vec<String>,

    /// Free-form executor output (exit status, log tail).
    #[serde(default)]
    pub info: String,
}

/// Payload of a job token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// What to execute; interpreted by the job executor, not by pinball.
    pub command: String,

    /// Upstream job names (or external input labels) feeding this job. A
    /// run consumes exactly one event from each.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Downstream job names armed by this job's events.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// A disabled job is marked successful without executing.
    #[serde(default)]
    pub disabled: bool,

    /// Executions attempted before the job gives up re-arming itself.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Past executions, oldest first.
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
}

fn default_max_attempts() -> u32 {
    1
}

impl JobData {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: vec![],
            outputs: vec![],
            disabled: false,
            max_attempts: default_max_attempts(),
            history: vec![],
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Executions attempted so far (aborted runs do not count against the
    /// retry budget).
    pub fn attempts(&self) -> u32 {
        self.history
            .iter()
            .filter(|r| r.outcome != ExecutionOutcome::Aborted)
            .count() as u32
    }

    /// Whether a failed job may re-arm itself for another attempt.
    pub fn retries_left(&self) -> bool {
        self.attempts() < self.max_attempts
    }
}

/// Payload of an event token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Name of the job (or external source) that posted the event.
    pub creator: String,

    /// Free-form attributes forwarded to the consumer.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl EventData {
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_data_round_trip() {
        let mut job = JobData::new("true");
        job.inputs = vec!["extract".to_string()];
        job.outputs = vec!["report".to_string()];
        job.history.push(ExecutionRecord {
            worker: "w1".to_string(),
            start_time: 10,
            end_time: 20,
            outcome: ExecutionOutcome::Failure,
            events: vec!["/workflow/w/i/job/runnable/j/extract/e1".to_string()],
            info: "exit 1".to_string(),
        });

        let decoded = JobData::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_retry_budget_ignores_aborts() {
        let mut job = JobData::new("true");
        job.max_attempts = 2;
        assert!(job.retries_left());

        let record = |outcome| ExecutionRecord {
            worker: "w".to_string(),
            start_time: 0,
            end_time: 0,
            outcome,
            events: vec![],
            info: String::new(),
        };

        job.history.push(record(ExecutionOutcome::Aborted));
        assert_eq!(job.attempts(), 0);

        job.history.push(record(ExecutionOutcome::Failure));
        assert!(job.retries_left());

        job.history.push(record(ExecutionOutcome::Failure));
        assert!(!job.retries_left());
    }

    #[test]
    fn test_posting_outcomes() {
        assert!(ExecutionOutcome::Success.posts_events());
        assert!(ExecutionOutcome::Skipped.posts_events());
        assert!(!ExecutionOutcome::Failure.posts_events());
        assert!(!ExecutionOutcome::Aborted.posts_events());
    }
}
