//! Schedule token payloads and overrun policy.

use serde::{Deserialize, Serialize};

/// What the scheduler does when a workflow comes due while instances of it
/// are still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Start the new instance regardless.
    StartNew,
    /// Skip this occurrence and advance to the next.
    Skip,
    /// Abort the running instances, then start.
    AbortRunning,
    /// Hold this occurrence until no instance is running.
    Delay,
    /// Hold until no instance is running and the last one succeeded.
    DelayUntilSuccess,
}

/// What the overrun policy decided for one due occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunDecision {
    /// Start a new instance now.
    Start,
    /// Abort running instances, then start.
    AbortThenStart,
    /// Do not start; advance `next_run_time` to the next occurrence.
    SkipOccurrence,
    /// Do not start; keep `next_run_time` and retry later.
    Hold,
}

impl OverrunPolicy {
    /// Decide what to do given how many instances are live and, where known,
    /// whether the workflow's most recent instance succeeded.
    pub fn decide(&self, running: usize, last_succeeded: Option<bool>) -> OverrunDecision {
        if running == 0 {
            return match self {
                OverrunPolicy::DelayUntilSuccess if last_succeeded == Some(false) => {
                    OverrunDecision::Hold
                }
                _ => OverrunDecision::Start,
            };
        }
        match self {
            OverrunPolicy::StartNew => OverrunDecision::Start,
            OverrunPolicy::Skip => OverrunDecision::SkipOccurrence,
            OverrunPolicy::AbortRunning => OverrunDecision::AbortThenStart,
            OverrunPolicy::Delay | OverrunPolicy::DelayUntilSuccess => OverrunDecision::Hold,
        }
    }
}

/// Payload of a schedule token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    /// Workflow this schedule starts.
    pub workflow: String,

    /// Unix seconds of the next due occurrence.
    pub next_run_time: i64,

    /// Seconds between occurrences.
    pub recurrence_seconds: i64,

    /// Policy applied when instances are still running at the due time.
    pub overrun_policy: OverrunPolicy,

    /// Hard cap on live instances; at the cap an occurrence is held
    /// regardless of the overrun policy.
    #[serde(default)]
    pub max_running_instances: Option<u32>,
}

impl ScheduleData {
    /// Whether the instance cap forbids starting another one.
    pub fn at_capacity(&self, running: usize) -> bool {
        self.max_running_instances
            .is_some_and(|cap| running >= cap as usize)
    }

    /// Advance past `now` in whole recurrence steps, never landing in the
    /// past.
    pub fn advance(&mut self, now: i64) {
        let step = self.recurrence_seconds.max(1);
        while self.next_run_time <= now {
            self.next_run_time += step;
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_run_time <= now
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
