//! The hierarchical name scheme.
//!
//! A job's lifecycle state is encoded by its position in the name hierarchy,
//! not by a field in its payload, so prefix scans double as "list of runnable
//! jobs". The layout:
//!
//! ```text
//! /workflow/<W>/<INSTANCE>/job/<state>/<job>                      job token
//! /workflow/<W>/<INSTANCE>/job/<state>/<job>/<input>/<event>      event token
//! /workflow/<W>/<INSTANCE>/__SIGNAL__/<kind>                      instance signal
//! /__SIGNAL__/exit                                                global exit signal
//! /schedule/workflow/<W>                                          schedule token
//! /__ARCHIVE__<name>                                              archived token
//! ```
//!
//! Events always live under the same `<state>` directory as their job token;
//! arming a job moves its pending events runnable-side in the same batch.

use serde::{Deserialize, Serialize};

/// Prefix under which all live workflow tokens reside.
pub const WORKFLOW_PREFIX: &str = "/workflow/";

/// Prefix prepended to a token's name when it is archived.
pub const ARCHIVE_PREFIX: &str = "/__ARCHIVE__";

/// Prefix under which schedule tokens reside, outside `/workflow/` so the
/// worker claim loop never sees them.
pub const SCHEDULE_PREFIX: &str = "/schedule/workflow/";

/// Directory segment holding signal tokens.
pub const SIGNAL_DIR: &str = "__SIGNAL__";

/// Name of the global worker exit signal, outside `/workflow/`.
pub const EXIT_SIGNAL: &str = "/__SIGNAL__/exit";

/// Location of a job token within its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting on input events; parked, never claimed.
    Waiting,
    /// Ready to run (unowned) or running (owned).
    Runnable,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Runnable => "runnable",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "runnable" => Some(Self::Runnable),
            _ => None,
        }
    }
}

/// Kinds of signal tokens consulted by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Stop further claim-and-runs in the instance; running jobs complete.
    Drain,
    /// Short-circuit running jobs to failure and post no events.
    Abort,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Abort => "abort",
        }
    }
}

/// Parsed name of a job token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobName {
    pub workflow: String,
    pub instance: String,
    pub state: JobState,
    pub job: String,
}

impl JobName {
    pub fn new(
        workflow: impl Into<String>,
        instance: impl Into<String>,
        state: JobState,
        job: impl Into<String>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            instance: instance.into(),
            state,
            job: job.into(),
        }
    }

    /// `/workflow/<W>/<I>/job/<state>/<job>`
    pub fn token_name(&self) -> String {
        format!(
            "{}{}/{}/job/{}/{}",
            WORKFLOW_PREFIX,
            self.workflow,
            self.instance,
            self.state.as_str(),
            self.job
        )
    }

    /// Parse a token name; `None` for anything that is not a job token.
    pub fn parse(name: &str) -> Option<Self> {
        let parts = split_workflow_name(name)?;
        match parts.as_slice() {
            [workflow, instance, "job", state, job] => Some(Self {
                workflow: workflow.to_string(),
                instance: instance.to_string(),
                state: JobState::parse(state)?,
                job: job.to_string(),
            }),
            _ => None,
        }
    }

    /// The same job under a different state directory.
    pub fn with_state(&self, state: JobState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Prefix of the event tokens for one input of this job, e.g.
    /// `/workflow/W/I/job/runnable/J/upstream/`.
    pub fn input_prefix(&self, input: &str) -> String {
        format!("{}/{}/", self.token_name(), input)
    }

    /// `/workflow/<W>/<I>/` — the instance this job belongs to.
    pub fn instance_prefix(&self) -> String {
        instance_prefix(&self.workflow, &self.instance)
    }
}

/// Parsed name of an event token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventName {
    pub job: JobName,
    pub input: String,
    pub event: String,
}

impl EventName {
    pub fn new(job: JobName, input: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            job,
            input: input.into(),
            event: event.into(),
        }
    }

    /// `/workflow/<W>/<I>/job/<state>/<job>/<input>/<event>`
    pub fn token_name(&self) -> String {
        format!("{}/{}/{}", self.job.token_name(), self.input, self.event)
    }

    /// Parse a token name; `None` for anything that is not an event token.
    pub fn parse(name: &str) -> Option<Self> {
        let parts = split_workflow_name(name)?;
        match parts.as_slice() {
            [workflow, instance, "job", state, job, input, event] => Some(Self {
                job: JobName {
                    workflow: workflow.to_string(),
                    instance: instance.to_string(),
                    state: JobState::parse(state)?,
                    job: job.to_string(),
                },
                input: input.to_string(),
                event: event.to_string(),
            }),
            _ => None,
        }
    }

    /// The same event re-homed under its job's other state directory.
    pub fn with_state(&self, state: JobState) -> Self {
        Self {
            job: self.job.with_state(state),
            ..self.clone()
        }
    }
}

fn split_workflow_name(name: &str) -> Option<Vec<&str>> {
    let rest = name.strip_prefix(WORKFLOW_PREFIX)?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

/// `/workflow/<W>/`
pub fn workflow_prefix(workflow: &str) -> String {
    format!("{}{}/", WORKFLOW_PREFIX, workflow)
}

/// `/workflow/<W>/<I>/`
pub fn instance_prefix(workflow: &str, instance: &str) -> String {
    format!("{}{}/{}/", WORKFLOW_PREFIX, workflow, instance)
}

/// `/workflow/<W>/<I>/job/<state>/`
pub fn job_state_prefix(workflow: &str, instance: &str, state: JobState) -> String {
    format!(
        "{}job/{}/",
        instance_prefix(workflow, instance),
        state.as_str()
    )
}

/// `/workflow/<W>/<I>/__SIGNAL__/<kind>`
pub fn instance_signal(workflow: &str, instance: &str, kind: SignalKind) -> String {
    format!(
        "{}{}/{}",
        instance_prefix(workflow, instance),
        SIGNAL_DIR,
        kind.as_str()
    )
}

/// `/schedule/workflow/<W>`
pub fn schedule_token_name(workflow: &str) -> String {
    format!("{}{}", SCHEDULE_PREFIX, workflow)
}

/// The archive-side name of a live token: `/__ARCHIVE__<name>`.
pub fn archived(name: &str) -> String {
    format!("{}{}", ARCHIVE_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_round_trip() {
        let job = JobName::new("daily", "inst-1", JobState::Runnable, "extract");
        let name = job.token_name();
        assert_eq!(name, "/workflow/daily/inst-1/job/runnable/extract");
        assert_eq!(JobName::parse(&name), Some(job));
    }

    #[test]
    fn test_event_name_round_trip() {
        let job = JobName::new("daily", "inst-1", JobState::Waiting, "load");
        let event = EventName::new(job, "extract", "ev-42");
        let name = event.token_name();
        assert_eq!(name, "/workflow/daily/inst-1/job/waiting/load/extract/ev-42");
        assert_eq!(EventName::parse(&name), Some(event));
    }

    #[test]
    fn test_job_parse_rejects_foreign_names() {
        assert_eq!(JobName::parse("/schedule/workflow/daily"), None);
        assert_eq!(JobName::parse("/workflow/daily/inst-1/__SIGNAL__/drain"), None);
        assert_eq!(JobName::parse("/workflow/daily/inst-1/job/paused/j"), None);
        // An event token is not a job token.
        assert_eq!(
            JobName::parse("/workflow/daily/inst-1/job/waiting/j/in/ev"),
            None
        );
        assert_eq!(JobName::parse("/workflow/daily//job/waiting/j"), None);
    }

    #[test]
    fn test_state_move_preserves_identity() {
        let job = JobName::new("w", "i", JobState::Waiting, "j");
        let moved = job.with_state(JobState::Runnable);
        assert_eq!(moved.token_name(), "/workflow/w/i/job/runnable/j");
        assert_eq!(moved.job, "j");
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(workflow_prefix("w"), "/workflow/w/");
        assert_eq!(
            job_state_prefix("w", "i", JobState::Runnable),
            "/workflow/w/i/job/runnable/"
        );
        assert_eq!(
            instance_signal("w", "i", SignalKind::Abort),
            "/workflow/w/i/__SIGNAL__/abort"
        );
        assert_eq!(schedule_token_name("w"), "/schedule/workflow/w");
        assert_eq!(
            archived("/workflow/w/i/job/waiting/j"),
            "/__ARCHIVE__/workflow/w/i/job/waiting/j"
        );
    }
}
