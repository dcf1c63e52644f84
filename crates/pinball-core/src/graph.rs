//! Workflow graphs: the definition-parser contract.
//!
//! A graph is the parsed form of a user workflow configuration: named jobs
//! wired by input/output edges. The parser proper (config file formats,
//! templating) lives outside the core; what the runtime needs is a validated
//! graph that can emit the initial token batch of a new instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobData;
use crate::name::{JobName, JobState};
use crate::token::Token;

/// One job in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// What to execute; handed to the job executor verbatim.
    pub command: String,

    /// Upstream job names. A job with no inputs starts runnable.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Downstream job names.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Disabled jobs are marked successful without executing.
    #[serde(default)]
    pub disabled: bool,

    /// Executions attempted before the job stops re-arming itself.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    1
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: vec![],
            outputs: vec![],
            disabled: false,
            max_attempts: default_max_attempts(),
        }
    }
}

/// Errors detected while validating a workflow definition.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("workflow has no jobs")]
    Empty,

    #[error("job name {0:?} is not a single path segment")]
    BadJobName(String),

    #[error("job {job} references unknown job {other}")]
    UnknownJob { job: String, other: String },

    #[error("job {job} edge to {other} is not mirrored")]
    AsymmetricEdge { job: String, other: String },

    #[error("job {0} depends on itself")]
    SelfLoop(String),

    #[error("failed to serialize job payload: {0}")]
    Payload(String),
}

/// A validated directed graph of jobs for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub jobs: BTreeMap<String, JobSpec>,
}

impl WorkflowGraph {
    pub fn new(jobs: BTreeMap<String, JobSpec>) -> Result<Self, GraphError> {
        let graph = Self { jobs };
        graph.validate()?;
        Ok(graph)
    }

    /// Check the graph invariants: non-empty, path-safe job names, no
    /// self-loops, and every edge mirrored on both endpoints.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.jobs.is_empty() {
            return Err(GraphError::Empty);
        }
        for (name, spec) in &self.jobs {
            if name.is_empty() || name.contains('/') {
                return Err(GraphError::BadJobName(name.clone()));
            }
            for input in &spec.inputs {
                if input == name {
                    return Err(GraphError::SelfLoop(name.clone()));
                }
                let upstream = self.jobs.get(input).ok_or_else(|| GraphError::UnknownJob {
                    job: name.clone(),
                    other: input.clone(),
                })?;
                if !upstream.outputs.contains(name) {
                    return Err(GraphError::AsymmetricEdge {
                        job: name.clone(),
                        other: input.clone(),
                    });
                }
            }
            for output in &spec.outputs {
                if output == name {
                    return Err(GraphError::SelfLoop(name.clone()));
                }
                let downstream = self.jobs.get(output).ok_or_else(|| GraphError::UnknownJob {
                    job: name.clone(),
                    other: output.clone(),
                })?;
                if !downstream.inputs.contains(name) {
                    return Err(GraphError::AsymmetricEdge {
                        job: name.clone(),
                        other: output.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Emit the initial token batch for a new instance: source jobs runnable
    /// and unowned, everything else parked under `/job/waiting/`.
    pub fn initial_tokens(&self, workflow: &str, instance: &str) -> Result<Vec<Token>, GraphError> {
        let mut tokens = Vec::with_capacity(self.jobs.len());
        for (name, spec) in &self.jobs {
            let data = JobData {
                command: spec.command.clone(),
                inputs: spec.inputs.clone(),
                outputs: spec.outputs.clone(),
                disabled: spec.disabled,
                max_attempts: spec.max_attempts,
                history: vec![],
            }
            .encode()
            .map_err(|e| GraphError::Payload(e.to_string()))?;

            let token = if spec.inputs.is_empty() {
                let job = JobName::new(workflow, instance, JobState::Runnable, name);
                Token::new(job.token_name(), data)
            } else {
                let job = JobName::new(workflow, instance, JobState::Waiting, name);
                Token::parked(job.token_name(), data)
            };
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowGraph {
        let mut jobs = BTreeMap::new();
        jobs.insert(
            "extract".to_string(),
            JobSpec {
                outputs: vec!["load".to_string()],
                ..JobSpec::new("extract.sh")
            },
        );
        jobs.insert(
            "load".to_string(),
            JobSpec {
                inputs: vec!["extract".to_string()],
                ..JobSpec::new("load.sh")
            },
        );
        WorkflowGraph::new(jobs).unwrap()
    }

    #[test]
    fn test_initial_tokens_split_by_readiness() {
        let tokens = linear().initial_tokens("etl", "inst-1").unwrap();
        assert_eq!(tokens.len(), 2);

        let extract = &tokens[0];
        assert_eq!(extract.name, "/workflow/etl/inst-1/job/runnable/extract");
        assert!(extract.is_claimable(0));

        let load = &tokens[1];
        assert_eq!(load.name, "/workflow/etl/inst-1/job/waiting/load");
        assert!(!load.is_claimable(0));

        let data = JobData::decode(&load.data).unwrap();
        assert_eq!(data.inputs, vec!["extract".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_input() {
        let mut jobs = BTreeMap::new();
        jobs.insert(
            "a".to_string(),
            JobSpec {
                inputs: vec!["missing".to_string()],
                ..JobSpec::new("a.sh")
            },
        );
        assert_eq!(
            WorkflowGraph::new(jobs).unwrap_err(),
            GraphError::UnknownJob {
                job: "a".to_string(),
                other: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_asymmetric_edge() {
        let mut jobs = BTreeMap::new();
        jobs.insert("a".to_string(), JobSpec::new("a.sh"));
        jobs.insert(
            "b".to_string(),
            JobSpec {
                inputs: vec!["a".to_string()],
                ..JobSpec::new("b.sh")
            },
        );
        assert!(matches!(
            WorkflowGraph::new(jobs).unwrap_err(),
            GraphError::AsymmetricEdge { .. }
        ));
    }

    #[test]
    fn test_rejects_self_loop_and_bad_names() {
        let mut jobs = BTreeMap::new();
        jobs.insert(
            "a".to_string(),
            JobSpec {
                inputs: vec!["a".to_string()],
                outputs: vec!["a".to_string()],
                ..JobSpec::new("a.sh")
            },
        );
        assert_eq!(
            WorkflowGraph::new(jobs).unwrap_err(),
            GraphError::SelfLoop("a".to_string())
        );

        let mut jobs = BTreeMap::new();
        jobs.insert("a/b".to_string(), JobSpec::new("x"));
        assert_eq!(
            WorkflowGraph::new(jobs).unwrap_err(),
            GraphError::BadJobName("a/b".to_string())
        );
    }
}
