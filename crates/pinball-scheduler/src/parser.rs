//! The workflow-definition parser contract.
//!
//! Parsing user configuration into a job graph is external; the scheduler
//! only needs something that can emit a new instance's initial token batch.

use std::collections::BTreeMap;

use pinball_core::{GraphError, Token, WorkflowGraph};

/// Parser errors
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// No definition registered for the workflow
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The definition itself is invalid
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The definition source could not be read
    #[error("failed to load workflow definitions: {0}")]
    Load(String),
}

/// Emits the initial token set of a new workflow instance.
pub trait WorkflowParser: Send + Sync {
    fn initial_tokens(&self, workflow: &str, instance: &str) -> Result<Vec<Token>, ParseError>;
}

/// Parser backed by a registry of validated workflow graphs.
#[derive(Debug)]
pub struct GraphParser {
    graphs: BTreeMap<String, WorkflowGraph>,
}

impl GraphParser {
    pub fn new(graphs: BTreeMap<String, WorkflowGraph>) -> Result<Self, ParseError> {
        for graph in graphs.values() {
            graph.validate()?;
        }
        Ok(Self { graphs })
    }

    /// Load a `{workflow name: graph}` registry from JSON.
    pub fn from_json(json: &str) -> Result<Self, ParseError> {
        let graphs: BTreeMap<String, WorkflowGraph> =
            serde_json::from_str(json).map_err(|e| ParseError::Load(e.to_string()))?;
        Self::new(graphs)
    }

    pub fn workflows(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }
}

impl WorkflowParser for GraphParser {
    fn initial_tokens(&self, workflow: &str, instance: &str) -> Result<Vec<Token>, ParseError> {
        let graph = self
            .graphs
            .get(workflow)
            .ok_or_else(|| ParseError::UnknownWorkflow(workflow.to_string()))?;
        Ok(graph.initial_tokens(workflow, instance)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_validates_graphs() {
        let parser = GraphParser::from_json(
            r#"{
                "etl": {
                    "jobs": {
                        "extract": {"command": "extract.sh", "outputs": ["load"]},
                        "load": {"command": "load.sh", "inputs": ["extract"]}
                    }
                }
            }"#,
        )
        .unwrap();

        let tokens = parser.initial_tokens("etl", "inst-1").unwrap();
        assert_eq!(tokens.len(), 2);

        assert!(matches!(
            parser.initial_tokens("nope", "inst-1").unwrap_err(),
            ParseError::UnknownWorkflow(_)
        ));
    }

    #[test]
    fn test_from_json_rejects_broken_graphs() {
        let err = GraphParser::from_json(
            r#"{"bad": {"jobs": {"a": {"command": "a.sh", "inputs": ["missing"]}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Graph(_)));
    }
}
