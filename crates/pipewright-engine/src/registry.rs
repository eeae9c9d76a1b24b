//! Block catalog and version-time graph validation.

use std::collections::BTreeSet;
use std::str::FromStr;

use pipewright_types::{BlockKind, ErrorKind, PipelineGraph};
use serde::Serialize;
use serde_json::Value;

use crate::blocks::{check_params, dispatch};
use crate::{EngineError, Result};

/// One field of a block's input or output schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub description: String,
}

/// Self-description of a block kind, served by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockModel {
    pub id: String,
    pub title: String,
    pub kind: BlockKind,
    /// Default parameters a new block of this kind starts with.
    pub params: Value,
    pub inputs: Vec<FieldSchema>,
    pub outputs: Vec<FieldSchema>,
    pub sockets: Vec<String>,
}

impl BlockModel {
    pub fn new(kind: BlockKind, title: &str) -> Self {
        Self {
            id: kind.as_str().to_string(),
            title: title.to_string(),
            kind,
            params: Value::Object(Default::default()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            sockets: Vec::new(),
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn input(mut self, name: &str, field_type: &str, description: &str) -> Self {
        self.inputs.push(FieldSchema {
            name: name.to_string(),
            field_type: field_type.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn output(mut self, name: &str, field_type: &str, description: &str) -> Self {
        self.outputs.push(FieldSchema {
            name: name.to_string(),
            field_type: field_type.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn sockets(mut self, sockets: &[&str]) -> Self {
        self.sockets = sockets.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declared type of output `key`, if the kind declares one.
    pub fn output_type(&self, key: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|f| f.name == key)
            .map(|f| f.field_type.as_str())
    }
}

pub fn model_of(kind: BlockKind) -> BlockModel {
    dispatch!(kind, B => B::model())
}

/// Every block kind the editor may place.
pub fn catalog(expose_placeholder: bool) -> Vec<BlockModel> {
    BlockKind::ALL
        .iter()
        .filter(|k| expose_placeholder || **k != BlockKind::Placeholder)
        .map(|k| model_of(*k))
        .collect()
}

/// Parse a graph from JSON, reporting an unknown block kind by name.
pub fn parse_graph(raw: &Value) -> Result<PipelineGraph> {
    if let Some(blocks) = raw.get("blocks").and_then(Value::as_object) {
        for (name, def) in blocks {
            let kind = def.get("kind").and_then(Value::as_str).unwrap_or_default();
            if BlockKind::from_str(kind).is_err() {
                return Err(EngineError::rejected(
                    ErrorKind::UnknownBlockKind,
                    format!("block {name}: unknown block type {kind:?}"),
                ));
            }
        }
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::rejected(ErrorKind::GraphInvalid, e.to_string()))
}

fn invalid(kind: ErrorKind, detail: impl Into<String>) -> EngineError {
    EngineError::rejected(kind, detail)
}

/// Check a graph before it is stored as a version.
pub fn validate_graph(graph: &PipelineGraph) -> Result<()> {
    if graph.block(&graph.entrypoint).is_none() {
        return Err(invalid(
            ErrorKind::GraphInvalid,
            format!("entry point {:?} is not a block", graph.entrypoint),
        ));
    }
    for (name, def) in &graph.blocks {
        for target in def.all_next() {
            if graph.block(target).is_none() {
                return Err(invalid(
                    ErrorKind::GraphInvalid,
                    format!("block {name} leads to unknown block {target}"),
                ));
            }
        }
        dispatch!(def.kind, B => check_params::<B>(def))
            .map_err(|e| invalid(ErrorKind::InvalidBlockParams, format!("block {name}: {e}")))?;
    }
    for (name, def) in &graph.blocks {
        if def.kind == BlockKind::ParallelStart {
            let cluster = parallel_cluster(graph, name, 0)?;
            check_join_inputs(graph, name, &cluster)?;
        }
    }
    Ok(())
}

/// The blocks between a parallel start and its join.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelCluster {
    pub end: String,
    pub members: BTreeSet<String>,
}

/// Walk every branch out of `start` until the join. Nested sections are
/// stepped over through their own join.
pub fn parallel_cluster(graph: &PipelineGraph, start: &str, depth: usize) -> Result<ParallelCluster> {
    if depth > graph.blocks.len() {
        return Err(invalid(
            ErrorKind::ParallelNodeReturnCycle,
            format!("parallel sections around {start} nest into each other"),
        ));
    }
    let successors = |name: &str| -> Vec<String> {
        graph
            .block(name)
            .map(|d| d.all_next().into_iter().map(String::from).collect())
            .unwrap_or_default()
    };

    let mut ends = BTreeSet::new();
    let mut members = BTreeSet::new();
    let mut stack = successors(start);
    if stack.is_empty() {
        return Err(invalid(
            ErrorKind::ParallelNodeExitsNotConnected,
            format!("{start} has no branches"),
        ));
    }
    while let Some(name) = stack.pop() {
        if name == start {
            return Err(invalid(
                ErrorKind::ParallelNodeReturnCycle,
                format!("a branch of {start} returns to it"),
            ));
        }
        if !members.insert(name.clone()) {
            continue;
        }
        let Some(def) = graph.block(&name) else {
            continue;
        };
        match def.kind {
            BlockKind::ParallelEnd => {
                ends.insert(name);
            }
            BlockKind::ParallelStart => {
                let inner = parallel_cluster(graph, &name, depth + 1)?;
                stack.extend(successors(&inner.end));
                members.extend(inner.members);
            }
            BlockKind::End => {
                return Err(invalid(
                    ErrorKind::OutOfParallelNodesConnection,
                    format!("branch of {start} reaches {name} before joining"),
                ));
            }
            _ => {
                let next = successors(&name);
                if next.is_empty() {
                    return Err(invalid(
                        ErrorKind::ParallelNodeExitsNotConnected,
                        format!("branch of {start} stops at {name}"),
                    ));
                }
                stack.extend(next);
            }
        }
    }
    let mut ends = ends.into_iter();
    match (ends.next(), ends.next()) {
        (Some(end), None) => {
            members.remove(&end);
            Ok(ParallelCluster { end, members })
        }
        (None, _) => Err(invalid(
            ErrorKind::ParallelNodeExitsNotConnected,
            format!("branches of {start} never join"),
        )),
        (Some(a), Some(b)) => Err(invalid(
            ErrorKind::ParallelPathIntersected,
            format!("branches of {start} join at both {a} and {b}"),
        )),
    }
}

/// Nothing outside the section may lead into its join.
fn check_join_inputs(graph: &PipelineGraph, start: &str, cluster: &ParallelCluster) -> Result<()> {
    for pred in graph.predecessors(&cluster.end) {
        if pred != start && !cluster.members.contains(&pred) {
            return Err(invalid(
                ErrorKind::OutOfParallelNodesConnection,
                format!("{pred} joins {} from outside its section", cluster.end),
            ));
        }
    }
    Ok(())
}
