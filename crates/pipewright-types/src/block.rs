//! Pipeline graph definitions.
//!
//! A pipeline version is an immutable [`PipelineGraph`]: block name to
//! [`BlockDefinition`], plus an entry point. Blocks connect through named
//! sockets; each socket lists the blocks it leads to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Socket every pass-through block fires on.
pub const DEFAULT_SOCKET: &str = "default";

wire_enum! {
    /// The closed set of block kinds.
    pub enum BlockKind {
        Start => "start",
        End => "end",
        Approver => "approver",
        Execution => "execution",
        Form => "form",
        Sign => "sign",
        If => "if",
        ParallelStart => "parallel_start",
        ParallelEnd => "parallel_end",
        Timer => "timer",
        Function => "function",
        Notification => "notification",
        SdApp => "sd_app",
        Placeholder => "placeholder",
    }
}

impl BlockKind {
    /// Blocks that only move when a person (or an SLA sweep) acts on them.
    pub fn is_manual(&self) -> bool {
        matches!(
            self,
            BlockKind::Approver | BlockKind::Execution | BlockKind::Form | BlockKind::Sign
        )
    }
}

wire_enum! {
    /// Lifecycle of a pipeline version.
    pub enum VersionStatus {
        Draft => "draft",
        Approved => "approved",
        Rejected => "rejected",
        Archived => "archived",
    }
}

/// A named outgoing edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socket {
    pub id: String,
    #[serde(default)]
    pub next: Vec<String>,
}

impl Socket {
    pub fn new(id: impl Into<String>, next: &[&str]) -> Self {
        Self {
            id: id.into(),
            next: next.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Binds a block-local key to a fully qualified variable name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub name: String,
    #[serde(default)]
    pub global: String,
    /// JSON-Schema-like type of the value (`string`, `object`, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

/// One node of a pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub kind: BlockKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub input: Vec<VariableMapping>,
    #[serde(default)]
    pub output: Vec<VariableMapping>,
    #[serde(default)]
    pub sockets: Vec<Socket>,
    /// Hidden blocks are never shown by monitoring reads.
    #[serde(default)]
    pub hidden: bool,
}

impl BlockDefinition {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            title: String::new(),
            params: Value::Null,
            input: Vec::new(),
            output: Vec::new(),
            sockets: Vec::new(),
            hidden: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_socket(mut self, id: &str, next: &[&str]) -> Self {
        self.sockets.push(Socket::new(id, next));
        self
    }

    pub fn with_output(mut self, name: &str, global: &str) -> Self {
        self.output.push(VariableMapping {
            name: name.to_string(),
            global: global.to_string(),
            value_type: None,
        });
        self
    }

    /// Targets of `socket`, if the block declares it.
    pub fn next(&self, socket: &str) -> Option<&[String]> {
        self.sockets
            .iter()
            .find(|s| s.id == socket)
            .map(|s| s.next.as_slice())
    }

    /// Fully qualified name an output key is written to.
    ///
    /// Undeclared keys land at `<block>.<key>`.
    pub fn output_path(&self, block_name: &str, key: &str) -> String {
        self.output
            .iter()
            .find(|m| m.name == key && !m.global.is_empty())
            .map(|m| m.global.clone())
            .unwrap_or_else(|| format!("{block_name}.{key}"))
    }

    /// Every block any socket leads to, in declaration order.
    pub fn all_next(&self) -> Vec<&str> {
        self.sockets
            .iter()
            .flat_map(|s| s.next.iter().map(String::as_str))
            .collect()
    }
}

/// The immutable graph of one pipeline version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub entrypoint: String,
    pub blocks: BTreeMap<String, BlockDefinition>,
    #[serde(default)]
    pub inputs: Vec<VariableMapping>,
    #[serde(default)]
    pub outputs: Vec<VariableMapping>,
}

impl PipelineGraph {
    pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
        self.blocks.get(name)
    }

    /// Blocks with an edge into `name`.
    pub fn predecessors(&self, name: &str) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|(_, def)| def.all_next().contains(&name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Every block reachable from `from` (exclusive), following all sockets.
    pub fn downstream(&self, from: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self
            .block(from)
            .map(|b| b.all_next())
            .unwrap_or_default();
        while let Some(name) = stack.pop() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some(def) = self.block(name) {
                stack.extend(def.all_next());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> PipelineGraph {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            "start_0".into(),
            BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["p_start"]),
        );
        blocks.insert(
            "p_start".into(),
            BlockDefinition::new(BlockKind::ParallelStart)
                .with_socket("a", &["a"])
                .with_socket("b", &["b"]),
        );
        blocks.insert(
            "a".into(),
            BlockDefinition::new(BlockKind::Placeholder).with_socket(DEFAULT_SOCKET, &["p_end"]),
        );
        blocks.insert(
            "b".into(),
            BlockDefinition::new(BlockKind::Placeholder).with_socket(DEFAULT_SOCKET, &["p_end"]),
        );
        blocks.insert(
            "p_end".into(),
            BlockDefinition::new(BlockKind::ParallelEnd).with_socket(DEFAULT_SOCKET, &["end_0"]),
        );
        blocks.insert("end_0".into(), BlockDefinition::new(BlockKind::End));
        PipelineGraph {
            entrypoint: "start_0".into(),
            blocks,
            inputs: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn test_predecessors() {
        let g = diamond();
        assert_eq!(g.predecessors("p_end"), vec!["a".to_string(), "b".to_string()]);
        assert!(g.predecessors("start_0").is_empty());
    }

    #[test]
    fn test_downstream_cone() {
        let g = diamond();
        let cone = g.downstream("a");
        assert!(cone.contains("p_end"));
        assert!(cone.contains("end_0"));
        assert!(!cone.contains("b"));
    }

    #[test]
    fn test_output_path_defaults_to_block_prefix() {
        let def = BlockDefinition::new(BlockKind::Approver).with_output("decision", "approver_0.decision");
        assert_eq!(def.output_path("approver_0", "decision"), "approver_0.decision");
        assert_eq!(def.output_path("approver_0", "comment"), "approver_0.comment");
    }

    #[test]
    fn test_graph_parses_from_json() {
        let raw = serde_json::json!({
            "entrypoint": "start_0",
            "blocks": {
                "start_0": {"kind": "start", "sockets": [{"id": "default", "next": ["end_0"]}]},
                "end_0": {"kind": "end"}
            }
        });
        let g: PipelineGraph = serde_json::from_value(raw).unwrap();
        assert_eq!(g.block("start_0").unwrap().next(DEFAULT_SOCKET).unwrap(), ["end_0"]);
        assert_eq!(g.block("end_0").unwrap().kind, BlockKind::End);
    }
}
