//! The `if` block: route by the first matching condition group.

use pipewright_types::{BlockKind, DEFAULT_SOCKET};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Block, Progress};
use crate::Result;
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::variables::VariableStore;

/// Literal operands starting with this prefix name a variable instead.
pub const REFERENCE_PREFIX: &str = "ref#";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperandType {
    String,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equal,
    NotEqual,
    MoreThan,
    LessThan,
    MoreThanOrEqual,
    LessThanOrEqual,
}

impl Operator {
    fn is_ordering(&self) -> bool {
        !matches!(self, Operator::Equal | Operator::NotEqual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    #[serde(rename = "type")]
    pub kind: OperandType,
    pub value: Value,
}

impl Operand {
    fn resolve<'a>(&'a self, vars: &'a VariableStore) -> Option<&'a Value> {
        match self.value.as_str().and_then(|s| s.strip_prefix(REFERENCE_PREFIX)) {
            Some(path) => vars.get(path),
            None => Some(&self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub left_operand: Operand,
    pub right_operand: Operand,
    pub operator: Operator,
}

impl Comparison {
    fn comparable(&self) -> bool {
        self.left_operand.kind == self.right_operand.kind
            && (self.left_operand.kind == OperandType::Integer || !self.operator.is_ordering())
    }

    pub fn is_true(&self, vars: &VariableStore) -> bool {
        if !self.comparable() {
            return false;
        }
        let (Some(left), Some(right)) = (
            self.left_operand.resolve(vars),
            self.right_operand.resolve(vars),
        ) else {
            return false;
        };
        match self.left_operand.kind {
            OperandType::Integer => {
                let (Some(l), Some(r)) = (as_integer(left), as_integer(right)) else {
                    return false;
                };
                match self.operator {
                    Operator::Equal => l == r,
                    Operator::NotEqual => l != r,
                    Operator::MoreThan => l > r,
                    Operator::LessThan => l < r,
                    Operator::MoreThanOrEqual => l >= r,
                    Operator::LessThanOrEqual => l <= r,
                }
            }
            OperandType::String | OperandType::Boolean => match self.operator {
                Operator::Equal => left == right,
                Operator::NotEqual => left != right,
                _ => false,
            },
        }
    }
}

fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConditionGroup {
    /// Socket fired when this group matches.
    pub id: String,
    pub all_of: Vec<Comparison>,
    pub any_of: Vec<Comparison>,
}

impl ConditionGroup {
    pub fn matches(&self, vars: &VariableStore) -> bool {
        if !self.all_of.is_empty() {
            return self.all_of.iter().all(|c| c.is_true(vars));
        }
        self.any_of.iter().any(|c| c.is_true(vars))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConditionParams {
    #[serde(alias = "condition_groups")]
    pub condition_groups: Vec<ConditionGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionState {
    pub chosen: Option<String>,
}

pub struct Condition;

impl Block for Condition {
    const KIND: BlockKind = BlockKind::If;

    type Params = ConditionParams;
    type State = ConditionState;

    fn validate(params: &ConditionParams) -> std::result::Result<(), String> {
        for group in &params.condition_groups {
            if group.id.is_empty() {
                return Err("condition group without id".into());
            }
            if !group.all_of.is_empty() && !group.any_of.is_empty() {
                return Err(format!("group {}: allOf and anyOf can't be combined", group.id));
            }
            if let Some(bad) = group.all_of.iter().chain(&group.any_of).find(|c| !c.comparable()) {
                return Err(format!(
                    "group {}: operator {:?} can't compare {:?} with {:?}",
                    group.id, bad.operator, bad.left_operand.kind, bad.right_operand.kind
                ));
            }
        }
        Ok(())
    }

    fn create_state(_params: &ConditionParams, _ctx: &mut BlockCtx<'_>) -> Result<ConditionState> {
        Ok(ConditionState::default())
    }

    fn update(
        params: &ConditionParams,
        state: &mut ConditionState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        let vars: &VariableStore = ctx.vars;
        let chosen = params
            .condition_groups
            .iter()
            .find(|g| g.matches(vars))
            .map(|g| g.id.clone());
        tracing::debug!(block = ctx.name, chosen = ?chosen, "condition evaluated");
        let socket = chosen.clone().unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        state.chosen = chosen;
        Ok(Progress::finished(&socket))
    }

    fn outputs(_state: &ConditionState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut ConditionState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::If, "Condition")
            .params(json!({"conditionGroups": []}))
            .sockets(&[DEFAULT_SOCKET])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::BlockDefinition;

    fn params() -> Value {
        json!({"conditionGroups": [
            {"id": "big", "allOf": [{
                "leftOperand": {"type": "integer", "value": "ref#form_0.amount"},
                "rightOperand": {"type": "integer", "value": 100},
                "operator": "moreThanOrEqual"
            }]},
            {"id": "vip", "anyOf": [{
                "leftOperand": {"type": "string", "value": "ref#form_0.tier"},
                "rightOperand": {"type": "string", "value": "gold"},
                "operator": "equal"
            }]}
        ]})
    }

    fn run(amount: i64, tier: &str) -> Vec<String> {
        let def = BlockDefinition::new(BlockKind::If).with_params(params());
        let mut h = Harness::new("if_0", def);
        h.vars.set_value("form_0.amount", json!(amount));
        h.vars.set_value("form_0.tier", json!(tier));
        h.enter::<Condition>().unwrap().progress.sockets
    }

    #[test]
    fn test_first_matching_group_wins() {
        assert_eq!(run(150, "gold"), vec!["big"]);
        assert_eq!(run(10, "gold"), vec!["vip"]);
        assert_eq!(run(10, "silver"), vec![DEFAULT_SOCKET]);
    }

    #[test]
    fn test_missing_reference_is_false() {
        let def = BlockDefinition::new(BlockKind::If).with_params(params());
        let mut h = Harness::new("if_0", def);
        assert_eq!(h.enter::<Condition>().unwrap().progress.sockets, vec![DEFAULT_SOCKET]);
    }

    #[test]
    fn test_ordering_on_strings_is_invalid() {
        let p: ConditionParams = serde_json::from_value(json!({"conditionGroups": [
            {"id": "g", "allOf": [{
                "leftOperand": {"type": "string", "value": "a"},
                "rightOperand": {"type": "string", "value": "b"},
                "operator": "lessThan"
            }]}
        ]}))
        .unwrap();
        assert!(Condition::validate(&p).is_err());
    }
}
