//! Service-desk application: the body a task was launched with, bound to
//! the blueprint it was filled from.

use pipewright_types::{BlockKind, DEFAULT_SOCKET, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SdAppParams {
    pub blueprint_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdAppState {
    pub blueprint_id: String,
    pub application_body: Map<String, Value>,
}

pub struct SdApp;

impl Block for SdApp {
    const KIND: BlockKind = BlockKind::SdApp;

    type Params = SdAppParams;
    type State = SdAppState;

    fn validate(params: &SdAppParams) -> std::result::Result<(), String> {
        if params.blueprint_id.is_empty() {
            return Err("blueprint_id is required".into());
        }
        Ok(())
    }

    fn create_state(params: &SdAppParams, ctx: &mut BlockCtx<'_>) -> Result<SdAppState> {
        let application_body = match &ctx.frame.parameters {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(EngineError::block("task parameters are not an object")),
        };
        Ok(SdAppState {
            blueprint_id: params.blueprint_id.clone(),
            application_body,
        })
    }

    fn update(_params: &SdAppParams, state: &mut SdAppState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        ctx.event("application_received", json!({"blueprint_id": state.blueprint_id}));
        Ok(Progress::finished(DEFAULT_SOCKET))
    }

    fn outputs(state: &SdAppState) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("blueprint_id".into(), Value::String(state.blueprint_id.clone()));
        out.insert(
            "application_body".into(),
            Value::Object(state.application_body.clone()),
        );
        out
    }

    fn apply_outputs(state: &mut SdAppState, outputs: &Map<String, Value>) -> Result<()> {
        if let Some(raw) = outputs.get("application_body") {
            let Value::Object(body) = raw else {
                return Err(EngineError::rejected(
                    ErrorKind::MonitoringEditBlockParse,
                    "application_body must be an object",
                ));
            };
            state.application_body = body.clone();
        }
        if let Some(Value::String(id)) = outputs.get("blueprint_id") {
            state.blueprint_id = id.clone();
        }
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::SdApp, "Service desk application")
            .params(json!({"blueprint_id": ""}))
            .output("blueprint_id", "string", "blueprint the application was filled from")
            .output("application_body", "object", "the application as submitted")
            .sockets(&[DEFAULT_SOCKET])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::BlockDefinition;

    #[test]
    fn test_body_taken_from_task_parameters() {
        let def = BlockDefinition::new(BlockKind::SdApp).with_params(json!({"blueprint_id": "bp-1"}));
        let mut h = Harness::new("servicedesk_application_0", def);
        h.frame.parameters = json!({"city": "Oslo"});
        let out = h.enter::<SdApp>().unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert_eq!(
            h.vars.get("servicedesk_application_0.application_body.city"),
            Some(&json!("Oslo"))
        );
        assert_eq!(
            h.vars.get("servicedesk_application_0.blueprint_id"),
            Some(&json!("bp-1"))
        );
    }

    #[test]
    fn test_blueprint_required() {
        assert!(SdApp::validate(&SdAppParams::default()).is_err());
    }
}
