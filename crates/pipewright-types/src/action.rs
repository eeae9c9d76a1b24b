//! Update actions and the descriptor that carries them into a block.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::BlockKind;

wire_enum! {
    /// Everything that can re-enter a block from outside.
    pub enum UpdateAction {
        Approvement => "approvement",
        AdditionalApprovement => "additional_approvement",
        AddApprovers => "add_approvers",
        ApproverSendEditApp => "approver_send_edit_app",
        RequestApproveInfo => "request_add_info",
        ReplyApproverInfo => "reply_approver_info",
        Execution => "execution",
        ChangeExecutor => "change_executor",
        ExecutorStartWork => "executor_start_work",
        RequestExecutionInfo => "request_execution_info",
        ReplyExecutionInfo => "reply_execution_info",
        ExecutorSendEditApp => "executor_send_edit_app",
        FillForm => "fill_form",
        FormExecutorStartWork => "form_executor_start_work",
        Sign => "sign",
        FinishTimer => "finish_timer",
        FuncSlaExpired => "func_sla_expired",
        Retry => "retry",
        FunctionResult => "function_result",
        SlaBreach => "sla_breached",
        HalfSlaBreach => "half_sla_breached",
        ReworkSlaBreach => "rework_sla_breached",
        CancelApp => "cancel_app",
        Reload => "reload",
    }
}

impl UpdateAction {
    /// Block kinds an action may be delivered to.
    pub fn target_kinds(&self) -> &'static [BlockKind] {
        use BlockKind::*;
        match self {
            UpdateAction::Approvement
            | UpdateAction::ApproverSendEditApp
            | UpdateAction::RequestApproveInfo
            | UpdateAction::ReplyApproverInfo => &[Approver],
            UpdateAction::AdditionalApprovement | UpdateAction::AddApprovers => &[Approver, Sign],
            UpdateAction::Execution
            | UpdateAction::ChangeExecutor
            | UpdateAction::ExecutorStartWork
            | UpdateAction::RequestExecutionInfo
            | UpdateAction::ReplyExecutionInfo
            | UpdateAction::ExecutorSendEditApp => &[Execution],
            UpdateAction::FillForm | UpdateAction::FormExecutorStartWork => &[Form],
            UpdateAction::Sign => &[Sign],
            UpdateAction::FinishTimer => &[Timer],
            UpdateAction::FuncSlaExpired
            | UpdateAction::Retry
            | UpdateAction::FunctionResult => &[Function],
            UpdateAction::SlaBreach
            | UpdateAction::HalfSlaBreach
            | UpdateAction::ReworkSlaBreach => &[Approver, Execution, Form, Sign],
            UpdateAction::CancelApp => &[ParallelEnd, Approver, Execution, Form, Sign],
            UpdateAction::Reload => BlockKind::ALL,
        }
    }

    /// Actions only the engine itself issues.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            UpdateAction::SlaBreach
                | UpdateAction::HalfSlaBreach
                | UpdateAction::ReworkSlaBreach
                | UpdateAction::FunctionResult
                | UpdateAction::FuncSlaExpired
                | UpdateAction::Reload
        )
    }
}

/// The payload a block's `update()` consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub action: UpdateAction,
    #[serde(default)]
    pub by_login: String,
    #[serde(default)]
    pub parameters: Value,
}

impl UpdateDescriptor {
    pub fn new(action: UpdateAction, by_login: impl Into<String>, parameters: Value) -> Self {
        Self {
            action,
            by_login: by_login.into(),
            parameters,
        }
    }

    /// A descriptor with no author and no parameters.
    pub fn system(action: UpdateAction) -> Self {
        Self::new(action, "", Value::Null)
    }

    /// Decode the parameters into a typed struct.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.parameters {
            Value::Null => serde_json::from_value(Value::Object(Default::default())),
            other => serde_json::from_value(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kinds() {
        assert_eq!(UpdateAction::Approvement.target_kinds(), &[BlockKind::Approver]);
        assert!(UpdateAction::AddApprovers.target_kinds().contains(&BlockKind::Sign));
        assert_eq!(UpdateAction::Reload.target_kinds().len(), BlockKind::ALL.len());
    }

    #[test]
    fn test_descriptor_wire_format() {
        let raw = serde_json::json!({
            "action": "sla_breached",
            "by_login": "",
            "parameters": {"x": 1}
        });
        let d: UpdateDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(d.action, UpdateAction::SlaBreach);
        assert!(d.action.is_internal());
    }

    #[test]
    fn test_null_parameters_decode_as_empty_object() {
        #[derive(Deserialize, Default)]
        struct P {
            #[serde(default)]
            comment: String,
        }
        let d = UpdateDescriptor::system(UpdateAction::Reload);
        let p: P = d.params().unwrap();
        assert!(p.comment.is_empty());
    }
}
