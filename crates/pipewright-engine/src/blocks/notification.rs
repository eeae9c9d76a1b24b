//! Notification: a mail to fixed people, addresses or logins read from
//! the variables.

use pipewright_types::{BlockKind, DEFAULT_SOCKET};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::{logins_from_paths, push_unique};
use super::{Block, Progress};
use crate::Result;
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::services::Mail;
use crate::variables::VariableStore;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationParams {
    pub people: Vec<String>,
    pub emails: Vec<String>,
    /// Semicolon-separated variable paths naming more recipients.
    pub users_from_schema: String,
    pub subject: String,
    /// Body with `{{path}}` placeholders.
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationState {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Substitute every `{{path}}` in `template` with the variable's value.
/// Unknown paths render empty.
pub fn render(template: &str, vars: &VariableStore) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        match vars.get(after[..close].trim()) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

pub struct Notification;

impl Block for Notification {
    const KIND: BlockKind = BlockKind::Notification;

    type Params = NotificationParams;
    type State = NotificationState;

    fn create_state(
        params: &NotificationParams,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<NotificationState> {
        let mut recipients = Vec::new();
        push_unique(&mut recipients, params.people.iter().cloned());
        push_unique(&mut recipients, params.emails.iter().cloned());
        push_unique(
            &mut recipients,
            logins_from_paths(ctx.vars, &params.users_from_schema),
        );
        Ok(NotificationState {
            recipients,
            subject: render(&params.subject, ctx.vars),
            body: render(&params.text, ctx.vars),
        })
    }

    fn update(
        _params: &NotificationParams,
        state: &mut NotificationState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        if state.recipients.is_empty() {
            tracing::warn!(block = ctx.name, task = %ctx.frame.task_id, "notification has no recipients");
        } else {
            ctx.effects.mails.push(Mail {
                to: state.recipients.clone(),
                subject: state.subject.clone(),
                body: state.body.clone(),
            });
        }
        Ok(Progress::finished(DEFAULT_SOCKET))
    }

    fn outputs(_state: &NotificationState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut NotificationState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Notification, "Notification")
            .params(json!({"people": [], "emails": [], "users_from_schema": "", "subject": "", "text": ""}))
            .sockets(&[DEFAULT_SOCKET])
    }
}
