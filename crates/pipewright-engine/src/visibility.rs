//! Read-time filtering of task views.
//!
//! Blocks flagged `hide_executor` (forms: `hide_executor_from_initiator`)
//! have every identity field masked unless the caller executes the block or
//! acts for someone who does. Callers other than the initiator only see the
//! forms they fill or are granted through `forms_accessibility` on a step
//! they take part in. The initiator loses forms flagged
//! `hide_form_from_initiator` unless they fill them.

use std::collections::BTreeSet;

use pipewright_delegation::Delegations;
use pipewright_types::BlockKind;
use serde_json::Value;

use crate::blocks::common::{FormAccess, grants};
use crate::monitoring::TaskView;

pub const HIDDEN_USER: &str = "hidden_user";

const IDENTITY_KEYS: &[&str] = &[
    "executors",
    "initial_executors",
    "actual_executor",
    "executor",
    "login",
    "old_login",
    "new_login",
    "members",
];

const DELEGATOR_KEYS: &[&str] = &["delegate_for"];

const HIDE_EXECUTOR_FLAGS: &[&str] = &["hide_executor", "hide_executor_from_initiator"];

/// Apply every visibility rule for `caller`.
pub fn apply(view: &mut TaskView, caller: &str, delegations: &Delegations) {
    let acting = delegations.with_delegators(&[caller.to_string()]);
    mask_hidden_executors(view, &acting);
    let hidden = if view.task.initiator == caller {
        forms_hidden_from_initiator(view, &acting)
    } else {
        unreadable_forms(view, &acting)
    };
    strip_forms(view, &hidden);
}

fn flag(state: &Value, name: &str) -> bool {
    state.get(name).and_then(Value::as_bool) == Some(true)
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Newest state recorded for `block` across the view.
fn latest_state<'v>(view: &'v TaskView, block: &str) -> Option<&'v Value> {
    view.steps.iter().rev().find_map(|s| s.step.state.get(block))
}

fn block_names(view: &TaskView) -> BTreeSet<String> {
    view.steps
        .iter()
        .flat_map(|s| s.step.state.keys().cloned())
        .collect()
}

fn mask(value: &mut Value, with: &str) {
    match value {
        Value::String(s) => *s = with.to_string(),
        Value::Array(items) => items.iter_mut().for_each(|v| mask(v, with)),
        Value::Object(_) => scrub(value),
        _ => {}
    }
}

/// Mask identity fields anywhere inside `value`.
fn scrub(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if IDENTITY_KEYS.contains(&key.as_str()) {
                    mask(v, HIDDEN_USER);
                } else if DELEGATOR_KEYS.contains(&key.as_str()) {
                    mask(v, "");
                } else {
                    scrub(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub),
        _ => {}
    }
}

fn mask_hidden_executors(view: &mut TaskView, acting: &[String]) {
    let hidden: Vec<String> = block_names(view)
        .into_iter()
        .filter(|block| {
            let Some(state) = latest_state(view, block) else {
                return false;
            };
            if !HIDE_EXECUTOR_FLAGS.iter().any(|name| flag(state, name)) {
                return false;
            }
            let executors = strings(state.get("executors"));
            !executors.iter().any(|e| acting.contains(e))
        })
        .collect();
    if hidden.is_empty() {
        return;
    }

    for view_step in &mut view.steps {
        let step = &mut view_step.step;
        for block in &hidden {
            if let Some(state) = step.state.get_mut(block) {
                scrub(state);
            }
            let prefix = format!("{block}.");
            for (key, value) in step.storage.iter_mut() {
                let Some(rest) = key.strip_prefix(&prefix) else {
                    continue;
                };
                let last = rest.rsplit('.').next().unwrap_or(rest);
                if IDENTITY_KEYS.contains(&last) {
                    mask(value, HIDDEN_USER);
                } else if DELEGATOR_KEYS.contains(&last) {
                    mask(value, "");
                } else {
                    scrub(value);
                }
            }
        }
        if hidden.contains(&step.name) {
            for member in &mut view_step.members {
                member.login = HIDDEN_USER.to_string();
            }
        }
    }
}

/// Forms `acting` may read.
fn readable_forms(view: &TaskView, acting: &[String]) -> BTreeSet<String> {
    let forms = form_names(view);

    let mut readable = BTreeSet::new();
    for form in &forms {
        let executors = strings(latest_state(view, form).and_then(|s| s.get("executors")));
        if executors.iter().any(|e| acting.contains(e)) {
            readable.insert(form.clone());
        }
    }
    for view_step in &view.steps {
        let is_member = view_step.members.iter().any(|m| acting.contains(&m.login));
        if !is_member {
            continue;
        }
        let table: Vec<FormAccess> = view_step
            .step
            .state
            .get(&view_step.step.name)
            .and_then(|s| s.get("forms_accessibility"))
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
            .unwrap_or_default();
        for form in &forms {
            if grants(&table, form) {
                readable.insert(form.clone());
            }
        }
    }
    readable
}

fn form_names(view: &TaskView) -> BTreeSet<String> {
    view.steps
        .iter()
        .filter(|s| s.step.kind == BlockKind::Form)
        .map(|s| s.step.name.clone())
        .collect()
}

fn unreadable_forms(view: &TaskView, acting: &[String]) -> BTreeSet<String> {
    let readable = readable_forms(view, acting);
    form_names(view)
        .into_iter()
        .filter(|form| !readable.contains(form))
        .collect()
}

fn forms_hidden_from_initiator(view: &TaskView, acting: &[String]) -> BTreeSet<String> {
    form_names(view)
        .into_iter()
        .filter(|form| {
            let Some(state) = latest_state(view, form) else {
                return false;
            };
            flag(state, "hide_form_from_initiator")
                && !strings(state.get("executors")).iter().any(|e| acting.contains(e))
        })
        .collect()
}

fn strip_forms(view: &mut TaskView, hidden: &BTreeSet<String>) {
    if hidden.is_empty() {
        return;
    }
    view.steps.retain(|s| !hidden.contains(&s.step.name));
    for view_step in &mut view.steps {
        let step = &mut view_step.step;
        step.state.retain(|block, _| !hidden.contains(block));
        step.storage.retain(|key, _| {
            let block = key.split('.').next().unwrap_or(key);
            !hidden.contains(block)
        });
        step.steps.retain(|name| !hidden.contains(name));
        view_step.next.retain(|name| !hidden.contains(name));
    }
}
