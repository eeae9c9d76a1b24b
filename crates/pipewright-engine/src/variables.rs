//! Per-task variable store.
//!
//! Values are kept flat under fully qualified names (`<block>.<key>`), in
//! insertion order. Lookups hit the exact key first and otherwise walk
//! the remainder of the path through the nested value stored under the
//! longest matching prefix, so `form_0.application_body.items[1].name`
//! resolves into the JSON stored at `form_0.application_body`.

use pipewright_types::{Step, StopPoints};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableStore {
    values: Map<String, Value>,
    state: Map<String, Value>,
    steps: Vec<String>,
    errors: Vec<String>,
    stop_points: StopPoints,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a task's launch parameters, stored under
    /// `<pipeline_name>.<key>`.
    pub fn from_parameters(pipeline_name: &str, parameters: &Value) -> Self {
        let mut store = Self::new();
        if let Value::Object(params) = parameters {
            for (key, value) in params {
                store.set_value(&format!("{pipeline_name}.{key}"), value.clone());
            }
        }
        store
    }

    /// Rebuild the store from a persisted step snapshot.
    pub fn from_step(step: &Step) -> Self {
        Self {
            values: step.storage.clone(),
            state: step.state.clone(),
            steps: step.steps.clone(),
            errors: step.errors.clone(),
            stop_points: step.stop_points.clone(),
        }
    }

    /// Lay a step's own values and state over this store.
    pub fn overlay_step(&mut self, step: &Step) {
        let prefix = format!("{}.", step.name);
        for (key, value) in &step.storage {
            if key.starts_with(&prefix) {
                self.values.insert(key.clone(), value.clone());
            }
        }
        if let Some(state) = step.state.get(&step.name) {
            self.state.insert(step.name.clone(), state.clone());
        }
    }

    /// Write the snapshot back into a step record.
    pub fn write_to(&self, step: &mut Step) {
        step.storage = self.values.clone();
        step.state = self.state.clone();
        step.steps = self.steps.clone();
        step.errors = self.errors.clone();
        step.stop_points = self.stop_points.clone();
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(path) {
            return Some(v);
        }
        // Longest stored prefix wins.
        let mut cut = path.len();
        while let Some(pos) = path[..cut].rfind(['.', '[']) {
            cut = pos;
            if let Some(root) = self.values.get(&path[..cut]) {
                let rest = path[cut..].trim_start_matches('.');
                return walk(root, rest);
            }
        }
        None
    }

    /// Resolve a path to a string, rendering non-string scalars.
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    pub fn set_value(&mut self, path: &str, value: Value) {
        if path.is_empty() {
            return;
        }
        self.values.insert(path.to_string(), value);
    }

    /// Drop every value written by `block`.
    pub fn clear_values(&mut self, block: &str) {
        let prefix = format!("{block}.");
        self.values.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Values written by `block`, keyed without the block prefix.
    pub fn block_values(&self, block: &str) -> Map<String, Value> {
        let prefix = format!("{block}.");
        self.values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|key| (key.to_string(), v.clone())))
            .collect()
    }

    pub fn set_state(&mut self, block: &str, state: Value) {
        self.state.insert(block.to_string(), state);
    }

    pub fn state(&self, block: &str) -> Option<&Value> {
        self.state.get(block)
    }

    pub fn add_step(&mut self, name: &str) {
        if self.steps.last().map(String::as_str) != Some(name) {
            self.steps.push(name.to_string());
        }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn grab(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn stop_points(&self) -> &StopPoints {
        &self.stop_points
    }

    pub fn set_stop_points(&mut self, stop_points: StopPoints) {
        self.stop_points = stop_points;
    }

    /// Turn a flat `a.b.c` map into nested objects.
    pub fn restore(flat: &Map<String, Value>) -> Value {
        let mut root = Map::new();
        for (key, value) in flat {
            let mut node = &mut root;
            let mut parts = key.split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), value.clone());
                    break;
                }
                let entry = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                let Value::Object(next) = entry else { break };
                node = next;
            }
        }
        Value::Object(root)
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> Option<Vec<Segment<'_>>> {
    let mut out = Vec::new();
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            out.push(Segment::Key(key));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            out.push(Segment::Index(stripped[..end].parse().ok()?));
            rest = &stripped[end + 1..];
        }
    }
    Some(out)
}

fn walk<'v>(root: &'v Value, rest: &str) -> Option<&'v Value> {
    let mut node = root;
    for seg in segments(rest)? {
        node = match (seg, node) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(items)) => items.get(i)?,
            (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_then_nested_lookup() {
        let mut store = VariableStore::new();
        store.set_value(
            "form_0.application_body",
            json!({"items": [{"name": "a"}, {"name": "b"}], "count": 2}),
        );
        store.set_value("form_0.application_body.count", json!(5));

        assert_eq!(store.get("form_0.application_body.count"), Some(&json!(5)));
        assert_eq!(
            store.get("form_0.application_body.items[1].name"),
            Some(&json!("b"))
        );
        assert_eq!(store.get("form_0.application_body.items.0.name"), Some(&json!("a")));
        assert_eq!(store.get("form_0.missing"), None);
        assert_eq!(store.get("Form_0.application_body"), None);
    }

    #[test]
    fn test_set_empty_path_is_ignored() {
        let mut store = VariableStore::new();
        store.set_value("", json!(1));
        assert!(store.grab().is_empty());
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut store = VariableStore::new();
        for key in ["z", "a", "m"] {
            store.set_value(&format!("b.{key}"), json!(key));
        }
        let keys: Vec<&String> = store.grab().keys().collect();
        assert_eq!(keys, ["b.z", "b.a", "b.m"]);
    }

    #[test]
    fn test_steps_do_not_repeat_last() {
        let mut store = VariableStore::new();
        store.add_step("start_0");
        store.add_step("start_0");
        store.add_step("approver_0");
        store.add_step("start_0");
        assert_eq!(store.steps(), ["start_0", "approver_0", "start_0"]);
    }

    #[test]
    fn test_clear_values_only_touches_block() {
        let mut store = VariableStore::new();
        store.set_value("a.x", json!(1));
        store.set_value("ab.x", json!(2));
        store.clear_values("a");
        assert_eq!(store.get("a.x"), None);
        assert_eq!(store.get("ab.x"), Some(&json!(2)));
    }

    #[test]
    fn test_restore_nests_keys() {
        let mut flat = Map::new();
        flat.insert("a.b".into(), json!(1));
        flat.insert("a.c.d".into(), json!("x"));
        flat.insert("e".into(), json!(true));
        assert_eq!(
            VariableStore::restore(&flat),
            json!({"a": {"b": 1, "c": {"d": "x"}}, "e": true})
        );
    }

    #[test]
    fn test_from_parameters() {
        let store = VariableStore::from_parameters("pipe", &json!({"amount": 10}));
        assert_eq!(store.get("pipe.amount"), Some(&json!(10)));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn set_then_get_returns_value(block in "[a-z]{1,8}_[0-9]", key in "[a-z]{1,8}", n in any::<i64>()) {
                let mut store = VariableStore::new();
                let path = format!("{block}.{key}");
                store.set_value(&path, json!(n));
                prop_assert_eq!(store.get(&path), Some(&json!(n)));
            }
        }
    }
}
