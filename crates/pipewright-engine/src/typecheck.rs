//! Value checks against JSON-Schema-like primitive types.

use serde_json::Value;

/// Whether `value` fits the declared `type_name`.
///
/// Accepts `string`, `integer`, `number`, `boolean`, `array` and `object`.
/// `null` is only valid for `object` and `array`. An empty or unknown type
/// never matches.
pub fn is_type_correct(type_name: &str, value: &Value) -> bool {
    match (type_name, value) {
        ("object" | "array", Value::Null) => true,
        ("string", Value::String(_)) => true,
        ("integer", Value::Number(n)) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        ("number", Value::Number(_)) => true,
        ("boolean", Value::Bool(_)) => true,
        ("array", Value::Array(_)) => true,
        ("object", Value::Object(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitives() {
        assert!(is_type_correct("string", &json!("x")));
        assert!(is_type_correct("integer", &json!(3)));
        assert!(is_type_correct("integer", &json!(3.0)));
        assert!(!is_type_correct("integer", &json!(3.5)));
        assert!(is_type_correct("number", &json!(3.5)));
        assert!(is_type_correct("boolean", &json!(false)));
        assert!(is_type_correct("array", &json!([1])));
        assert!(is_type_correct("object", &json!({"a": 1})));
    }

    #[test]
    fn test_null_only_for_containers() {
        assert!(is_type_correct("object", &Value::Null));
        assert!(is_type_correct("array", &Value::Null));
        assert!(!is_type_correct("string", &Value::Null));
        assert!(!is_type_correct("integer", &Value::Null));
    }

    #[test]
    fn test_mismatch_and_empty_type() {
        assert!(!is_type_correct("string", &json!(1)));
        assert!(!is_type_correct("boolean", &json!("true")));
        assert!(!is_type_correct("", &json!("x")));
        assert!(!is_type_correct("date", &json!("2024-01-01")));
    }
}
