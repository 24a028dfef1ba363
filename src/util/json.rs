//! Canonical JSON rendering for digest inputs.

use serde_json::Value;

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Two values that are structurally equal always render to the same string,
/// regardless of original key order. Arrays keep their order.
pub(crate) fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_depth() {
        let value = json!({"b": {"d": 1, "c": 2}, "a": 3});
        assert_eq!(canonical_string(&value), r#"{"a":3,"b":{"c":2,"d":1}}"#);
    }

    #[test]
    fn key_order_does_not_change_rendering() {
        let left = json!({"x": 1, "y": [1, 2, {"b": 1, "a": 2}]});
        let right = json!({"y": [1, 2, {"a": 2, "b": 1}], "x": 1});
        assert_eq!(canonical_string(&left), canonical_string(&right));
    }

    #[test]
    fn arrays_keep_their_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonical_string(&value), "[3,1,2]");
    }

    #[test]
    fn scalars_render_as_plain_json() {
        assert_eq!(canonical_string(&json!("text")), r#""text""#);
        assert_eq!(canonical_string(&json!(0)), "0");
        assert_eq!(canonical_string(&json!(false)), "false");
        assert_eq!(canonical_string(&json!(null)), "null");
    }
}
