use serde_json::Value;

/// Renders a JSON document as a single line of `path=value` entries, e.g.
///  `{"a":{"b":[1,null,"x"]}}` becomes `a.b[0]=1, a.b[2]="x"`.
///
/// Null array elements are skipped, a null leaf anywhere else is rendered as `<path>null`.
///  Scalar values are rendered as JSON, i.e. strings keep their quotes.
pub fn to_flat_text(json: &Value) -> String {
    flatten(json, "")
}

fn flatten(json: &Value, prefix: &str) -> String {
    match json {
        Value::Array(elements) => {
            let parts = elements.iter()
                .enumerate()
                .filter(|(_, e)| !e.is_null())
                .map(|(i, e)| flatten(e, &format!("{}[{}]", prefix, i)));
            join(parts)
        }
        Value::Object(fields) => {
            let parts = fields.iter()
                .map(|(key, value)| {
                    let path = if prefix.is_empty() {
                        key.clone()
                    }
                    else {
                        format!("{}.{}", prefix, key)
                    };
                    flatten(value, &path)
                });
            join(parts)
        }
        Value::Null => format!("{}null", prefix),
        scalar => format!("{}={}", prefix, scalar),
    }
}

/// A separator is only added after a non-empty prefix, so empty parts at the start vanish
fn join(parts: impl Iterator<Item = String>) -> String {
    let mut result = String::new();
    for part in parts {
        if !result.is_empty() {
            result.push_str(", ");
        }
        result.push_str(&part);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::scalar_root(json!(5), "=5")]
    #[case::string_root(json!("abc"), "=\"abc\"")]
    #[case::null_root(json!(null), "null")]
    #[case::flat_object(json!({"a": 1, "b": "x", "c": true}), "a=1, b=\"x\", c=true")]
    #[case::nested(json!({"a": {"b": [1, null, "x"]}}), "a.b[0]=1, a.b[2]=\"x\"")]
    #[case::null_field(json!({"a": null, "b": 2}), "anull, b=2")]
    #[case::array_root(json!([{"k": 1}, [2, 3]]), "[0].k=1, [1][0]=2, [1][1]=3")]
    #[case::empty_object(json!({}), "")]
    #[case::empty_nested_first(json!({"a": {}, "b": 1}), "b=1")]
    #[case::empty_nested_last(json!({"b": 1, "a": []}), "b=1, ")]
    #[case::key_order_preserved(json!({"time": "t", "category": "c", "properties": {"z": 1, "a": 2}}), "time=\"t\", category=\"c\", properties.z=1, properties.a=2")]
    fn test_to_flat_text(#[case] json: Value, #[case] expected: &str) {
        assert_eq!(to_flat_text(&json), expected);
    }
}
