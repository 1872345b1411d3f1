//! `[output_of_step_N]` placeholder substitution.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[output_of_step_(\d+)\]").unwrap());

/// Replace every placeholder whose step output is known. Unknown references
/// are left verbatim so the generator still sees what was asked for.
pub fn resolve_text(text: &str, outputs: &BTreeMap<u32, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| {
            caps[1]
                .parse::<u32>()
                .ok()
                .and_then(|id| outputs.get(&id))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolve placeholders in every string nested inside `value`.
pub fn resolve_value(value: &Value, outputs: &BTreeMap<u32, String>) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_text(s, outputs)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, outputs))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> BTreeMap<u32, String> {
        BTreeMap::from([(1, "alpha".to_string()), (2, "beta".to_string())])
    }

    #[test]
    fn substitutes_known_and_keeps_unknown() {
        let text = "use [output_of_step_1] and [output_of_step_2], not [output_of_step_7]";
        assert_eq!(
            resolve_text(text, &outputs()),
            "use alpha and beta, not [output_of_step_7]"
        );
    }

    #[test]
    fn resolves_nested_parameters() {
        let params = json!({"content": "[output_of_step_2]", "tags": ["[output_of_step_1]", 3]});
        assert_eq!(
            resolve_value(&params, &outputs()),
            json!({"content": "beta", "tags": ["alpha", 3]})
        );
    }
}
